//! RDMA device control over the `NETLINK_RDMA` nldev interface.
//!
//! No crate in our stack speaks the RDMA netlink family, so requests are
//! encoded by hand on a raw `AF_NETLINK` socket. Every request opens its own
//! socket: the socket is bound to the network namespace of the calling
//! thread, which matters when the caller has entered a pod namespace.

use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;

use super::PlatformError;

const NETLINK_RDMA: libc::c_int = 20;

const NLMSG_HDR_LEN: usize = 16;
const NLA_HDR_LEN: usize = 4;
const NLA_TYPE_MASK: u16 = 0x3fff;

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_DUMP: u16 = 0x0300;

const RDMA_NL_NLDEV: u16 = 5;
const RDMA_NLDEV_CMD_GET: u16 = 1;
const RDMA_NLDEV_CMD_SET: u16 = 2;
const RDMA_NLDEV_CMD_SYS_GET: u16 = 6;

const RDMA_NLDEV_ATTR_DEV_INDEX: u16 = 1;
const RDMA_NLDEV_ATTR_DEV_NAME: u16 = 2;
const RDMA_NLDEV_SYS_ATTR_NETNS_MODE: u16 = 66;
const RDMA_NLDEV_NET_NS_FD: u16 = 68;

/// System-wide RDMA network namespace mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum NetnsMode {
    /// Every namespace sees every RDMA device.
    #[display("shared")]
    Shared,
    /// A device belongs to exactly one namespace and must be moved.
    #[display("exclusive")]
    Exclusive,
}

impl NetnsMode {
    fn from_raw(value: u8) -> Self {
        if value == 0 {
            Self::Exclusive
        } else {
            Self::Shared
        }
    }
}

/// RDMA device operations in the calling thread's network namespace.
pub trait RdmaOps: Send + Sync {
    /// Equivalent of `rdma system show netns`.
    fn netns_mode(&self) -> Result<NetnsMode, PlatformError>;

    /// Kernel index of the IB device, `None` when it is not visible here.
    fn find_device(&self, ib_dev: &str) -> Result<Option<u32>, PlatformError>;

    /// Moves the device into the namespace referred to by `netns`.
    fn set_netns(&self, index: u32, netns: BorrowedFd<'_>) -> Result<(), PlatformError>;
}

/// [`RdmaOps`] implemented with raw nldev requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct RdmaNetlink;

impl RdmaOps for RdmaNetlink {
    fn netns_mode(&self) -> Result<NetnsMode, PlatformError> {
        let mut socket = NlSocket::open()?;
        let replies = socket.request(RDMA_NLDEV_CMD_SYS_GET, NLM_F_ACK, &[])?;

        replies
            .iter()
            .find_map(|payload| {
                parse_attrs(payload)
                    .get(&RDMA_NLDEV_SYS_ATTR_NETNS_MODE)
                    .and_then(|value| value.first().copied())
            })
            .map(NetnsMode::from_raw)
            .ok_or_else(|| PlatformError::netlink("rdma sys get", "netns mode attribute missing"))
    }

    fn find_device(&self, ib_dev: &str) -> Result<Option<u32>, PlatformError> {
        let mut socket = NlSocket::open()?;
        let replies = socket.request(RDMA_NLDEV_CMD_GET, NLM_F_DUMP, &[])?;

        for payload in &replies {
            let attrs = parse_attrs(payload);
            let name = attrs.get(&RDMA_NLDEV_ATTR_DEV_NAME).map(|raw| attr_string(raw));
            if name.as_deref() != Some(ib_dev) {
                continue;
            }
            return match attrs.get(&RDMA_NLDEV_ATTR_DEV_INDEX).and_then(|raw| attr_u32(raw)) {
                Some(index) => Ok(Some(index)),
                None => Err(PlatformError::netlink(
                    "rdma dev get",
                    format!("device {ib_dev} has no index attribute"),
                )),
            };
        }
        Ok(None)
    }

    fn set_netns(&self, index: u32, netns: BorrowedFd<'_>) -> Result<(), PlatformError> {
        let fd = u32::try_from(netns.as_raw_fd())
            .map_err(|_| PlatformError::netlink("rdma dev set", "negative namespace fd"))?;

        let mut attrs = Vec::with_capacity(16);
        push_attr(&mut attrs, RDMA_NLDEV_ATTR_DEV_INDEX, &index.to_ne_bytes());
        push_attr(&mut attrs, RDMA_NLDEV_NET_NS_FD, &fd.to_ne_bytes());

        let mut socket = NlSocket::open()?;
        socket.request(RDMA_NLDEV_CMD_SET, NLM_F_ACK, &attrs)?;
        Ok(())
    }
}

fn nldev_type(op: u16) -> u16 {
    (RDMA_NL_NLDEV << 10) + op
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn push_attr(buf: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    let len = NLA_HDR_LEN + value.len();
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(value);
    buf.resize(buf.len() + align4(len) - len, 0);
}

/// Top-level attributes of one message payload, keyed by type.
fn parse_attrs(payload: &[u8]) -> BTreeMap<u16, &[u8]> {
    let mut attrs = BTreeMap::new();
    let mut offset = 0;
    while offset + NLA_HDR_LEN <= payload.len() {
        let len = u16::from_ne_bytes([payload[offset], payload[offset + 1]]) as usize;
        let attr_type = u16::from_ne_bytes([payload[offset + 2], payload[offset + 3]]);
        if len < NLA_HDR_LEN || offset + len > payload.len() {
            break;
        }
        attrs.insert(
            attr_type & NLA_TYPE_MASK,
            &payload[offset + NLA_HDR_LEN..offset + len],
        );
        offset += align4(len);
    }
    attrs
}

fn attr_u32(raw: &[u8]) -> Option<u32> {
    raw.get(..4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_ne_bytes)
}

fn attr_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

struct NlSocket {
    fd: OwnedFd,
    seq: u32,
}

impl NlSocket {
    fn open() -> io::Result<Self> {
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_RDMA,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { fd, seq: 0 })
    }

    /// Sends one request and collects the payloads of all data replies until
    /// the kernel acknowledges or finishes the dump.
    fn request(
        &mut self,
        op: u16,
        flags: u16,
        attrs: &[u8],
    ) -> Result<Vec<Vec<u8>>, PlatformError> {
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        let operation = format!("rdma op {op}");

        let len = NLMSG_HDR_LEN + attrs.len();
        let mut msg = Vec::with_capacity(len);
        msg.extend_from_slice(&(len as u32).to_ne_bytes());
        msg.extend_from_slice(&nldev_type(op).to_ne_bytes());
        msg.extend_from_slice(&(NLM_F_REQUEST | flags).to_ne_bytes());
        msg.extend_from_slice(&seq.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        msg.extend_from_slice(attrs);

        let sent = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
            )
        };
        if sent < 0 {
            return Err(PlatformError::netlink(operation, io::Error::last_os_error()));
        }

        let mut replies = Vec::new();
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let received = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if received < 0 {
                return Err(PlatformError::netlink(operation, io::Error::last_os_error()));
            }
            let received = received as usize;

            let mut offset = 0;
            while offset + NLMSG_HDR_LEN <= received {
                let header = &buf[offset..offset + NLMSG_HDR_LEN];
                let msg_len = u32::from_ne_bytes([header[0], header[1], header[2], header[3]])
                    as usize;
                let msg_type = u16::from_ne_bytes([header[4], header[5]]);
                let msg_seq = u32::from_ne_bytes([header[8], header[9], header[10], header[11]]);
                if msg_len < NLMSG_HDR_LEN || offset + msg_len > received {
                    return Err(PlatformError::netlink(operation, "truncated reply"));
                }
                let payload = &buf[offset + NLMSG_HDR_LEN..offset + msg_len];
                offset += align4(msg_len);

                if msg_seq != seq {
                    continue;
                }
                match msg_type {
                    NLMSG_DONE => return Ok(replies),
                    NLMSG_ERROR => {
                        let code = payload
                            .get(..4)
                            .and_then(|b| b.try_into().ok())
                            .map(i32::from_ne_bytes)
                            .unwrap_or(0);
                        if code != 0 {
                            return Err(PlatformError::netlink(
                                operation,
                                io::Error::from_raw_os_error(-code),
                            ));
                        }
                        return Ok(replies);
                    }
                    _ => replies.push(payload.to_vec()),
                }
            }
        }
    }
}
