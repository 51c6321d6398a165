//! Network link management over rtnetlink.

use async_trait::async_trait;
use netlink_packet_route::link::InfoData;
use netlink_packet_route::link::InfoIpVlan;
use netlink_packet_route::link::InfoKind;
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::link::LinkFlag;
use netlink_packet_route::link::LinkInfo;
use netlink_packet_route::link::LinkMessage;
use nix::errno::Errno;
use rtnetlink::new_connection;
use rtnetlink::Handle;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use super::PlatformError;

/// Macvlan forwarding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum MacvlanMode {
    #[display("private")]
    Private,
    #[display("vepa")]
    Vepa,
    #[display("bridge")]
    Bridge,
}

impl MacvlanMode {
    /// Parses a configured mode; no mode means bridge.
    pub fn parse(mode: Option<&str>) -> Option<Self> {
        match mode.unwrap_or("") {
            "" | "bridge" => Some(Self::Bridge),
            "vepa" => Some(Self::Vepa),
            "private" => Some(Self::Private),
            _ => None,
        }
    }

    /// `MACVLAN_MODE_*` from `if_link.h`.
    fn as_raw(self) -> u32 {
        match self {
            Self::Private => 1,
            Self::Vepa => 2,
            Self::Bridge => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum IpvlanMode {
    #[display("l2")]
    L2,
    #[display("l3")]
    L3,
}

impl IpvlanMode {
    /// Parses a configured mode; no mode means l2.
    pub fn parse(mode: Option<&str>) -> Option<Self> {
        match mode.unwrap_or("") {
            "" | "l2" => Some(Self::L2),
            "l3" => Some(Self::L3),
            _ => None,
        }
    }

    /// `IPVLAN_MODE_*` from `if_link.h`.
    fn as_raw(self) -> u16 {
        match self {
            Self::L2 => 0,
            Self::L3 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum IpoibMode {
    #[display("datagram")]
    Datagram,
    #[display("connected")]
    Connected,
}

impl IpoibMode {
    /// Parses a configured mode; no mode means datagram.
    pub fn parse(mode: Option<&str>) -> Option<Self> {
        match mode.unwrap_or("") {
            "" | "datagram" => Some(Self::Datagram),
            "connected" => Some(Self::Connected),
            _ => None,
        }
    }
}

/// Link flavour to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Dummy,
    Veth { peer: String },
    Macvlan { parent: String, mode: MacvlanMode },
    Ipvlan { parent: String, mode: IpvlanMode },
    Ipoib { parent: String, pkey: u16, mode: IpoibMode },
}

/// Request to create one link in the current network namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLink {
    pub name: String,
    pub kind: LinkKind,
    pub mtu: Option<u32>,
}

impl NewLink {
    pub fn new(name: impl Into<String>, kind: LinkKind) -> Self {
        Self {
            name: name.into(),
            kind,
            mtu: None,
        }
    }

    pub fn with_mtu(mut self, mtu: Option<u32>) -> Self {
        self.mtu = mtu;
        self
    }
}

/// Link operations in the driver's own network namespace.
///
/// Lookups by name treat a missing link as a normal outcome, not an error.
#[async_trait]
pub trait LinkOps: Send + Sync {
    /// Creates the link and applies its MTU. A link that fails MTU setup is
    /// removed again before the error is returned.
    async fn add(&self, link: &NewLink) -> Result<(), PlatformError>;

    async fn exists(&self, name: &str) -> Result<bool, PlatformError>;

    async fn set_mtu(&self, name: &str, mtu: u32) -> Result<(), PlatformError>;

    async fn set_up(&self, name: &str) -> Result<(), PlatformError>;

    async fn set_down(&self, name: &str) -> Result<(), PlatformError>;

    /// Deletes the link; returns `false` when it was already gone.
    async fn delete(&self, name: &str) -> Result<bool, PlatformError>;
}

/// [`LinkOps`] backed by an rtnetlink connection.
#[derive(Clone)]
pub struct RtnetlinkLinks {
    handle: Handle,
}

impl RtnetlinkLinks {
    /// Opens a route netlink connection; must be called inside a tokio runtime.
    pub fn connect() -> Result<Self, PlatformError> {
        let (connection, handle, _) = new_connection()?;
        tokio::spawn(connection);
        debug!("rtnetlink connection established");
        Ok(Self { handle })
    }

    fn index_of(name: &str) -> Result<Option<u32>, PlatformError> {
        match nix::net::if_::if_nametoindex(name) {
            Ok(index) => Ok(Some(index)),
            Err(Errno::ENODEV) => Ok(None),
            Err(e) => Err(PlatformError::netlink(format!("lookup {name}"), e)),
        }
    }

    fn require_index(name: &str) -> Result<u32, PlatformError> {
        Self::index_of(name)?.ok_or_else(|| PlatformError::NotFound {
            kind: "link",
            name: name.to_string(),
        })
    }

    async fn add_ipoib(
        name: &str,
        parent: &str,
        pkey: u16,
        mode: IpoibMode,
    ) -> Result<(), PlatformError> {
        Self::require_index(parent)?;

        // rtnetlink has no IPoIB builder; iproute2 speaks IFLA_IPOIB_* for us.
        let pkey = format!("{pkey:#06x}");
        let mode = mode.to_string();
        let args = [
            "link",
            "add",
            "link",
            parent,
            "name",
            name,
            "type",
            "ipoib",
            "pkey",
            pkey.as_str(),
            "mode",
            mode.as_str(),
        ];
        let output = Command::new("ip").args(args).output().await?;
        if !output.status.success() {
            return Err(PlatformError::Command {
                command: format!("ip {}", args.join(" ")),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LinkOps for RtnetlinkLinks {
    async fn add(&self, link: &NewLink) -> Result<(), PlatformError> {
        let name = link.name.clone();
        let request = self.handle.link().add();
        let request = match &link.kind {
            LinkKind::Dummy => request.dummy(name),
            LinkKind::Veth { peer } => request.veth(name, peer.clone()),
            LinkKind::Macvlan { parent, mode } => {
                request.macvlan(name, Self::require_index(parent)?, mode.as_raw())
            }
            LinkKind::Ipvlan { parent, mode } => {
                let index = Self::require_index(parent)?;
                let mut request = request.name(name);
                fill_ipvlan(request.message_mut(), index, *mode);
                request
            }
            LinkKind::Ipoib { parent, pkey, mode } => {
                Self::add_ipoib(&link.name, parent, *pkey, *mode).await?;
                return self.apply_mtu(link).await;
            }
        };

        request
            .execute()
            .await
            .map_err(|e| PlatformError::netlink(format!("add {}", link.name), e))?;

        self.apply_mtu(link).await
    }

    async fn exists(&self, name: &str) -> Result<bool, PlatformError> {
        Ok(Self::index_of(name)?.is_some())
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> Result<(), PlatformError> {
        let index = Self::require_index(name)?;
        self.handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(|e| PlatformError::netlink(format!("set mtu {mtu} on {name}"), e))
    }

    async fn set_up(&self, name: &str) -> Result<(), PlatformError> {
        let index = Self::require_index(name)?;
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| PlatformError::netlink(format!("set {name} up"), e))
    }

    async fn set_down(&self, name: &str) -> Result<(), PlatformError> {
        let index = Self::require_index(name)?;
        self.handle
            .link()
            .set(index)
            .down()
            .execute()
            .await
            .map_err(|e| PlatformError::netlink(format!("set {name} down"), e))
    }

    async fn delete(&self, name: &str) -> Result<bool, PlatformError> {
        let Some(index) = Self::index_of(name)? else {
            return Ok(false);
        };
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| PlatformError::netlink(format!("delete {name}"), e))?;
        Ok(true)
    }
}

/// rtnetlink 0.14 has no ipvlan builder, so the attributes are written into
/// the request message directly: `ip link add NAME link PARENT type ipvlan mode MODE`.
fn fill_ipvlan(message: &mut LinkMessage, parent_index: u32, mode: IpvlanMode) {
    message.attributes.push(LinkAttribute::LinkInfo(vec![
        LinkInfo::Kind(InfoKind::IpVlan),
        LinkInfo::Data(InfoData::IpVlan(vec![InfoIpVlan::Mode(mode.as_raw())])),
    ]));
    message.attributes.push(LinkAttribute::Link(parent_index));
    message.header.flags.push(LinkFlag::Up);
    message.header.change_mask.push(LinkFlag::Up);
}

impl RtnetlinkLinks {
    async fn apply_mtu(&self, link: &NewLink) -> Result<(), PlatformError> {
        let Some(mtu) = link.mtu else {
            return Ok(());
        };
        if let Err(e) = self.set_mtu(&link.name, mtu).await {
            if let Err(cleanup) = self.delete(&link.name).await {
                warn!(link = %link.name, error = %cleanup, "failed to remove link after MTU error");
            }
            return Err(e);
        }
        Ok(())
    }
}
