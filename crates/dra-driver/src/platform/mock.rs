//! In-memory host capabilities for tests.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::thread::ThreadId;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::link::LinkKind;
use super::LinkOps;
use super::NetnsMode;
use super::NewLink;
use super::PlatformError;
use super::RdmaOps;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockLink {
    pub kind: Option<LinkKind>,
    pub mtu: Option<u32>,
    pub up: bool,
}

#[derive(Default)]
struct LinkState {
    links: BTreeMap<String, MockLink>,
    failures: BTreeSet<(String, String)>,
    calls: Vec<String>,
}

/// Links that exist only in memory. Clones share state.
#[derive(Clone, Default)]
pub struct MockLinks {
    state: Arc<Mutex<LinkState>>,
}

impl MockLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pre-existing host link such as a physical parent.
    pub fn with_link(self, name: &str) -> Self {
        self.state.lock().links.insert(
            name.to_string(),
            MockLink {
                kind: None,
                mtu: None,
                up: false,
            },
        );
        self
    }

    /// Makes `op` (`add`, `set_mtu`, `set_up`, `set_down`, `delete`) fail for `name`.
    pub fn fail_on(self, op: &str, name: &str) -> Self {
        self.state
            .lock()
            .failures
            .insert((op.to_string(), name.to_string()));
        self
    }

    pub fn has(&self, name: &str) -> bool {
        self.state.lock().links.contains_key(name)
    }

    pub fn link(&self, name: &str) -> Option<MockLink> {
        self.state.lock().links.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.state.lock().links.keys().cloned().collect()
    }

    /// Recorded calls as `op name`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn record(state: &mut LinkState, op: &str, name: &str) -> Result<(), PlatformError> {
        state.calls.push(format!("{op} {name}"));
        if state.failures.contains(&(op.to_string(), name.to_string())) {
            return Err(PlatformError::netlink(format!("{op} {name}"), "injected failure"));
        }
        Ok(())
    }

    fn require(state: &LinkState, name: &str) -> Result<(), PlatformError> {
        if state.links.contains_key(name) {
            Ok(())
        } else {
            Err(PlatformError::NotFound {
                kind: "link",
                name: name.to_string(),
            })
        }
    }
}

#[async_trait]
impl LinkOps for MockLinks {
    async fn add(&self, link: &NewLink) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        Self::record(&mut state, "add", &link.name)?;
        if state.links.contains_key(&link.name) {
            return Err(PlatformError::netlink(
                format!("add {}", link.name),
                "File exists (os error 17)",
            ));
        }
        match &link.kind {
            LinkKind::Macvlan { parent, .. }
            | LinkKind::Ipvlan { parent, .. }
            | LinkKind::Ipoib { parent, .. } => Self::require(&state, parent)?,
            LinkKind::Veth { peer } => {
                state.links.insert(
                    peer.clone(),
                    MockLink {
                        kind: Some(LinkKind::Veth {
                            peer: link.name.clone(),
                        }),
                        mtu: None,
                        up: false,
                    },
                );
            }
            LinkKind::Dummy => {}
        }
        if link.mtu.is_some() {
            if let Err(e) = Self::record(&mut state, "set_mtu", &link.name) {
                if let LinkKind::Veth { peer } = &link.kind {
                    state.links.remove(peer);
                }
                return Err(e);
            }
        }
        state.links.insert(
            link.name.clone(),
            MockLink {
                kind: Some(link.kind.clone()),
                mtu: link.mtu,
                up: false,
            },
        );
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool, PlatformError> {
        Ok(self.has(name))
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        Self::record(&mut state, "set_mtu", name)?;
        Self::require(&state, name)?;
        if let Some(link) = state.links.get_mut(name) {
            link.mtu = Some(mtu);
        }
        Ok(())
    }

    async fn set_up(&self, name: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        Self::record(&mut state, "set_up", name)?;
        Self::require(&state, name)?;
        if let Some(link) = state.links.get_mut(name) {
            link.up = true;
        }
        Ok(())
    }

    async fn set_down(&self, name: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        Self::record(&mut state, "set_down", name)?;
        Self::require(&state, name)?;
        if let Some(link) = state.links.get_mut(name) {
            link.up = false;
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool, PlatformError> {
        let mut state = self.state.lock();
        Self::record(&mut state, "delete", name)?;
        let Some(link) = state.links.remove(name) else {
            return Ok(false);
        };
        if let Some(LinkKind::Veth { peer }) = link.kind {
            state.links.remove(&peer);
        }
        Ok(true)
    }
}

struct RdmaState {
    mode: Result<NetnsMode, String>,
    devices: BTreeMap<String, u32>,
    failing: BTreeSet<String>,
    moves: Vec<String>,
    move_threads: Vec<ThreadId>,
    mode_queries: usize,
}

/// RDMA devices that exist only in memory. Clones share state.
#[derive(Clone)]
pub struct MockRdma {
    state: Arc<Mutex<RdmaState>>,
}

impl MockRdma {
    pub fn new(mode: NetnsMode) -> Self {
        Self {
            state: Arc::new(Mutex::new(RdmaState {
                mode: Ok(mode),
                devices: BTreeMap::new(),
                failing: BTreeSet::new(),
                moves: Vec::new(),
                move_threads: Vec::new(),
                mode_queries: 0,
            })),
        }
    }

    /// A subsystem whose mode query fails.
    pub fn broken() -> Self {
        let rdma = Self::new(NetnsMode::Shared);
        rdma.state.lock().mode = Err("operation not supported".to_string());
        rdma
    }

    pub fn with_device(self, ib_dev: &str) -> Self {
        {
            let mut state = self.state.lock();
            let index = state.devices.len() as u32;
            state.devices.insert(ib_dev.to_string(), index);
        }
        self
    }

    /// Makes moving `ib_dev` fail.
    pub fn fail_move(self, ib_dev: &str) -> Self {
        self.state.lock().failing.insert(ib_dev.to_string());
        self
    }

    /// Names of the devices moved so far, in order.
    pub fn moves(&self) -> Vec<String> {
        self.state.lock().moves.clone()
    }

    /// Threads that performed each successful move.
    pub fn move_threads(&self) -> Vec<ThreadId> {
        self.state.lock().move_threads.clone()
    }

    pub fn mode_queries(&self) -> usize {
        self.state.lock().mode_queries
    }
}

impl RdmaOps for MockRdma {
    fn netns_mode(&self) -> Result<NetnsMode, PlatformError> {
        let mut state = self.state.lock();
        state.mode_queries += 1;
        state
            .mode
            .clone()
            .map_err(|e| PlatformError::netlink("rdma sys get", e))
    }

    fn find_device(&self, ib_dev: &str) -> Result<Option<u32>, PlatformError> {
        Ok(self.state.lock().devices.get(ib_dev).copied())
    }

    fn set_netns(&self, index: u32, _netns: BorrowedFd<'_>) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        let Some(name) = state
            .devices
            .iter()
            .find(|(_, i)| **i == index)
            .map(|(name, _)| name.clone())
        else {
            return Err(PlatformError::NotFound {
                kind: "rdma device",
                name: index.to_string(),
            });
        };
        if state.failing.contains(&name) {
            return Err(PlatformError::netlink("rdma dev set", "injected failure"));
        }
        state.moves.push(name);
        state.move_threads.push(std::thread::current().id());
        Ok(())
    }
}
