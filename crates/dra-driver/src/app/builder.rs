use std::fs;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;

use crate::app::Application;
use crate::app::ApplicationServices;
use crate::config::DaemonArgs;
use crate::discovery::Discovery;
use crate::discovery::SlicePublisher;
use crate::driver::CdiStore;
use crate::driver::Driver;
use crate::handler::combo::RoceHandler;
use crate::handler::netdev;
use crate::handler::rdma;
use crate::handler::rdma::UverbsHandler;
use crate::handler::DeviceHandler;
use crate::handler::Registry;
use crate::kubelet::KubeClaimSource;
use crate::kubelet::ResourceApi;
use crate::kubelet::SocketPaths;
use crate::platform::HostPaths;
use crate::platform::LinkOps;
use crate::platform::NetnsMode;
use crate::platform::RdmaNetlink;
use crate::platform::RtnetlinkLinks;
use crate::sandbox::RelocationTracker;
use crate::sandbox::Relocator;
use crate::sandbox::SandboxCoordinator;

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Build complete application
    pub async fn build(self) -> Result<Application> {
        let args = &self.daemon_args;
        tracing::info!(
            driver = %args.driver_name,
            node = %args.node_name,
            "building application components"
        );
        if args.node_name.is_empty() {
            anyhow::bail!("node name is required (use --node-name or NODE_NAME)");
        }

        let mode = rdma::mode::netns_mode();
        let paths = HostPaths::default();
        let links: Arc<dyn LinkOps> =
            Arc::new(RtnetlinkLinks::connect().context("open rtnetlink connection")?);

        // Shared between the uverbs handler, which queues moves at prepare
        // time, and the coordinator, which performs them.
        let tracker = Arc::new(RelocationTracker::new());
        let relocator = Arc::new(Relocator::new(Arc::new(RdmaNetlink)));

        let registry = Arc::new(build_registry(
            links,
            paths.clone(),
            mode,
            tracker.clone(),
            relocator.clone(),
        ));
        for (device_type, kinds) in registry.list_registered() {
            tracing::info!(%device_type, ?kinds, "registered handlers");
        }

        let plugin_dir = args.plugin_dir();
        fs::create_dir_all(&plugin_dir)
            .with_context(|| format!("create plugin directory {}", plugin_dir.display()))?;

        let driver = Arc::new(Driver::new(
            args.driver_name.clone(),
            registry,
            CdiStore::new(&args.cdi_dir, &args.driver_name),
        ));

        let api = ResourceApi::connect(args.kubeconfig.as_deref())
            .await
            .map_err(|e| anyhow::anyhow!("{e:?}"))?;

        let sockets = SocketPaths::new(
            &args.plugins_dir,
            &args.registry_dir,
            &args.driver_name,
            args.pod_uid.as_deref(),
        );
        if let Some(pod_uid) = args.pod_uid.as_deref().filter(|uid| !uid.is_empty()) {
            tracing::info!(pod_uid, "rolling update mode enabled");
        }

        let sandbox_coordinator = (mode == NetnsMode::Exclusive)
            .then(|| Arc::new(SandboxCoordinator::new(tracker.clone(), relocator)));

        let (publisher, devices) = if args.publish_resources {
            let devices = Discovery::new(args.driver_name.clone(), paths, mode).discover();
            let publisher = SlicePublisher::new(
                api.clone(),
                args.driver_name.clone(),
                args.node_name.clone(),
            );
            (Some(Arc::new(publisher)), devices)
        } else {
            (None, Vec::new())
        };

        let services = ApplicationServices {
            driver,
            claims: Arc::new(KubeClaimSource::new(api)),
            sockets,
            tracker,
            sandbox_coordinator,
            publisher,
            devices,
        };
        Ok(Application::new(services, self.daemon_args))
    }
}

/// Every handler this driver serves. The roce combo pairs uverbs with a
/// dummy interface for the network side.
pub fn build_registry(
    links: Arc<dyn LinkOps>,
    paths: HostPaths,
    mode: NetnsMode,
    tracker: Arc<RelocationTracker>,
    relocator: Arc<Relocator>,
) -> Registry {
    let mut registry = Registry::new();
    for handler in netdev::handlers(links.clone(), paths.clone()) {
        registry.register(handler);
    }

    let uverbs: Arc<dyn DeviceHandler> = Arc::new(
        UverbsHandler::new(paths)
            .with_relocation(tracker, relocator)
            .with_mode(mode),
    );
    registry.register(uverbs.clone());

    let dummy: Arc<dyn DeviceHandler> = Arc::new(netdev::DummyHandler::new(links));
    registry.register(Arc::new(RoceHandler::new(uverbs, dummy)));
    registry
}
