use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::DaemonArgs;

/// State the process leaves behind when it stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Claims whose CDI spec and sidecar stay on disk for the next process.
    pub prepared_claims: usize,
    /// Queued RDMA moves whose sandbox never started.
    pub pending_moves: usize,
    /// RDMA devices still inside pod namespaces.
    pub active_moves: usize,
}

/// The running driver: kubelet-facing servers plus the sandbox coordinator.
pub struct Application {
    services: ApplicationServices,
    daemon_args: DaemonArgs,
}

impl Application {
    pub fn new(services: ApplicationServices, daemon_args: DaemonArgs) -> Self {
        Self {
            services,
            daemon_args,
        }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Recovers prepared claims, serves until a signal arrives or a server
    /// stops, then reports what is left behind.
    pub async fn run(&self) -> Result<()> {
        self.recover();

        let mut tasks = Tasks::new();
        if let Err(e) = tasks.spawn_all_tasks(self) {
            tracing::error!("Failed to spawn driver tasks: {}", e);
            return Err(e);
        }

        let outcome = tasks.wait_for_completion().await;
        if let Err(e) = &outcome {
            tracing::error!("Driver stopped with error: {}", e);
        }

        self.shutdown();
        outcome
    }

    /// Loads allocation sidecars so claims prepared by a previous process
    /// can still be released.
    pub fn recover(&self) {
        let driver = &self.services.driver;
        driver.restore_allocations();
        tracing::info!(
            driver = %driver.driver_name(),
            allocations = driver.allocation_count(),
            plugin_socket = %self.services.sockets.plugin.display(),
            registration_socket = %self.services.sockets.registration.display(),
            relocation = self.services.sandbox_coordinator.is_some(),
            "driver ready to serve"
        );
    }

    pub fn shutdown_report(&self) -> ShutdownReport {
        let (pending_moves, active_moves) = self.services.tracker.counts();
        ShutdownReport {
            prepared_claims: self.services.driver.allocation_count(),
            pending_moves,
            active_moves,
        }
    }

    /// Relocation state lives only in memory; devices still in pod
    /// namespaces are not returned to the host until those pods stop.
    pub fn shutdown(&self) -> ShutdownReport {
        let report = self.shutdown_report();
        if report.active_moves > 0 || report.pending_moves > 0 {
            tracing::warn!(
                pending = report.pending_moves,
                active = report.active_moves,
                "relocation state is dropped on exit"
            );
        }
        tracing::info!(prepared_claims = report.prepared_claims, "driver shut down");
        report
    }
}
