use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;
use crate::kubelet::DraPluginService;
use crate::kubelet::RegistrationService;
use crate::sandbox::api::SandboxApiServer;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    /// Servers that run until shutdown.
    pub servers: Vec<JoinHandle<()>>,
    /// Tasks allowed to finish on their own.
    pub background: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            servers: Vec::new(),
            background: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        // The kubelet connects to the DRA socket as soon as registration
        // succeeds, so it has to be listening first.
        let plugin_task = self.spawn_plugin_task(app);
        self.servers.push(plugin_task);

        let registration_task = self.spawn_registration_task(app);
        self.servers.push(registration_task);

        if app.services().sandbox_coordinator.is_some() {
            let sandbox_task = self.spawn_sandbox_api_task(app);
            self.servers.push(sandbox_task);
        }

        if app.services().publisher.is_some() {
            let publish_task = self.spawn_publish_task(app);
            self.background.push(publish_task);
        }

        Ok(())
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            use tokio::signal::unix::signal;
            use tokio::signal::unix::SignalKind;
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT, initiating graceful shutdown");
                    }
                }
            })
        };

        let outcome = tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                Ok(())
            }
            // Any server stopping on its own takes the driver down.
            result = futures::future::select_all(&mut self.servers) => {
                let (result, _index, _remaining) = result;
                match result {
                    Err(e) => {
                        tracing::error!("Task completed with error: {e}");
                        Err(e.into())
                    }
                    Ok(()) => {
                        tracing::warn!("Server task completed unexpectedly");
                        Ok(())
                    }
                }
            }
        };

        // Sockets are removed by the servers on cancellation.
        self.cancellation_token.cancel();
        self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;
        outcome
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in self.servers.iter_mut().chain(self.background.iter_mut()) {
                if task.is_finished() {
                    continue;
                }
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_plugin_task(&self, app: &Application) -> JoinHandle<()> {
        let services = app.services();
        let service = DraPluginService::new(services.driver.clone(), services.claims.clone());
        let socket_path = services.sockets.plugin.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting DRA plugin server task");
            if let Err(e) = service.serve(&socket_path, token).await {
                tracing::error!("DRA plugin server failed: {e:?}");
            } else {
                tracing::info!("DRA plugin server completed");
            }
        })
    }

    fn spawn_registration_task(&self, app: &Application) -> JoinHandle<()> {
        let services = app.services();
        let service = RegistrationService::new(
            app.daemon_args().driver_name.clone(),
            services.sockets.plugin.clone(),
        );
        let socket_path = services.sockets.registration.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting plugin registration server task");
            if let Err(e) = service.serve(&socket_path, token).await {
                tracing::error!("Plugin registration server failed: {e:?}");
            } else {
                tracing::info!("Plugin registration server completed");
            }
        })
    }

    fn spawn_sandbox_api_task(&self, app: &Application) -> JoinHandle<()> {
        let coordinator = app.services().sandbox_coordinator.clone();
        let socket_path = app.daemon_args().sandbox_socket_path();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let Some(coordinator) = coordinator else {
                return;
            };
            tracing::info!("Starting sandbox event server on {}", socket_path.display());
            let server = SandboxApiServer::new(coordinator, socket_path);
            if let Err(e) = server.run(token).await {
                tracing::error!("Sandbox event server failed: {e:?}");
            } else {
                tracing::info!("Sandbox event server completed");
            }
        })
    }

    fn spawn_publish_task(&self, app: &Application) -> JoinHandle<()> {
        let publisher = app.services().publisher.clone();
        let devices = app.services().devices.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let Some(publisher) = publisher else {
                return;
            };
            tracing::info!("Starting ResourceSlice publish task");
            publisher.run(devices, token).await;
            tracing::info!("ResourceSlice publish task completed");
        })
    }
}
