//! Local HTTP endpoint through which the runtime hook delivers sandbox events.

use std::path::PathBuf;
use std::sync::Arc;

use api_types::SandboxEvent;
use error_stack::Report;
use poem::handler;
use poem::http::StatusCode;
use poem::listener::UnixListener;
use poem::middleware::Tracing;
use poem::post;
use poem::web::Data;
use poem::web::Json;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::SandboxCoordinator;

/// Sandbox API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl core::error::Error for ApiError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxResponse {
    pub success: bool,
    pub message: String,
}

#[handler]
async fn run_pod_sandbox(
    Json(event): Json<SandboxEvent>,
    coordinator: Data<&Arc<SandboxCoordinator>>,
) -> poem::Result<Json<SandboxResponse>> {
    coordinator.run_pod_sandbox(&event).await.map_err(|e| {
        error!(pod_uid = %event.pod_uid, error = %e, "RunPodSandbox failed");
        poem::Error::from_string(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
    })?;

    Ok(Json(SandboxResponse {
        success: true,
        message: format!("sandbox {} handled", event.pod_uid),
    }))
}

#[handler]
async fn stop_pod_sandbox(
    Json(event): Json<SandboxEvent>,
    coordinator: Data<&Arc<SandboxCoordinator>>,
) -> Json<SandboxResponse> {
    coordinator.stop_pod_sandbox(&event).await;
    Json(SandboxResponse {
        success: true,
        message: format!("sandbox {} stopped", event.pod_uid),
    })
}

fn routes(coordinator: Arc<SandboxCoordinator>) -> impl Endpoint {
    Route::new()
        .at("/sandbox/run", post(run_pod_sandbox))
        .at("/sandbox/stop", post(stop_pod_sandbox))
        .data(coordinator)
        .with(Tracing)
}

/// Serves sandbox events on a unix socket.
pub struct SandboxApiServer {
    coordinator: Arc<SandboxCoordinator>,
    socket_path: PathBuf,
}

impl SandboxApiServer {
    pub fn new(coordinator: Arc<SandboxCoordinator>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            coordinator,
            socket_path: socket_path.into(),
        }
    }

    /// Runs until `cancellation_token` is cancelled.
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the socket cannot be bound or serving fails
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<(), Report<ApiError>> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Report::new(ApiError::ServerError {
                    message: format!("create {}: {e}", parent.display()),
                })
            })?;
        }
        // A socket left behind by a previous run would make bind fail.
        let _ = std::fs::remove_file(&self.socket_path);

        info!(socket = %self.socket_path.display(), "Starting sandbox event API");
        let listener = UnixListener::bind(self.socket_path.clone());
        let result = Server::new(listener)
            .run_with_graceful_shutdown(
                routes(self.coordinator),
                async move { cancellation_token.cancelled().await },
                None,
            )
            .await;

        let _ = std::fs::remove_file(&self.socket_path);
        match result {
            Ok(()) => {
                info!("Sandbox event API stopped");
                Ok(())
            }
            Err(e) => {
                error!("Sandbox event API failed: {e}");
                Err(Report::new(ApiError::ServerError {
                    message: format!("Server failed: {e}"),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use poem::test::TestClient;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::platform::mock::MockRdma;
    use crate::platform::NetnsMode;
    use crate::sandbox::RelocationTracker;
    use crate::sandbox::Relocator;

    const CLAIM: &str = "0f6e2a7c-1d2b-4c3d-9e8f-0123456789ab";

    fn setup(rdma: MockRdma) -> (Arc<RelocationTracker>, Arc<SandboxCoordinator>) {
        let tracker = Arc::new(RelocationTracker::new());
        let relocator = Arc::new(Relocator::new(Arc::new(rdma)));
        let coordinator = Arc::new(SandboxCoordinator::new(tracker.clone(), relocator));
        (tracker, coordinator)
    }

    fn event(netns_path: Option<String>) -> SandboxEvent {
        let mut annotations = BTreeMap::new();
        annotations.insert("resource.kubernetes.io/app".to_string(), CLAIM.to_string());
        SandboxEvent {
            pod_uid: "pod-1".to_string(),
            annotations,
            netns_path,
            ..Default::default()
        }
    }

    #[test(tokio::test)]
    async fn run_endpoint_applies_pending_moves() {
        let netns = tempfile::NamedTempFile::new().expect("netns stand-in");
        let rdma = MockRdma::new(NetnsMode::Exclusive).with_device("mlx5_0");
        let (tracker, coordinator) = setup(rdma.clone());
        tracker.add_pending(CLAIM, "mlx5_0");
        let client = TestClient::new(routes(coordinator));

        let resp = client
            .post("/sandbox/run")
            .body_json(&event(Some(netns.path().display().to_string())))
            .send()
            .await;

        resp.assert_status_is_ok();
        assert_eq!(rdma.moves(), vec!["mlx5_0".to_string()]);
        assert_eq!(tracker.counts(), (0, 1));
    }

    #[test(tokio::test)]
    async fn run_endpoint_reports_netns_failure() {
        let (tracker, coordinator) = setup(MockRdma::new(NetnsMode::Exclusive));
        tracker.add_pending(CLAIM, "mlx5_0");
        let client = TestClient::new(routes(coordinator));

        let resp = client
            .post("/sandbox/run")
            .body_json(&event(Some("/nonexistent/netns".to_string())))
            .send()
            .await;

        resp.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(tracker.counts(), (1, 0));
    }

    #[test(tokio::test)]
    async fn stop_endpoint_always_succeeds() {
        let (_tracker, coordinator) = setup(MockRdma::new(NetnsMode::Exclusive));
        let client = TestClient::new(routes(coordinator));

        let resp = client.post("/sandbox/stop").body_json(&event(None)).send().await;

        resp.assert_status_is_ok();
        resp.assert_json(SandboxResponse {
            success: true,
            message: "sandbox pod-1 stopped".to_string(),
        })
        .await;
    }
}
