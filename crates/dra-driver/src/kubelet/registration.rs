//! Kubelet plugin watcher registration.

use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tracing::error;
use tracing::info;

use super::bind_socket;
use super::pluginregistration::registration_server::Registration;
use super::pluginregistration::registration_server::RegistrationServer;
use super::pluginregistration::InfoRequest;
use super::pluginregistration::PluginInfo;
use super::pluginregistration::RegistrationStatus;
use super::pluginregistration::RegistrationStatusResponse;
use super::remove_socket;
use super::KubeletError;
use super::DRA_PLUGIN_TYPE;
use super::DRA_SERVICE_VERSION;

/// Answers the kubelet's plugin watcher with the DRA endpoint.
#[derive(Debug, Clone)]
pub struct RegistrationService {
    driver_name: String,
    endpoint: PathBuf,
}

impl RegistrationService {
    pub fn new(driver_name: impl Into<String>, endpoint: impl Into<PathBuf>) -> Self {
        Self {
            driver_name: driver_name.into(),
            endpoint: endpoint.into(),
        }
    }

    pub async fn serve(
        self,
        socket_path: &Path,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<KubeletError>> {
        let listener = bind_socket(socket_path)?;
        info!(socket = %socket_path.display(), "registration gRPC server listening");

        let result = tonic::transport::Server::builder()
            .add_service(RegistrationServer::new(self))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                cancellation_token.cancelled().await;
                info!("shutting down registration gRPC server");
            })
            .await
            .change_context_lazy(|| KubeletError::Serve {
                path: socket_path.display().to_string(),
            });
        remove_socket(socket_path);
        result
    }
}

#[tonic::async_trait]
impl Registration for RegistrationService {
    async fn get_info(&self, _request: Request<InfoRequest>) -> TonicResult<Response<PluginInfo>> {
        info!(driver = %self.driver_name, "kubelet requested plugin info");
        Ok(Response::new(PluginInfo {
            r#type: DRA_PLUGIN_TYPE.to_string(),
            name: self.driver_name.clone(),
            endpoint: self.endpoint.display().to_string(),
            supported_versions: vec![DRA_SERVICE_VERSION.to_string()],
        }))
    }

    async fn notify_registration_status(
        &self,
        request: Request<RegistrationStatus>,
    ) -> TonicResult<Response<RegistrationStatusResponse>> {
        let status = request.into_inner();
        if status.plugin_registered {
            info!(driver = %self.driver_name, "registered with kubelet");
        } else {
            error!(driver = %self.driver_name, error = %status.error, "kubelet rejected registration");
        }
        Ok(Response::new(RegistrationStatusResponse {}))
    }
}
