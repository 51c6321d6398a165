//! The DRA node service called by the kubelet.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tracing::info;
use tracing::warn;

use super::bind_socket;
use super::claim_locks::ClaimLocks;
use super::dra::dra_plugin_server::DraPlugin;
use super::dra::dra_plugin_server::DraPluginServer;
use super::dra::Device;
use super::dra::NodePrepareResourceResponse;
use super::dra::NodePrepareResourcesRequest;
use super::dra::NodePrepareResourcesResponse;
use super::dra::NodeUnprepareResourceResponse;
use super::dra::NodeUnprepareResourcesRequest;
use super::dra::NodeUnprepareResourcesResponse;
use super::remove_socket;
use super::ClaimSource;
use super::KubeletError;
use crate::driver::ClaimRef;
use crate::driver::Driver;
use crate::driver::ResourceClaim;

pub struct DraPluginService {
    driver: Arc<Driver>,
    claims: Arc<dyn ClaimSource>,
    /// Calls touching the same claim never overlap.
    locks: ClaimLocks,
}

impl DraPluginService {
    pub fn new(driver: Arc<Driver>, claims: Arc<dyn ClaimSource>) -> Self {
        Self {
            driver,
            claims,
            locks: ClaimLocks::new(),
        }
    }

    /// Serves the DRA node API on `socket_path` until `cancellation_token`
    /// fires, then removes the socket.
    pub async fn serve(
        self,
        socket_path: &Path,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<KubeletError>> {
        let listener = bind_socket(socket_path)?;
        info!(socket = %socket_path.display(), "DRA plugin gRPC server listening");

        let result = tonic::transport::Server::builder()
            .add_service(DraPluginServer::new(self))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                cancellation_token.cancelled().await;
                info!("shutting down DRA plugin gRPC server");
            })
            .await
            .change_context_lazy(|| KubeletError::Serve {
                path: socket_path.display().to_string(),
            });
        remove_socket(socket_path);
        result
    }

    async fn fetch_claim(&self, namespace: &str, name: &str, uid: &str) -> Result<ResourceClaim, String> {
        let claim = self
            .claims
            .get(namespace, name)
            .await
            .map_err(|e| format!("failed to fetch ResourceClaim: {e:?}"))?;
        // The name may have been reused by a newer claim.
        if claim.metadata.uid != uid {
            return Err(format!(
                "ResourceClaim {namespace}/{name} has UID {}, expected {uid}",
                claim.metadata.uid
            ));
        }
        Ok(claim)
    }
}

#[tonic::async_trait]
impl DraPlugin for DraPluginService {
    async fn node_prepare_resources(
        &self,
        request: Request<NodePrepareResourcesRequest>,
    ) -> TonicResult<Response<NodePrepareResourcesResponse>> {
        let request = request.into_inner();
        let _claims = self
            .locks
            .lock_all(request.claims.iter().map(|claim| claim.uid.as_str()))
            .await;

        let mut responses = HashMap::with_capacity(request.claims.len());
        let mut fetched = Vec::with_capacity(request.claims.len());
        for claim in request.claims {
            match self.fetch_claim(&claim.namespace, &claim.name, &claim.uid).await {
                Ok(resource_claim) => fetched.push(resource_claim),
                Err(error) => {
                    warn!(claim_uid = %claim.uid, error = %error, "cannot prepare claim");
                    responses.insert(
                        claim.uid,
                        NodePrepareResourceResponse {
                            devices: vec![],
                            error,
                        },
                    );
                }
            }
        }

        let request_names: HashMap<String, Vec<String>> = fetched
            .iter()
            .map(|claim| {
                (
                    claim.metadata.uid.clone(),
                    claim.request_names(self.driver.driver_name()),
                )
            })
            .collect();
        for (uid, result) in self.driver.prepare_resource_claims(&fetched).await {
            let response = match result {
                Ok(devices) => NodePrepareResourceResponse {
                    devices: devices
                        .into_iter()
                        .map(|device| Device {
                            request_names: request_names.get(&uid).cloned().unwrap_or_default(),
                            pool_name: device.pool_name,
                            device_name: device.device_name,
                            cdi_device_ids: device.cdi_device_ids,
                        })
                        .collect(),
                    error: String::new(),
                },
                Err(e) => NodePrepareResourceResponse {
                    devices: vec![],
                    error: e.to_string(),
                },
            };
            responses.insert(uid, response);
        }

        Ok(Response::new(NodePrepareResourcesResponse { claims: responses }))
    }

    async fn node_unprepare_resources(
        &self,
        request: Request<NodeUnprepareResourcesRequest>,
    ) -> TonicResult<Response<NodeUnprepareResourcesResponse>> {
        let claims: Vec<ClaimRef> = request
            .into_inner()
            .claims
            .into_iter()
            .map(|claim| ClaimRef {
                uid: claim.uid,
                namespace: claim.namespace,
                name: claim.name,
            })
            .collect();
        let _claims = self
            .locks
            .lock_all(claims.iter().map(|claim| claim.uid.as_str()))
            .await;

        let responses = self
            .driver
            .unprepare_resource_claims(&claims)
            .await
            .into_iter()
            .map(|(uid, result)| {
                let error = result.err().map(|e| e.to_string()).unwrap_or_default();
                (uid, NodeUnprepareResourceResponse { error })
            })
            .collect();

        Ok(Response::new(NodeUnprepareResourcesResponse { claims: responses }))
    }
}

#[cfg(test)]
mod tests {
    use api_types::DeviceType;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::driver::CdiStore;
    use crate::handler::testing::FakeHandler;
    use crate::handler::Registry;
    use crate::kubelet::dra::Claim;

    const DRIVER: &str = "dra.example.com";
    const UID: &str = "12345678-90ab-cdef-1234-567890abcdef";

    /// Claims keyed by `namespace/name`.
    struct StaticClaims(HashMap<String, ResourceClaim>);

    #[async_trait::async_trait]
    impl ClaimSource for StaticClaims {
        async fn get(&self, namespace: &str, name: &str) -> Result<ResourceClaim, Report<KubeletError>> {
            self.0
                .get(&format!("{namespace}/{name}"))
                .cloned()
                .ok_or_else(|| {
                    Report::new(KubeletError::ClaimFetch {
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                    })
                })
        }
    }

    fn resource_claim(uid: &str, name: &str) -> ResourceClaim {
        serde_json::from_value(serde_json::json!({
            "metadata": {"uid": uid, "namespace": "default", "name": name},
            "status": {"allocation": {"devices": {"results": [
                {"request": "net", "driver": DRIVER, "pool": "node-1", "device": "netdev-virtual"}
            ]}}}
        }))
        .expect("claim")
    }

    fn claim(uid: &str, name: &str) -> Claim {
        Claim {
            namespace: "default".to_string(),
            uid: uid.to_string(),
            name: name.to_string(),
        }
    }

    fn service(dir: &Path, claims: Vec<ResourceClaim>) -> (DraPluginService, Arc<FakeHandler>) {
        let handler = FakeHandler::new(DeviceType::Netdev, "dummy", "dm12345678").arc();
        let mut registry = Registry::new();
        registry.register(handler.clone());
        let driver = Driver::new(DRIVER, Arc::new(registry), CdiStore::new(dir, DRIVER));
        let claims = claims
            .into_iter()
            .map(|c| (format!("{}/{}", c.metadata.namespace, c.metadata.name), c))
            .collect();
        (
            DraPluginService::new(Arc::new(driver), Arc::new(StaticClaims(claims))),
            handler,
        )
    }

    #[test(tokio::test)]
    async fn prepare_reports_devices_and_per_claim_errors() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (service, handler) = service(
            dir.path(),
            vec![
                resource_claim(UID, "net"),
                resource_claim("ffffffff-0000-0000-0000-000000000000", "reused"),
            ],
        );

        let response = service
            .node_prepare_resources(Request::new(NodePrepareResourcesRequest {
                claims: vec![
                    claim(UID, "net"),
                    claim("00000000-0000-0000-0000-000000000000", "reused"),
                    claim("11111111-0000-0000-0000-000000000000", "missing"),
                ],
            }))
            .await
            .expect("rpc")
            .into_inner();

        assert_eq!(
            response.claims[UID],
            NodePrepareResourceResponse {
                devices: vec![Device {
                    request_names: vec!["net".to_string()],
                    pool_name: "default".to_string(),
                    device_name: "dm12345678".to_string(),
                    cdi_device_ids: vec!["dra.example.com/netdev=dm12345678".to_string()],
                }],
                error: String::new(),
            }
        );
        assert!(response.claims["00000000-0000-0000-0000-000000000000"]
            .error
            .contains("has UID ffffffff"));
        assert!(!response.claims["11111111-0000-0000-0000-000000000000"]
            .error
            .is_empty());
        // Only the claim whose UID matched reached a handler.
        assert_eq!(handler.prepare_count(), 1);
    }

    #[test(tokio::test)]
    async fn busy_claim_does_not_block_other_claims() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (service, handler) = service(dir.path(), vec![resource_claim(UID, "net")]);
        let _busy = service.locks.lock("ffffffff-0000-0000-0000-000000000000").await;

        let prepared = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            service.node_prepare_resources(Request::new(NodePrepareResourcesRequest {
                claims: vec![claim(UID, "net")],
            })),
        )
        .await
        .expect("unrelated claim must not wait")
        .expect("rpc")
        .into_inner();
        assert_eq!(prepared.claims[UID].error, "");

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            service.node_unprepare_resources(Request::new(NodeUnprepareResourcesRequest {
                claims: vec![claim("ffffffff-0000-0000-0000-000000000000", "busy")],
            })),
        )
        .await;
        assert!(blocked.is_err());
        assert_eq!(handler.unprepare_count(), 0);
    }

    #[test(tokio::test)]
    async fn unprepare_maps_results() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (service, handler) = service(dir.path(), vec![resource_claim(UID, "net")]);
        service
            .node_prepare_resources(Request::new(NodePrepareResourcesRequest {
                claims: vec![claim(UID, "net")],
            }))
            .await
            .expect("prepare");

        let response = service
            .node_unprepare_resources(Request::new(NodeUnprepareResourcesRequest {
                claims: vec![claim(UID, "net"), claim("unknown-uid", "gone")],
            }))
            .await
            .expect("rpc")
            .into_inner();

        assert_eq!(response.claims[UID].error, "");
        assert_eq!(response.claims["unknown-uid"].error, "");
        assert_eq!(handler.unprepare_count(), 1);
    }
}
