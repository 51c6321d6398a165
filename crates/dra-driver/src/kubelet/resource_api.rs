//! Access to the `resource.k8s.io/v1` objects the driver reads and writes.
//!
//! The typed bindings predate DRA v1, so both kinds are handled as
//! [`DynamicObject`]s described by an [`ApiResource`].

use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use kube::api::Api;
use kube::api::ApiResource;
use kube::api::DynamicObject;
use kube::api::GroupVersionKind;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;
use tracing::info;

use super::KubeletError;

pub const RESOURCE_API_GROUP: &str = "resource.k8s.io";
pub const RESOURCE_API_VERSION: &str = "v1";

/// Claims are read per namespace when the kubelet asks for them.
pub const RESOURCE_CLAIM_KIND: &str = "ResourceClaim";
/// One cluster-scoped slice per node is applied at startup.
pub const RESOURCE_SLICE_KIND: &str = "ResourceSlice";

/// `resource.k8s.io/v1` description of `kind`.
pub fn resource(kind: &str) -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        RESOURCE_API_GROUP,
        RESOURCE_API_VERSION,
        kind,
    ))
}

/// API server handle scoped to ResourceClaims and ResourceSlices.
#[derive(Clone)]
pub struct ResourceApi {
    client: Client,
    claims: ApiResource,
    slices: ApiResource,
}

impl ResourceApi {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            claims: resource(RESOURCE_CLAIM_KIND),
            slices: resource(RESOURCE_SLICE_KIND),
        }
    }

    /// Connects with `kubeconfig` when given, otherwise with the in-cluster
    /// service account or the local kubeconfig.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self, Report<KubeletError>> {
        let config = match kubeconfig {
            Some(path) => load_kubeconfig(path).await?,
            None => Config::infer()
                .await
                .change_context(KubeletError::ConnectionFailed {
                    message: "no in-cluster or local kubeconfig".to_string(),
                })?,
        };
        let cluster_url = config.cluster_url.to_string();
        let client = Client::try_from(config).change_context_lazy(|| {
            KubeletError::ConnectionFailed {
                message: format!("build client for {cluster_url}"),
            }
        })?;
        info!(cluster = %cluster_url, "connected to API server");
        Ok(Self::new(client))
    }

    pub fn claims(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.claims)
    }

    pub fn slices(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &self.slices)
    }
}

async fn load_kubeconfig(path: &Path) -> Result<Config, Report<KubeletError>> {
    let context = || KubeletError::Kubeconfig {
        path: path.display().to_string(),
    };
    let kubeconfig = Kubeconfig::read_from(path).change_context_lazy(context)?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .change_context_lazy(context)
}
