//! Reading ResourceClaim objects from the API server.

use error_stack::Report;
use error_stack::ResultExt;
use kube::api::DynamicObject;
use tracing::debug;

use super::KubeletError;
use super::ResourceApi;
use crate::driver::ResourceClaim;

#[async_trait::async_trait]
pub trait ClaimSource: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<ResourceClaim, Report<KubeletError>>;
}

/// Fetches claims from the API server.
pub struct KubeClaimSource {
    api: ResourceApi,
}

impl KubeClaimSource {
    pub fn new(api: ResourceApi) -> Self {
        Self { api }
    }
}

#[async_trait::async_trait]
impl ClaimSource for KubeClaimSource {
    async fn get(&self, namespace: &str, name: &str) -> Result<ResourceClaim, Report<KubeletError>> {
        let object = self
            .api
            .claims(namespace)
            .get(name)
            .await
            .change_context_lazy(|| KubeletError::ClaimFetch {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        debug!(namespace, name, "fetched ResourceClaim");
        decode_claim(&object)
    }
}

pub(crate) fn decode_claim(object: &DynamicObject) -> Result<ResourceClaim, Report<KubeletError>> {
    let context = || KubeletError::Decode {
        kind: "ResourceClaim".to_string(),
    };
    let value = serde_json::to_value(object).change_context_lazy(context)?;
    serde_json::from_value(value).change_context_lazy(context)
}
