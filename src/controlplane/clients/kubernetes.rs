//! Kubernetes Resource Client
//!
//! [`ResourceClient`] backed by the API server through `kube`.

use crate::domain::ports::{ObjectKey, ResourceClient};
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, PostParams};
use kube::Client;
use tracing::debug;

/// Adapter for the platform API server
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

/// Map API failures onto the port's error taxonomy
fn classify(err: kube::Error, resource: &ApiResource, key: &ObjectKey) -> Error {
    match &err {
        kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists" => {
            Error::ResourceExists {
                kind: resource.kind.clone(),
                name: key.to_string(),
            }
        }
        kube::Error::Api(response) if response.code == 409 => Error::Conflict {
            kind: resource.kind.clone(),
            name: key.to_string(),
        },
        kube::Error::Api(response) if response.code == 404 => Error::ResourceNotFound {
            kind: resource.kind.clone(),
            name: key.to_string(),
        },
        _ => Error::Kube(err),
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        debug!(kind = %resource.kind, key = %key, "GET");
        self.api(resource, key.namespace.as_deref())
            .get_opt(&key.name)
            .await
            .map_err(|e| classify(e, resource, key))
    }

    async fn create(&self, resource: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::from_meta(&object.metadata);
        debug!(kind = %resource.kind, key = %key, "CREATE");
        self.api(resource, key.namespace.as_deref())
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| classify(e, resource, &key))
    }

    async fn update(&self, resource: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::from_meta(&object.metadata);
        debug!(kind = %resource.kind, key = %key, "UPDATE");
        self.api(resource, key.namespace.as_deref())
            .replace(&key.name, &PostParams::default(), object)
            .await
            .map_err(|e| classify(e, resource, &key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{} failure", reason),
            reason: reason.into(),
            code,
        })
    }

    fn scc() -> (ApiResource, ObjectKey) {
        (
            ApiResource::erase::<crate::crd::SecurityContextConstraints>(&()),
            ObjectKey::cluster("storage-client-csi"),
        )
    }

    #[test]
    fn test_classify_already_exists() {
        let (resource, key) = scc();
        assert_matches!(
            classify(api_error(409, "AlreadyExists"), &resource, &key),
            Error::ResourceExists { .. }
        );
    }

    #[test]
    fn test_classify_conflict() {
        let (resource, key) = scc();
        let err = classify(api_error(409, "Conflict"), &resource, &key);
        assert_matches!(err, Error::Conflict { ref kind, .. } if kind == "SecurityContextConstraints");
    }

    #[test]
    fn test_classify_not_found_and_other() {
        let (resource, key) = scc();
        assert_matches!(
            classify(api_error(404, "NotFound"), &resource, &key),
            Error::ResourceNotFound { .. }
        );
        assert_matches!(
            classify(api_error(500, "InternalError"), &resource, &key),
            Error::Kube(_)
        );
    }
}
