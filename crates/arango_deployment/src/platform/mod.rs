//! The slice of the Kubernetes API the reconciler depends on.
//!
//! Every call is namespace scoped. Implementations must report `NotFound`,
//! `AlreadyExists` and `Conflict` as the matching [`StdError`] variants so
//! callers can branch on them.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};

use crate::api::v1alpha::ArangoDeployment;
use crate::util::errors::StdError;

mod kube_platform;

pub use kube_platform::KubePlatform;

#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<ArangoDeployment, StdError>;

    /// Writes `deployment.status`, guarded by `metadata.resourceVersion`.
    ///
    /// Fails with `Conflict` when the stored object changed since it was read.
    async fn replace_deployment_status(
        &self,
        namespace: &str,
        deployment: &ArangoDeployment,
    ) -> Result<ArangoDeployment, StdError>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, StdError>;

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, StdError>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), StdError>;

    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>, StdError>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, StdError>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, StdError>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StdError>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, StdError>;

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, StdError>;

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StdError>;
}

/// Treats `NotFound` on delete as success.
pub(crate) fn ignore_not_found(result: Result<(), StdError>) -> Result<(), StdError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
