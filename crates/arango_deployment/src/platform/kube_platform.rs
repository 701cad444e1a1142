use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};
use serde_json::json;
use tracing::debug;

use super::PlatformClient;
use crate::api::v1alpha::{ArangoDeployment, API_VERSION, KIND};
use crate::util::errors::StdError;

pub const STATUS_FIELD_MANAGER: &str = "arango-deployment-status-manager";

/// [`PlatformClient`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
}

impl KubePlatform {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PlatformClient for KubePlatform {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<ArangoDeployment, StdError> {
        let api: Api<ArangoDeployment> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(|e| StdError::from_kube(KIND, name, e))
    }

    async fn replace_deployment_status(
        &self,
        namespace: &str,
        deployment: &ArangoDeployment,
    ) -> Result<ArangoDeployment, StdError> {
        let name = deployment.name_any();
        let resource_version = deployment.resource_version().ok_or_else(|| {
            StdError::MetadataMissing(format!("{KIND} '{name}' has no resourceVersion"))
        })?;
        let api: Api<ArangoDeployment> = Api::namespaced(self.client.clone(), namespace);

        // The API server rejects a patch carrying a stale resourceVersion with 409.
        let patch = Patch::Merge(json!({
            "apiVersion": API_VERSION,
            "kind": KIND,
            "metadata": { "resourceVersion": resource_version },
            "status": deployment.status,
        }));

        debug!(deployment = %name, %resource_version, "Writing status");
        api.patch_status(&name, &PatchParams::apply(STATUS_FIELD_MANAGER), &patch)
            .await
            .map_err(|e| StdError::from_kube(KIND, &name, e))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, StdError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(|e| StdError::from_kube("Secret", name, e))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, StdError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), secret)
            .await
            .map_err(|e| StdError::from_kube("Secret", &secret.name_any(), e))
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), StdError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| StdError::from_kube("Secret", name, e))
    }

    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>, StdError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.list(&ListParams::default().labels(label_selector))
            .await
            .map(|list| list.items)
            .map_err(|e| StdError::from_kube("Secret", label_selector, e))
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, StdError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.list(&ListParams::default().labels(label_selector))
            .await
            .map(|list| list.items)
            .map_err(|e| StdError::from_kube("Pod", label_selector, e))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, StdError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), pod)
            .await
            .map_err(|e| StdError::from_kube("Pod", &pod.name_any(), e))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StdError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| StdError::from_kube("Pod", name, e))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, StdError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(|e| StdError::from_kube("Service", name, e))
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, StdError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), service)
            .await
            .map_err(|e| StdError::from_kube("Service", &service.name_any(), e))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StdError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| StdError::from_kube("Service", name, e))
    }
}
