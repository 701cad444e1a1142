use async_trait::async_trait;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use tokio::time::Duration;
use tracing::{debug, error};

use super::types::{ClusterHealth, VersionInfo};
use crate::api::v1alpha::ArangoDeployment;
use crate::controllers::members::{client_service_name, ARANGOD_PORT};
use crate::util::errors::StdError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Read-only view of a running ArangoDB deployment.
#[async_trait]
pub trait ArangoClient: Send + Sync {
    async fn cluster_health(&self) -> Result<ClusterHealth, StdError>;

    /// Liveness probe; a single server has no cluster health endpoint.
    async fn version(&self) -> Result<VersionInfo, StdError>;
}

pub struct HttpArangoClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpArangoClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StdError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StdError::HttpError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    /// Client for the deployment's client service inside the cluster.
    pub fn for_deployment(deployment: &ArangoDeployment) -> Result<Self, StdError> {
        let namespace = deployment
            .namespace()
            .ok_or_else(|| StdError::MetadataMissing("ArangoDeployment has no namespace".to_string()))?;
        Self::new(format!(
            "http://{}.{}.svc:{}",
            client_service_name(&deployment.name_any()),
            namespace,
            ARANGOD_PORT
        ))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, StdError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "Querying arangod");

        let response = self.client.get(&url).send().await.map_err(|e| {
            error!("Failed to connect to arangod: {}", e);
            StdError::HttpError(format!("Request to {} failed: {}", url, e))
        })?;

        if !response.status().is_success() {
            return Err(StdError::HttpError(format!(
                "arangod returned {} for {}",
                response.status(),
                path
            )));
        }

        response.json::<T>().await.map_err(|e| {
            StdError::SerializationError(format!("Failed to parse response of {}: {}", path, e))
        })
    }
}

#[async_trait]
impl ArangoClient for HttpArangoClient {
    async fn cluster_health(&self) -> Result<ClusterHealth, StdError> {
        self.get_json("/_admin/cluster/health").await
    }

    async fn version(&self) -> Result<VersionInfo, StdError> {
        self.get_json("/_api/version").await
    }
}
