//! Helpers for end-to-end tests against a live cluster running the operator.
//!
//! Tests read `TEST_NAMESPACE` for the namespace to work in and skip themselves
//! when it is not set.

use arango_deployment::api::v1alpha::{ArangoDeployment, ArangoDeploymentSpec, KIND};
use arango_deployment::arangod::{ArangoClient, HttpArangoClient, VersionInfo};
use arango_deployment::util::deployment_status::DeploymentPhase;
use arango_deployment::util::errors::StdError;
use arango_deployment::util::retry::{retry, BackoffConfig};
use arango_deployment::util::topology::satisfies;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};
use std::time::Duration;

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub const DEPLOYMENT_READY_TIMEOUT: Duration = Duration::from_secs(2 * 60);

const UPDATE_ATTEMPTS: u32 = 10;

pub struct TestEnv {
    pub client: Client,
    pub namespace: String,
    /// Image to deploy; encryption at rest needs an enterprise build.
    pub image: Option<String>,
}

impl TestEnv {
    /// Connects with the current kube context. `None` when `TEST_NAMESPACE` is unset.
    pub async fn from_env() -> TestResult<Option<Self>> {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let Ok(namespace) = std::env::var("TEST_NAMESPACE") else {
            tracing::warn!("TEST_NAMESPACE not set, skipping");
            return Ok(None);
        };
        let client = Client::try_default().await?;
        Ok(Some(TestEnv {
            client,
            namespace,
            image: std::env::var("ARANGODB_ENTERPRISE_IMAGE").ok(),
        }))
    }

    pub fn deployments(&self) -> Api<ArangoDeployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Client for the deployment's service. `ARANGODB_ENDPOINT` overrides the in-cluster address,
    /// e.g. for a port-forward.
    pub fn database_client(&self, deployment: &ArangoDeployment) -> TestResult<HttpArangoClient> {
        Ok(match std::env::var("ARANGODB_ENDPOINT") {
            Ok(endpoint) => HttpArangoClient::new(endpoint)?,
            Err(_) => HttpArangoClient::for_deployment(deployment)?,
        })
    }
}

/// A basic deployment with the given name, lower-cased.
pub fn new_deployment(name: &str) -> ArangoDeployment {
    ArangoDeployment {
        metadata: ObjectMeta {
            name: Some(name.to_lowercase()),
            ..Default::default()
        },
        spec: ArangoDeploymentSpec::default(),
        status: None,
    }
}

fn backoff() -> BackoffConfig {
    BackoffConfig {
        initial_delay: Duration::from_secs(1),
        ..Default::default()
    }
}

/// Waits until `predicate` accepts the stored deployment.
pub async fn wait_until_deployment<P>(
    api: &Api<ArangoDeployment>,
    name: &str,
    predicate: P,
) -> TestResult<ArangoDeployment>
where
    P: Fn(&ArangoDeployment) -> Result<(), String>,
{
    let predicate = &predicate;
    let result = retry(&backoff(), DEPLOYMENT_READY_TIMEOUT, move || async move {
        let deployment = api.get(name).await.map_err(|e| e.to_string())?;
        predicate(&deployment)?;
        Ok::<_, String>(deployment)
    })
    .await
    .map_err(|timeout| format!("{name}: {timeout}"))?;
    Ok(result)
}

pub fn deployment_has_phase(phase: DeploymentPhase) -> impl Fn(&ArangoDeployment) -> Result<(), String> {
    move |deployment: &ArangoDeployment| {
        let current = deployment.status.as_ref().and_then(|s| s.phase);
        if current == Some(phase) {
            Ok(())
        } else {
            Err(format!("Expected phase {}, got {:?}", phase, current))
        }
    }
}

/// Waits until the cluster health report matches the deployment's member counts.
pub async fn wait_until_cluster_health(database: &dyn ArangoClient, spec: &ArangoDeploymentSpec) -> TestResult<()> {
    retry(&backoff(), DEPLOYMENT_READY_TIMEOUT, move || async move {
        let report = database.cluster_health().await?;
        satisfies(&report, spec).map_err(StdError::TopologyMismatch)?;
        Ok::<_, StdError>(())
    })
    .await?;
    Ok(())
}

pub async fn wait_until_version_up(database: &dyn ArangoClient) -> TestResult<VersionInfo> {
    Ok(retry(&backoff(), DEPLOYMENT_READY_TIMEOUT, || database.version()).await?)
}

/// Applies `update` to the spec, re-reading and retrying on conflicting writes.
pub async fn update_deployment(
    api: &Api<ArangoDeployment>,
    name: &str,
    update: impl Fn(&mut ArangoDeploymentSpec),
) -> TestResult<ArangoDeployment> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut current = api.get(name).await?;
        update(&mut current.spec);
        match api.replace(name, &PostParams::default(), &current).await {
            Ok(updated) => return Ok(updated),
            Err(kube::Error::Api(e)) if e.code == 409 && attempt < UPDATE_ATTEMPTS => {
                tracing::info!(deployment = name, attempt, "{} changed concurrently, retrying", KIND);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

pub async fn remove_deployment(api: &Api<ArangoDeployment>, name: &str) -> TestResult<()> {
    ignore_not_found(api.delete(name, &DeleteParams::default()).await.map(|_| ()))
}

pub async fn remove_secret(api: &Api<Secret>, name: &str) -> TestResult<()> {
    ignore_not_found(api.delete(name, &DeleteParams::default()).await.map(|_| ()))
}

fn ignore_not_found(result: Result<(), kube::Error>) -> TestResult<()> {
    match result {
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        other => Ok(other?),
    }
}

/// Creates the deployment in the test namespace.
pub async fn create_deployment(env: &TestEnv, deployment: &ArangoDeployment) -> TestResult<ArangoDeployment> {
    tracing::info!(deployment = %deployment.name_any(), namespace = %env.namespace, "Creating deployment");
    Ok(env.deployments().create(&PostParams::default(), deployment).await?)
}
