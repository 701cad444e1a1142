use super::reconciler::{PassOutcome, Reconciler};
use crate::api::v1alpha::{ArangoDeployment, ARANGO_DEPLOYMENT_FINALIZER};
use crate::arangod::HttpArangoClient;
use crate::platform::KubePlatform;
use crate::util::config::ReconcileConfig;
use crate::util::deployment_status::DeploymentPhase;
use crate::util::{errors, errors::Result, errors::StdError, metrics};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        finalizer::{self, finalizer, Event as Finalizer},
        watcher::{self, Config},
    },
    Resource,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

pub const CONTROLLER_NAME: &str = "arango-deployment-controller";

impl ArangoDeployment {
    fn namespace_or_err(&self) -> Result<String> {
        self.namespace()
            .ok_or_else(|| StdError::MetadataMissing("ArangoDeployment is namespace scoped".to_string()).into())
    }

    // Reconcile (for non-finalizer related changes)
    pub async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let ns = self.namespace_or_err()?;
        let platform = KubePlatform::new(ctx.client.clone());
        let database = HttpArangoClient::for_deployment(self)?;

        let outcome = Reconciler::new(&platform, &database, &ctx.config)
            .reconcile(&ns, &self.name_any())
            .await?;
        self.publish_transition(&ctx, &outcome).await;
        Ok(outcome.action)
    }

    // Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let ns = self.namespace_or_err()?;
        let platform = KubePlatform::new(ctx.client.clone());
        let database = HttpArangoClient::for_deployment(self)?;

        let outcome = Reconciler::new(&platform, &database, &ctx.config)
            .cleanup(&ns, &self.name_any())
            .await?;
        self.publish_transition(&ctx, &outcome).await;
        Ok(outcome.action)
    }

    async fn publish_transition(&self, ctx: &Context, outcome: &PassOutcome) {
        if !outcome.update.phase_changed() {
            return;
        }
        let Some(phase) = outcome.update.phase() else {
            return;
        };
        ctx.metrics.phase_transition(phase);

        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone());
        let type_ = if phase == DeploymentPhase::Failed {
            EventType::Warning
        } else {
            EventType::Normal
        };
        let event = Event {
            type_,
            reason: phase.to_string(),
            note: outcome.update.status.message.clone().or_else(|| {
                Some(format!("`{}` is now {}", self.name_any(), phase))
            }),
            action: "Reconciling".into(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(&event, &self.object_ref(&())).await {
            warn!(deployment = %self.name_any(), "failed to publish event: {}", e);
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn to_context(&self, client: Client, config: ReconcileConfig) -> Result<Arc<Context>, prometheus::Error> {
        Ok(Arc::new(Context {
            client,
            config,
            metrics: metrics::Metrics::new()?.register(&self.registry)?,
            diagnostics: self.diagnostics.clone(),
        }))
    }
}

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Pass deadline, retry schedule and requeue intervals
    pub config: ReconcileConfig,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: metrics::Metrics,
}

#[instrument(skip(ctx, deployment), fields(deployment = %deployment.name_any(), namespace = ?deployment.namespace()))]
pub async fn reconcile(deployment: Arc<ArangoDeployment>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure("deployment");
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = deployment.namespace_or_err()?;
    let deployments: Api<ArangoDeployment> = Api::namespaced(ctx.client.clone(), &ns);

    info!("Reconciling ArangoDeployment \"{}\" in {}", deployment.name_any(), ns);
    finalizer(
        &deployments,
        ARANGO_DEPLOYMENT_FINALIZER,
        deployment.clone(),
        |event| async {
            match event {
                Finalizer::Apply(deployment) => deployment.reconcile(ctx.clone()).await,
                Finalizer::Cleanup(deployment) => deployment.cleanup(ctx.clone()).await,
            }
        },
    )
    .await
    .map_err(|e| errors::Error::StdError(errors::StdError::FinalizerError(Box::new(e))))
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: CONTROLLER_NAME.into(),
        }
    }
}
impl Diagnostics {
    fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

/// Requeue interval carried by the error, looking through the finalizer wrapper.
fn requeue_after(error: &errors::Error) -> Option<Duration> {
    match error {
        errors::Error::ErrorWithRequeue(e) => Some(e.duration),
        errors::Error::StdError(StdError::FinalizerError(inner)) => match inner.as_ref() {
            finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => requeue_after(e),
            _ => None,
        },
        errors::Error::StdError(_) => None,
    }
}

fn error_policy(deployment: Arc<ArangoDeployment>, error: &errors::Error, ctx: Arc<Context>) -> Action {
    warn!(deployment = %deployment.name_any(), class = ?error.class(), "reconcile failed: {}", error);
    ctx.metrics.reconcile_failure(&deployment, error);
    Action::requeue(requeue_after(error).unwrap_or(ctx.config.converge_interval))
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State) -> Result<(), StdError> {
    let client = Client::try_default().await.map_err(StdError::KubeError)?;

    let deployments = Api::<ArangoDeployment>::all(client.clone());
    if let Err(e) = deployments.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        return Err(StdError::KubeError(e));
    }

    let config = ReconcileConfig::from_env();
    info!(?config, "Starting ArangoDeployment controller");
    let context = state
        .to_context(client.clone(), config)
        .map_err(StdError::MetricsError)?;

    Controller::new(deployments, Config::default().any_semantic())
        .owns(
            Api::<Pod>::all(client.clone()),
            watcher::Config::default().labels("app=arangodb"),
        )
        .owns(
            Api::<Service>::all(client.clone()),
            watcher::Config::default().labels("app=arangodb"),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
    Ok(())
}
