//! One reconciliation pass over a deployment, independent of the controller runtime.

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::members::{ensure_member_pods, ensure_services, member_selector, owner_reference, service_names};
use crate::arangod::ArangoClient;
use crate::platform::{ignore_not_found, PlatformClient};
use crate::util::config::ReconcileConfig;
use crate::util::deployment_status::{DeploymentPhase, DeploymentStatusManager, Observation, StatusUpdate};
use crate::util::errors::{Error, ErrorClass, ErrorWithRequeue, Result, StdError};
use crate::util::retry::retry;
use crate::util::secrets::{ensure_encryption_key_secret, OWNED_SECRET_LABEL};
use crate::util::topology::satisfies;

/// Result of a pass: the persisted status and when to come back.
#[derive(Debug, Clone, PartialEq)]
pub struct PassOutcome {
    pub update: StatusUpdate,
    pub action: Action,
}

pub struct Reconciler<'a> {
    platform: &'a dyn PlatformClient,
    database: &'a dyn ArangoClient,
    config: &'a ReconcileConfig,
}

impl<'a> Reconciler<'a> {
    pub fn new(platform: &'a dyn PlatformClient, database: &'a dyn ArangoClient, config: &'a ReconcileConfig) -> Self {
        Self {
            platform,
            database,
            config,
        }
    }

    fn status_manager<'s>(&'s self, namespace: &'s str, name: &'s str) -> DeploymentStatusManager<'s, dyn PlatformClient + 'a> {
        DeploymentStatusManager::new(self.platform, namespace, name, self.config.status_write_attempts)
    }

    /// Drives the deployment towards its spec and persists what was observed.
    ///
    /// Validation and fatal failures are reported through the status and return `Ok`.
    /// Transient failures are returned as errors carrying a requeue interval.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<PassOutcome> {
        let started = Instant::now();
        let deployment = self.platform.get_deployment(namespace, name).await?;
        let spec = &deployment.spec;
        let status = self.status_manager(namespace, name);

        let mut observation = Observation {
            expected: spec.is_cluster().then(|| spec.expected_topology()),
            ..Default::default()
        };

        if let Err(e) = spec.validate() {
            warn!(deployment = name, error = %e, "Deployment spec is invalid, waiting for a change");
            observation.invalid = Some(match e {
                StdError::ValidationError(message) => message,
                other => other.to_string(),
            });
            let update = status.apply(&observation).await?;
            return Ok(PassOutcome {
                update,
                action: Action::await_change(),
            });
        }

        let oref = owner_reference(&deployment)?;

        if let Some(secret) = spec.encryption_secret_name() {
            match ensure_encryption_key_secret(self.platform, &deployment, secret, &oref).await {
                Ok(_) => observation.encryption_key_ready = Some(true),
                Err(e) => {
                    observation.encryption_key_ready = Some(false);
                    return self.fail_or_requeue(&status, observation, e).await;
                }
            }
        }

        if let Err(e) = ensure_services(self.platform, &deployment, namespace, &oref).await {
            return self.fail_or_requeue(&status, observation, e).await;
        }
        let members = match ensure_member_pods(self.platform, &deployment, namespace, &oref).await {
            Ok(members) => members,
            Err(e) => return self.fail_or_requeue(&status, observation, e).await,
        };

        let database = self.database;
        if spec.is_cluster() {
            let health = retry(&self.config.backoff, self.config.pass_timeout, move || async move {
                let report = database.cluster_health().await?;
                satisfies(&report, spec).map_err(StdError::TopologyMismatch)
            })
            .await;
            match health {
                Ok(observed) => {
                    observation.topology_converged = true;
                    observation.observed = Some(observed);
                }
                Err(timeout) => {
                    if let Some(StdError::TopologyMismatch(mismatch)) = &timeout.last {
                        observation.observed = Some(mismatch.observed);
                    }
                    info!(deployment = name, error = %timeout, "Cluster has not converged yet");
                    observation.message = Some(StdError::Timeout(Box::new(timeout)).to_string());
                }
            }
        } else {
            observation.topology_converged = members.present > 0;
        }

        if observation.topology_converged {
            let remaining = self
                .config
                .pass_timeout
                .saturating_sub(started.elapsed())
                .max(self.config.backoff.initial_delay);
            match retry(&self.config.backoff, remaining, move || async move { database.version().await }).await {
                Ok(info) => {
                    observation.version_live = true;
                    observation.version = Some(info.version);
                }
                Err(timeout) => {
                    info!(deployment = name, error = %timeout, "Database is not answering yet");
                    observation.message = Some(StdError::Timeout(Box::new(timeout)).to_string());
                }
            }
        }

        if members.outdated.is_empty() {
            observation.current_image = Some(spec.image.clone());
        } else {
            observation.image_outdated = true;
            if !members.settled() {
                observation.message = Some(format!(
                    "Waiting for replaced members before upgrading {} more",
                    members.outdated.len()
                ));
            } else if observation.topology_converged && observation.version_live {
                // One member at a time, the replacement is created next pass.
                let pod = &members.outdated[0];
                info!(deployment = name, %pod, image = %spec.image, "Replacing member pod with outdated image");
                ignore_not_found(self.platform.delete_pod(namespace, pod).await)?;
                observation.message = Some(format!(
                    "Upgrading to {}, {} member(s) left",
                    spec.image,
                    members.outdated.len()
                ));
            } else {
                observation.message = Some(format!(
                    "Waiting for a healthy deployment before upgrading {} member(s)",
                    members.outdated.len()
                ));
            }
        }

        let update = status.apply(&observation).await?;
        let action = match update.phase() {
            Some(DeploymentPhase::Running) => Action::requeue(self.config.resync_interval),
            _ => Action::requeue(self.config.converge_interval),
        };
        debug!(deployment = name, phase = ?update.phase(), elapsed_ms = started.elapsed().as_millis(), "Pass finished");
        Ok(PassOutcome { update, action })
    }

    async fn fail_or_requeue(
        &self,
        status: &DeploymentStatusManager<'_, dyn PlatformClient + 'a>,
        mut observation: Observation,
        error: StdError,
    ) -> Result<PassOutcome> {
        if error.class() != ErrorClass::Fatal {
            return Err(Error::ErrorWithRequeue(ErrorWithRequeue::new(
                error,
                self.config.converge_interval,
            )));
        }
        warn!(error = %error, "Provisioning failed, marking deployment as failed");
        observation.fatal = Some(error.to_string());
        let update = status.apply(&observation).await?;
        Ok(PassOutcome {
            update,
            action: Action::requeue(self.config.resync_interval),
        })
    }

    /// Tears the deployment's resources down.
    ///
    /// Fails with `StillTerminating` while member pods are still shutting down,
    /// so the caller keeps the finalizer and retries.
    pub async fn cleanup(&self, namespace: &str, name: &str) -> Result<PassOutcome> {
        let deployment = self.platform.get_deployment(namespace, name).await?;
        let status = self.status_manager(namespace, name);
        let selector = member_selector(&deployment.name_any());

        let pods = self.platform.list_pods(namespace, &selector).await?;
        status
            .apply(&Observation {
                deleting: true,
                resources_remaining: !pods.is_empty(),
                ..Default::default()
            })
            .await?;

        for pod in &pods {
            if pod.metadata.deletion_timestamp.is_none() {
                ignore_not_found(self.platform.delete_pod(namespace, &pod.name_any()).await)?;
            }
        }
        for service in service_names(name) {
            ignore_not_found(self.platform.delete_service(namespace, &service).await)?;
        }
        let owned = format!("{}={}", OWNED_SECRET_LABEL, name);
        for secret in self.platform.list_secrets(namespace, &owned).await? {
            info!(deployment = name, secret = %secret.name_any(), "Deleting generated secret");
            ignore_not_found(self.platform.delete_secret(namespace, &secret.name_any()).await)?;
        }

        let remaining = self.platform.list_pods(namespace, &selector).await?.len();
        if remaining > 0 {
            return Err(Error::ErrorWithRequeue(ErrorWithRequeue::new(
                StdError::StillTerminating { remaining },
                self.config.converge_interval,
            )));
        }

        let update = status
            .apply(&Observation {
                deleting: true,
                ..Default::default()
            })
            .await?;
        info!(deployment = name, "Deployment resources removed");
        Ok(PassOutcome {
            update,
            action: Action::await_change(),
        })
    }
}
