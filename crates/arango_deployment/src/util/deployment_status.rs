use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::api::v1alpha::{ArangoDeploymentStatus, HealthSummary, Topology};
use crate::platform::PlatformClient;
use crate::util::errors::{Error, ErrorWithRequeue, Result, StdError};

// Constants for condition types
pub const READY_CONDITION: &str = "Ready";
pub const SPEC_VALID_CONDITION: &str = "SpecValid";
pub const ENCRYPTION_KEY_READY_CONDITION: &str = "EncryptionKeyReady";
pub const TOPOLOGY_CONVERGED_CONDITION: &str = "TopologyConverged";

// Phase represents the high-level status of an ArangoDeployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum DeploymentPhase {
    Created,
    Running,
    Upgrading,
    Failed,
    Terminating,
    Terminated,
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeploymentPhase::Created => write!(f, "Created"),
            DeploymentPhase::Running => write!(f, "Running"),
            DeploymentPhase::Upgrading => write!(f, "Upgrading"),
            DeploymentPhase::Failed => write!(f, "Failed"),
            DeploymentPhase::Terminating => write!(f, "Terminating"),
            DeploymentPhase::Terminated => write!(f, "Terminated"),
        }
    }
}

// Status reasons for conditions
#[derive(Debug, Clone, PartialEq)]
pub enum StatusReason {
    Converged,
    Converging,
    Invalid,
    Valid,
    Provisioned,
    ProvisioningFailed,
    Deleting,
}

impl fmt::Display for StatusReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StatusReason::Converged => write!(f, "Converged"),
            StatusReason::Converging => write!(f, "Converging"),
            StatusReason::Invalid => write!(f, "Invalid"),
            StatusReason::Valid => write!(f, "Valid"),
            StatusReason::Provisioned => write!(f, "Provisioned"),
            StatusReason::ProvisioningFailed => write!(f, "ProvisioningFailed"),
            StatusReason::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Facts gathered by one reconciliation pass. The next status is a pure function of these
/// and the previous status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    /// Deletion was requested.
    pub deleting: bool,
    /// Member pods still exist while deleting.
    pub resources_remaining: bool,
    /// Unrecoverable provisioning error of this pass.
    pub fatal: Option<String>,
    /// Permanent spec validation error.
    pub invalid: Option<String>,
    /// `None` when the spec requests no encryption.
    pub encryption_key_ready: Option<bool>,
    /// Health matches the spec (always true in single mode once pods exist).
    pub topology_converged: bool,
    /// The version endpoint answered.
    pub version_live: bool,
    /// Some member pod runs an image other than the desired one.
    pub image_outdated: bool,
    pub expected: Option<Topology>,
    pub observed: Option<Topology>,
    pub version: Option<String>,
    pub current_image: Option<String>,
    /// Why the pass did not converge, if it did not.
    pub message: Option<String>,
}

/// Computes the phase from the previous phase and current facts.
pub fn next_phase(previous: Option<DeploymentPhase>, observation: &Observation) -> DeploymentPhase {
    use DeploymentPhase::*;

    if observation.deleting {
        return if observation.resources_remaining {
            Terminating
        } else {
            Terminated
        };
    }
    if observation.fatal.is_some() {
        return Failed;
    }
    if observation.invalid.is_some() {
        return previous.unwrap_or(Created);
    }
    if observation.image_outdated {
        return Upgrading;
    }
    if observation.topology_converged && observation.version_live {
        return Running;
    }
    match previous {
        // Not converged within the deadline: keep the phase, retry next pass.
        Some(Running) => Running,
        Some(Upgrading) => Upgrading,
        None | Some(Created) | Some(Failed) | Some(Terminating) | Some(Terminated) => Created,
    }
}

/// Derives the full status to persist. Timestamps only move when something transitions.
pub fn build_status(
    previous: Option<&ArangoDeploymentStatus>,
    observation: &Observation,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> ArangoDeploymentStatus {
    let previous_phase = previous.and_then(|s| s.phase);
    let phase = next_phase(previous_phase, observation);
    let last_transition_time = match previous {
        Some(prev) if prev.phase == Some(phase) && prev.last_transition_time.is_some() => {
            prev.last_transition_time
        }
        _ => Some(now),
    };

    let mut conditions = previous.map(|s| s.conditions.clone()).unwrap_or_default();
    let set = |conditions: &mut Vec<Condition>, type_: &str, status: bool, reason: StatusReason, message: String| {
        *conditions = set_status_condition(
            conditions,
            new_condition(type_, status, reason, message, generation, now),
            now,
        );
    };

    if observation.deleting {
        set(
            &mut conditions,
            READY_CONDITION,
            false,
            StatusReason::Deleting,
            "Deployment is being deleted".to_string(),
        );
    } else if let Some(invalid) = &observation.invalid {
        set(&mut conditions, SPEC_VALID_CONDITION, false, StatusReason::Invalid, invalid.clone());
        set(
            &mut conditions,
            READY_CONDITION,
            false,
            StatusReason::Invalid,
            "Deployment spec is invalid".to_string(),
        );
    } else {
        set(
            &mut conditions,
            SPEC_VALID_CONDITION,
            true,
            StatusReason::Valid,
            "Deployment is valid".to_string(),
        );
        match observation.encryption_key_ready {
            Some(true) => set(
                &mut conditions,
                ENCRYPTION_KEY_READY_CONDITION,
                true,
                StatusReason::Provisioned,
                "Encryption key secret exists".to_string(),
            ),
            Some(false) => set(
                &mut conditions,
                ENCRYPTION_KEY_READY_CONDITION,
                false,
                StatusReason::ProvisioningFailed,
                observation.fatal.clone().unwrap_or_default(),
            ),
            None => conditions = remove_status_condition(&conditions, ENCRYPTION_KEY_READY_CONDITION),
        }
        if observation.fatal.is_none() {
            let (reason, message) = if observation.topology_converged {
                (StatusReason::Converged, "Members match the requested topology".to_string())
            } else {
                (
                    StatusReason::Converging,
                    observation
                        .message
                        .clone()
                        .unwrap_or_else(|| "Waiting for members".to_string()),
                )
            };
            set(
                &mut conditions,
                TOPOLOGY_CONVERGED_CONDITION,
                observation.topology_converged,
                reason,
                message,
            );
        }
        let ready = phase == DeploymentPhase::Running && observation.topology_converged;
        set(
            &mut conditions,
            READY_CONDITION,
            ready,
            if ready {
                StatusReason::Converged
            } else {
                StatusReason::Converging
            },
            format!("Deployment is {}", phase),
        );
    }

    let health = if observation.expected.is_some() || observation.version.is_some() {
        Some(HealthSummary {
            expected: observation.expected.unwrap_or_default(),
            observed: observation.observed,
            version: observation.version.clone(),
        })
    } else {
        previous.and_then(|s| s.health.clone())
    };

    ArangoDeploymentStatus {
        phase: Some(phase),
        conditions,
        health,
        current_image: observation
            .current_image
            .clone()
            .or_else(|| previous.and_then(|s| s.current_image.clone())),
        last_transition_time,
        message: observation
            .fatal
            .clone()
            .or_else(|| observation.invalid.clone())
            .or_else(|| observation.message.clone()),
        observed_generation: generation,
    }
}

fn new_condition(
    type_: &str,
    status: bool,
    reason: StatusReason,
    message: String,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time: Time(now),
        observed_generation: generation,
    }
}

/// Sets the condition of the same type, returning the new list.
///
/// LastTransitionTime only changes when the status flips or the condition is new.
pub fn set_status_condition(conditions: &[Condition], new_condition: Condition, now: DateTime<Utc>) -> Vec<Condition> {
    let mut new_conditions = conditions.to_vec();
    match new_conditions.iter_mut().find(|c| c.type_ == new_condition.type_) {
        Some(existing) => {
            if existing.status != new_condition.status {
                existing.status = new_condition.status;
                existing.last_transition_time = Time(now);
            }
            existing.reason = new_condition.reason;
            existing.message = new_condition.message;
            existing.observed_generation = new_condition.observed_generation;
        }
        None => new_conditions.push(Condition {
            last_transition_time: Time(now),
            ..new_condition
        }),
    }
    new_conditions
}

pub fn remove_status_condition(conditions: &[Condition], condition_type: &str) -> Vec<Condition> {
    conditions
        .iter()
        .filter(|c| c.type_ != condition_type)
        .cloned()
        .collect()
}

pub fn find_status_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == condition_type)
}

/// Returns true when the condition_type is present and set to `True`
pub fn is_status_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    find_status_condition(conditions, condition_type).is_some_and(|c| c.status == "True")
}

/// Outcome of a status write.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub previous_phase: Option<DeploymentPhase>,
    pub status: ArangoDeploymentStatus,
    /// Number of writes submitted, including the ones rejected with a conflict.
    pub writes: u32,
}

impl StatusUpdate {
    pub fn phase(&self) -> Option<DeploymentPhase> {
        self.status.phase
    }

    pub fn phase_changed(&self) -> bool {
        self.previous_phase != self.status.phase
    }
}

/// Persists observations into the status sub-resource with optimistic concurrency.
pub struct DeploymentStatusManager<'a, P: PlatformClient + ?Sized> {
    platform: &'a P,
    namespace: &'a str,
    name: &'a str,
    max_attempts: u32,
    conflict_requeue: Duration,
}

impl<'a, P: PlatformClient + ?Sized> DeploymentStatusManager<'a, P> {
    pub fn new(platform: &'a P, namespace: &'a str, name: &'a str, max_attempts: u32) -> Self {
        Self {
            platform,
            namespace,
            name,
            max_attempts: max_attempts.max(1),
            conflict_requeue: Duration::from_secs(1),
        }
    }

    /// Re-fetches, reapplies `observation` and resubmits until the write lands.
    ///
    /// Skips the write when the stored status already equals the computed one.
    /// Exhausting the attempts is a transient failure deferred to the next pass.
    pub async fn apply(&self, observation: &Observation) -> Result<StatusUpdate> {
        let mut writes = 0;
        for attempt in 1..=self.max_attempts {
            let mut current = self.platform.get_deployment(self.namespace, self.name).await?;
            let previous_phase = current.status.as_ref().and_then(|s| s.phase);
            let status = build_status(
                current.status.as_ref(),
                observation,
                current.metadata.generation,
                Utc::now(),
            );

            if current.status.as_ref() == Some(&status) {
                return Ok(StatusUpdate {
                    previous_phase,
                    status,
                    writes,
                });
            }

            current.status = Some(status.clone());
            writes += 1;
            match self
                .platform
                .replace_deployment_status(self.namespace, &current)
                .await
            {
                Ok(_) => {
                    if previous_phase != status.phase {
                        info!(
                            deployment = self.name,
                            from = ?previous_phase,
                            to = ?status.phase,
                            "Deployment phase changed"
                        );
                    }
                    return Ok(StatusUpdate {
                        previous_phase,
                        status,
                        writes,
                    });
                }
                Err(e) if e.is_conflict() => {
                    warn!(deployment = self.name, attempt, "Status write conflicted, re-fetching");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::ErrorWithRequeue(ErrorWithRequeue::new(
            StdError::Conflict {
                kind: "ArangoDeployment",
                name: self.name.to_string(),
            },
            self.conflict_requeue,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{new_deployment, FakePlatform};
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn converged() -> Observation {
        Observation {
            topology_converged: true,
            version_live: true,
            expected: Some(Topology::new(1, 1, 1)),
            observed: Some(Topology::new(1, 1, 1)),
            ..Default::default()
        }
    }

    #[test]
    fn phase_transitions() {
        use DeploymentPhase::*;
        let pending = Observation::default();

        assert_eq!(next_phase(None, &pending), Created);
        assert_eq!(next_phase(Some(Created), &converged()), Running);
        assert_eq!(next_phase(Some(Running), &pending), Running);
        assert_eq!(
            next_phase(
                Some(Running),
                &Observation {
                    image_outdated: true,
                    ..converged()
                }
            ),
            Upgrading
        );
        assert_eq!(next_phase(Some(Upgrading), &pending), Upgrading);
        assert_eq!(next_phase(Some(Upgrading), &converged()), Running);
    }

    #[test]
    fn failed_is_reachable_from_anywhere_and_clears_when_resolved() {
        use DeploymentPhase::*;
        let fatal = Observation {
            fatal: Some("forbidden".to_string()),
            ..converged()
        };
        for previous in [None, Some(Created), Some(Running), Some(Upgrading)] {
            assert_eq!(next_phase(previous, &fatal), Failed);
        }
        assert_eq!(next_phase(Some(Failed), &Observation::default()), Created);
        assert_eq!(next_phase(Some(Failed), &converged()), Running);
    }

    #[test]
    fn deletion_wins() {
        let mut observation = Observation {
            deleting: true,
            resources_remaining: true,
            fatal: Some("ignored".to_string()),
            ..Default::default()
        };
        assert_eq!(
            next_phase(Some(DeploymentPhase::Running), &observation),
            DeploymentPhase::Terminating
        );
        observation.resources_remaining = false;
        assert_eq!(
            next_phase(Some(DeploymentPhase::Terminating), &observation),
            DeploymentPhase::Terminated
        );
    }

    #[test]
    fn invalid_spec_keeps_phase() {
        let invalid = Observation {
            invalid: Some("coordinators.count must be at least 1".to_string()),
            ..Default::default()
        };
        assert_eq!(next_phase(None, &invalid), DeploymentPhase::Created);
        assert_eq!(
            next_phase(Some(DeploymentPhase::Running), &invalid),
            DeploymentPhase::Running
        );

        let status = build_status(None, &invalid, Some(2), t(0));
        assert!(!is_status_condition_true(&status.conditions, SPEC_VALID_CONDITION));
        assert_eq!(status.message, invalid.invalid);
    }

    #[test]
    fn invalid_spec_clears_ready() {
        let running = build_status(None, &converged(), Some(1), t(0));
        assert!(is_status_condition_true(&running.conditions, READY_CONDITION));

        let invalid = Observation {
            invalid: Some("image must not be empty".to_string()),
            ..Default::default()
        };
        let status = build_status(Some(&running), &invalid, Some(2), t(10));

        assert_eq!(status.phase, Some(DeploymentPhase::Running));
        let ready = find_status_condition(&status.conditions, READY_CONDITION).unwrap();
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason, StatusReason::Invalid.to_string());
    }

    #[test]
    fn replaying_the_same_observation_is_a_fixed_point() {
        let first = build_status(None, &converged(), Some(1), t(0));
        let second = build_status(Some(&first), &converged(), Some(1), t(60));

        assert_eq!(first, second);
        assert_eq!(second.last_transition_time, Some(t(0)));
        assert!(is_status_condition_true(&second.conditions, READY_CONDITION));
    }

    #[test]
    fn transition_time_moves_with_the_phase() {
        let created = build_status(None, &Observation::default(), Some(1), t(0));
        let running = build_status(Some(&created), &converged(), Some(1), t(30));

        assert_eq!(created.phase, Some(DeploymentPhase::Created));
        assert_eq!(running.phase, Some(DeploymentPhase::Running));
        assert_eq!(running.last_transition_time, Some(t(30)));
        let ready = find_status_condition(&running.conditions, READY_CONDITION).unwrap();
        assert_eq!(ready.last_transition_time, Time(t(30)));
    }

    #[test]
    fn encryption_condition_follows_spec() {
        let with_key = build_status(
            None,
            &Observation {
                encryption_key_ready: Some(true),
                ..converged()
            },
            None,
            t(0),
        );
        assert!(is_status_condition_true(
            &with_key.conditions,
            ENCRYPTION_KEY_READY_CONDITION
        ));

        let without = build_status(Some(&with_key), &converged(), None, t(1));
        assert!(find_status_condition(&without.conditions, ENCRYPTION_KEY_READY_CONDITION).is_none());
    }

    #[tokio::test]
    async fn conflicting_write_is_refetched_and_reapplied_once() {
        let platform = FakePlatform::default();
        platform.insert_deployment(new_deployment("db", "ns"));
        platform.before_next_status_write(|stored| {
            stored
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert("team".to_string(), "storage".to_string());
        });

        let manager = DeploymentStatusManager::new(&platform, "ns", "db", 5);
        let update = manager.apply(&converged()).await.unwrap();

        assert_eq!(update.writes, 2);
        assert_eq!(platform.calls().get_deployment, 2);
        assert_eq!(platform.calls().replace_status, 2);
        let stored = platform.deployment("ns", "db").unwrap();
        assert_eq!(stored.metadata.labels.unwrap()["team"], "storage");
        assert_eq!(stored.status.unwrap().phase, Some(DeploymentPhase::Running));
    }

    #[tokio::test]
    async fn endless_conflicts_are_bounded() {
        let platform = FakePlatform::default();
        platform.insert_deployment(new_deployment("db", "ns"));
        platform.conflict_every_status_write();

        let manager = DeploymentStatusManager::new(&platform, "ns", "db", 3);
        let err = manager.apply(&converged()).await.unwrap_err();

        assert!(matches!(err, Error::ErrorWithRequeue(_)));
        assert!(err.std_error().is_conflict());
        assert_eq!(platform.calls().replace_status, 3);
    }

    #[tokio::test]
    async fn unchanged_status_is_not_rewritten() {
        let platform = FakePlatform::default();
        platform.insert_deployment(new_deployment("db", "ns"));
        let manager = DeploymentStatusManager::new(&platform, "ns", "db", 5);

        manager.apply(&converged()).await.unwrap();
        let again = manager.apply(&converged()).await.unwrap();

        assert_eq!(again.writes, 0);
        assert!(!again.phase_changed());
        assert_eq!(platform.calls().replace_status, 1);
    }
}
