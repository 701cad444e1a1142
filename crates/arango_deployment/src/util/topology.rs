use thiserror::Error;

use crate::api::v1alpha::{ArangoDeploymentSpec, Topology};
use crate::arangod::{ClusterHealth, ServerRole, ServerStatus};

/// The running cluster does not (yet) have the requested member counts.
///
/// Retryable: convergence takes time after pods are created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Expected {expected} got {observed}")]
pub struct TopologyMismatch {
    pub expected: Topology,
    pub observed: Topology,
}

/// Counts agents regardless of status, DBServers and coordinators only when `Good`.
///
/// Agents report no meaningful degraded status, hence the asymmetry.
pub fn observed_topology(report: &ClusterHealth) -> Topology {
    let mut observed = Topology::default();
    for member in report.members() {
        match (member.role, member.status) {
            (ServerRole::Agent, _) => observed.agents += 1,
            (ServerRole::DbServer, ServerStatus::Good) => observed.db_servers += 1,
            (ServerRole::Coordinator, ServerStatus::Good) => observed.coordinators += 1,
            (ServerRole::DbServer | ServerRole::Coordinator, ServerStatus::Bad)
            | (ServerRole::DbServer | ServerRole::Coordinator, ServerStatus::Failed)
            | (ServerRole::DbServer | ServerRole::Coordinator, ServerStatus::Unknown) => {}
        }
    }
    observed
}

/// Returns `Ok` when the report matches the desired counts exactly.
pub fn satisfies(report: &ClusterHealth, spec: &ArangoDeploymentSpec) -> Result<Topology, TopologyMismatch> {
    let expected = spec.expected_topology();
    let observed = observed_topology(report);
    if observed == expected {
        Ok(observed)
    } else {
        Err(TopologyMismatch { expected, observed })
    }
}
