use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::api::v1alpha::conditions_schema;
use crate::util::deployment_status::DeploymentPhase;
use crate::util::errors::StdError;

pub static ARANGO_DEPLOYMENT_FINALIZER: &str = "database.arangodb.com/deployment";

pub const API_VERSION: &str = "database.arangodb.com/v1alpha";
pub const KIND: &str = "ArangoDeployment";

#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum DeploymentMode {
    Single,
    #[default]
    Cluster,
}

#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum StorageEngine {
    #[default]
    RocksDB,
    MMFiles,
}

impl fmt::Display for StorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StorageEngine::RocksDB => write!(f, "rocksdb"),
            StorageEngine::MMFiles => write!(f, "mmfiles"),
        }
    }
}

/// Encryption at rest. Only supported by the RocksDB engine.
#[derive(Default, Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionSpec {
    /// Name of the secret holding the 32-byte key. Created by the operator when missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_secret_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct MemberGroupSpec {
    #[serde(default = "default_count")]
    pub count: u32,
}

impl Default for MemberGroupSpec {
    fn default() -> Self {
        Self { count: default_count() }
    }
}

impl MemberGroupSpec {
    pub fn new(count: u32) -> Self {
        Self { count }
    }
}

fn default_count() -> u32 {
    3
}

fn default_image() -> String {
    "arangodb/arangodb:latest".to_string()
}

/// Generate the Kubernetes wrapper struct `ArangoDeployment` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "ArangoDeployment",
    group = "database.arangodb.com",
    version = "v1alpha",
    namespaced
)]
#[kube(status = "ArangoDeploymentStatus", shortname = "arangodb")]
#[kube(printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.mode"}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ArangoDeploymentSpec {
    #[serde(default)]
    pub mode: DeploymentMode,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default)]
    pub storage_engine: StorageEngine,
    #[serde(default)]
    pub encryption: EncryptionSpec,
    #[serde(default)]
    pub agents: MemberGroupSpec,
    #[serde(default)]
    pub db_servers: MemberGroupSpec,
    #[serde(default)]
    pub coordinators: MemberGroupSpec,
}

impl Default for ArangoDeploymentSpec {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::default(),
            image: default_image(),
            storage_engine: StorageEngine::default(),
            encryption: EncryptionSpec::default(),
            agents: MemberGroupSpec::default(),
            db_servers: MemberGroupSpec::default(),
            coordinators: MemberGroupSpec::default(),
        }
    }
}

impl ArangoDeploymentSpec {
    pub fn is_cluster(&self) -> bool {
        self.mode == DeploymentMode::Cluster
    }

    pub fn encryption_secret_name(&self) -> Option<&str> {
        self.encryption.key_secret_name.as_deref()
    }

    /// Member counts the running cluster has to report.
    pub fn expected_topology(&self) -> Topology {
        Topology {
            agents: self.agents.count,
            db_servers: self.db_servers.count,
            coordinators: self.coordinators.count,
        }
    }

    /// Rejects specs that can never converge. Errors are permanent.
    pub fn validate(&self) -> Result<(), StdError> {
        let mut problems = Vec::new();

        if self.image.trim().is_empty() {
            problems.push("image must not be empty".to_string());
        }
        if self.is_cluster() {
            for (group, spec) in [
                ("agents", &self.agents),
                ("dbServers", &self.db_servers),
                ("coordinators", &self.coordinators),
            ] {
                if spec.count < 1 {
                    problems.push(format!("{group}.count must be at least 1 in cluster mode"));
                }
            }
        }
        if let Some(name) = self.encryption_secret_name() {
            if self.storage_engine != StorageEngine::RocksDB {
                problems.push(format!(
                    "encryption requires storageEngine RocksDB, got {:?}",
                    self.storage_engine
                ));
            }
            if !is_dns1123_subdomain(name) {
                problems.push(format!("encryption.keySecretName '{name}' is not a valid resource name"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(StdError::ValidationError(problems.join("; ")))
        }
    }
}

fn is_dns1123_subdomain(name: &str) -> bool {
    !name.is_empty() && name.len() <= 253 && name.split('.').all(is_dns1123_label)
}

fn is_dns1123_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
}

/// Member counts per role: agents, good DBServers, good coordinators.
#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    pub agents: u32,
    pub db_servers: u32,
    pub coordinators: u32,
}

impl Topology {
    pub fn new(agents: u32, db_servers: u32, coordinators: u32) -> Self {
        Self {
            agents,
            db_servers,
            coordinators,
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{},{},{}", self.agents, self.db_servers, self.coordinators)
    }
}

/// Last observed health of the database, as written into the status.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub expected: Topology,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<Topology>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// The status object of `ArangoDeployment`
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArangoDeploymentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DeploymentPhase>,
    #[serde(default)]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
