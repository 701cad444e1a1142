use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerRole {
    Agent,
    #[serde(rename = "DBServer")]
    DbServer,
    Coordinator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerStatus {
    Good,
    Bad,
    Failed,
    #[serde(other)]
    Unknown,
}

/// One entry of the cluster health report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerHealth {
    #[serde(rename = "Role")]
    pub role: ServerRole,
    #[serde(rename = "Status", default = "unknown_status")]
    pub status: ServerStatus,
    #[serde(rename = "ShortName", default, skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    #[serde(rename = "Endpoint", default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

fn unknown_status() -> ServerStatus {
    ServerStatus::Unknown
}

impl ServerHealth {
    pub fn new(role: ServerRole, status: ServerStatus) -> Self {
        Self {
            role,
            status,
            short_name: None,
            endpoint: None,
        }
    }
}

/// Response of `GET /_admin/cluster/health`, keyed by server id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterHealth {
    #[serde(rename = "ClusterId", default)]
    pub cluster_id: String,
    #[serde(rename = "Health", default)]
    pub health: BTreeMap<String, ServerHealth>,
}

impl ClusterHealth {
    pub fn members(&self) -> impl Iterator<Item = &ServerHealth> {
        self.health.values()
    }

    #[cfg(test)]
    pub fn from_members(members: impl IntoIterator<Item = (ServerRole, ServerStatus)>) -> Self {
        Self {
            cluster_id: "test".to_string(),
            health: members
                .into_iter()
                .enumerate()
                .map(|(i, (role, status))| (format!("server-{i}"), ServerHealth::new(role, status)))
                .collect(),
        }
    }
}

/// Response of `GET /_api/version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub server: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
}
