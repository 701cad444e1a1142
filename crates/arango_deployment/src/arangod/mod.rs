pub mod client;
pub mod types;

pub use client::{ArangoClient, HttpArangoClient};
pub use types::{ClusterHealth, ServerHealth, ServerRole, ServerStatus, VersionInfo};
