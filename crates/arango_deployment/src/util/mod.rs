pub mod config;
pub mod deployment_status;
pub mod errors;
pub mod metrics;
pub mod retry;
pub mod secrets;
pub mod telemetry;
pub mod topology;
