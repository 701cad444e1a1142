pub mod deployment_controller;
pub mod members;
pub mod reconciler;
