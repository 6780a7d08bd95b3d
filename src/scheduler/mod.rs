//! Scheduler integration module.
//!
//! This module provides the scheduler capability the engine drives, its
//! Singularity HTTP implementation, a recording double, and the artifact
//! registry capability used to build deploys.

mod client;
mod deployer;
mod recording;
mod registry;
mod types;

pub use client::SingularityClient;
pub use deployer::Deployer;
pub use recording::{RecordingDeployer, SchedulerCall};
#[cfg(test)]
pub use registry::MockRegistry;
pub use registry::{BuildArtifact, DockerRegistry, InMemoryRegistry, Registry, image_path};
pub use types::{
    DeployRequest, RequestParent, RequestType, SingularityDeploy, SingularityRequest,
};
