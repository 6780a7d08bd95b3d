//! Everything the scheduler needs to run one deployment.

use std::sync::Arc;

use crate::model::{Cluster, Deployment, RevisionHasher};
use crate::scheduler::BuildArtifact;

/// A deployment paired with its cluster and resolved artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct Deployable {
    /// Desired configuration.
    pub deployment: Arc<Deployment>,
    /// Target cluster.
    pub cluster: Cluster,
    /// Artifact to run.
    pub artifact: BuildArtifact,
}

impl Deployable {
    /// Creates a deployable.
    #[must_use]
    pub const fn new(
        deployment: Arc<Deployment>,
        cluster: Cluster,
        artifact: BuildArtifact,
    ) -> Self {
        Self {
            deployment,
            cluster,
            artifact,
        }
    }

    /// Revision marker over the artifact and full configuration.
    #[must_use]
    pub fn revision(&self) -> String {
        RevisionHasher::new().revision(&self.deployment, &self.artifact.reference())
    }

    /// Scheduler deploy identifier.
    #[must_use]
    pub fn deploy_id(&self) -> String {
        RevisionHasher::new().deploy_id(&self.deployment, &self.artifact.reference())
    }
}
