//! Revision markers for deploys.
//!
//! A revision marker is a deterministic hash over everything a deploy pushes
//! to the scheduler. Two deploys of the same configuration carry the same
//! marker, which makes re-deploys idempotent and gives the audit trail a
//! stable handle.

use sha2::{Digest, Sha256};

use super::deployment::Deployment;

/// Length of the hash suffix in a deploy ID.
const DEPLOY_ID_HASH_LEN: usize = 8;

/// Hasher for computing deploy revision markers.
#[derive(Debug, Default, Clone, Copy)]
pub struct RevisionHasher;

impl RevisionHasher {
    /// Creates a new revision hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the revision marker of a deployment built from an artifact.
    #[must_use]
    pub fn revision(&self, deployment: &Deployment, artifact: &str) -> String {
        let mut hasher = Sha256::new();

        // Identity and artifact
        hasher.update(deployment.id().to_string().as_bytes());
        hasher.update(deployment.source_id.version.to_string().as_bytes());
        hasher.update(artifact.as_bytes());

        hasher.update(deployment.kind.to_string().as_bytes());
        hasher.update(deployment.num_instances.to_be_bytes());
        hasher.update(deployment.schedule.as_bytes());

        // Numeric resources are normalised so formatting never changes the marker
        hasher.update(deployment.resources.cpus().to_be_bytes());
        hasher.update(deployment.resources.memory().to_be_bytes());
        hasher.update(deployment.resources.ports().to_be_bytes());
        for (name, value) in deployment.resources.iter() {
            if !matches!(name, "cpus" | "memory" | "ports") {
                hasher.update(name.as_bytes());
                hasher.update(value.as_bytes());
            }
        }

        for (key, value) in &deployment.env {
            hasher.update(key.as_bytes());
            hasher.update(value.as_bytes());
        }
        for (key, value) in &deployment.metadata {
            hasher.update(key.as_bytes());
            hasher.update(value.as_bytes());
        }
        for owner in &deployment.owners {
            hasher.update(owner.as_bytes());
        }

        for volume in &deployment.volumes {
            hasher.update(volume.host.as_bytes());
            hasher.update(volume.container.as_bytes());
            hasher.update(format!("{:?}", volume.mode).as_bytes());
        }

        let startup = &deployment.startup;
        hasher.update([u8::from(startup.skip_check)]);
        hasher.update(startup.connect_delay.to_be_bytes());
        hasher.update(startup.timeout.to_be_bytes());
        hasher.update(startup.connect_interval.to_be_bytes());
        hasher.update(startup.check_ready_protocol.as_bytes());
        hasher.update(startup.check_ready_uri_path.as_bytes());
        hasher.update(startup.check_ready_port_index.to_be_bytes());
        for status in &startup.check_ready_failure_statuses {
            hasher.update(status.to_be_bytes());
        }
        hasher.update(startup.check_ready_uri_timeout.to_be_bytes());
        hasher.update(startup.check_ready_interval.to_be_bytes());
        hasher.update(startup.check_ready_retries.to_be_bytes());

        hex::encode(hasher.finalize())
    }

    /// Builds a scheduler deploy ID: `<version>_<hash8>`, restricted to
    /// characters the scheduler accepts.
    #[must_use]
    pub fn deploy_id(&self, deployment: &Deployment, artifact: &str) -> String {
        let version: String = deployment
            .source_id
            .version
            .to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let revision = self.revision(deployment, artifact);
        format!("{version}_{}", &revision[..DEPLOY_ID_HASH_LEN])
    }
}
