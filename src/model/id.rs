//! Identity types for deployable units.

use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Maximum length of a scheduler request identifier.
const MAX_REQUEST_ID_LEN: usize = 100;

/// Where the source code for a deployable lives.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Repository, e.g. `github.com/acme/web`.
    pub repo: String,
    /// Directory within the repository, empty for the root.
    #[serde(default)]
    pub dir: String,
}

/// A specific version of a source location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId {
    /// Source location.
    pub location: SourceLocation,
    /// Released version.
    pub version: Version,
}

/// Uniquely identifies one deployable unit within one cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeploymentId {
    /// Cluster name.
    pub cluster: String,
    /// Source location.
    pub location: SourceLocation,
    /// Flavor, empty for the default flavor.
    #[serde(default)]
    pub flavor: String,
}

impl SourceLocation {
    /// Creates a new source location.
    #[must_use]
    pub fn new(repo: impl Into<String>, dir: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            dir: dir.into(),
        }
    }
}

impl SourceId {
    /// Creates a new source identifier.
    #[must_use]
    pub const fn new(location: SourceLocation, version: Version) -> Self {
        Self { location, version }
    }
}

impl DeploymentId {
    /// Creates a new deployment identifier.
    #[must_use]
    pub fn new(
        cluster: impl Into<String>,
        location: SourceLocation,
        flavor: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            location,
            flavor: flavor.into(),
        }
    }

    /// Returns the scheduler request identifier for this deployment.
    ///
    /// The identifier is deterministic, restricted to `[a-z0-9_-]`, and
    /// shortened with a hash suffix when it would exceed the scheduler limit.
    #[must_use]
    pub fn request_id(&self) -> String {
        let raw = format!(
            "{}-{}-{}-{}",
            self.location.repo, self.location.dir, self.flavor, self.cluster
        );
        let sanitized: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();

        if sanitized.len() <= MAX_REQUEST_ID_LEN {
            return sanitized;
        }

        let digest = hex::encode(Sha256::digest(raw.as_bytes()));
        let keep = MAX_REQUEST_ID_LEN - 13;
        format!("{}-{}", &sanitized[..keep], &digest[..12])
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dir.is_empty() {
            write!(f, "{}", self.repo)
        } else {
            write!(f, "{},{}", self.repo, self.dir)
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.location, self.version)
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cluster, self.location)?;
        if !self.flavor.is_empty() {
            write!(f, "~{}", self.flavor)?;
        }
        Ok(())
    }
}
