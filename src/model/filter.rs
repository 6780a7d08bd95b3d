//! Scope filter restricting which deployments a cycle acts on.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::deployment::Deployment;
use super::id::DeploymentId;

/// Predicate over cluster, repository, directory, flavor and version tag.
///
/// Each `None` field matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveFilter {
    /// Cluster name.
    pub cluster: Option<String>,
    /// Source repository.
    pub repo: Option<String>,
    /// Directory within the repository.
    pub dir: Option<String>,
    /// Flavor.
    pub flavor: Option<String>,
    /// Version string.
    pub tag: Option<String>,
}

impl ResolveFilter {
    /// A filter that matches everything.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            cluster: None,
            repo: None,
            dir: None,
            flavor: None,
            tag: None,
        }
    }

    /// Restricts the filter to one cluster.
    #[must_use]
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    /// Restricts the filter to one repository.
    #[must_use]
    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    /// Restricts the filter to one version tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Returns true if the filter matches everything.
    #[must_use]
    pub const fn is_all(&self) -> bool {
        self.cluster.is_none()
            && self.repo.is_none()
            && self.dir.is_none()
            && self.flavor.is_none()
            && self.tag.is_none()
    }

    /// Checks the identity fields against an ID. The tag is not considered.
    #[must_use]
    pub fn matches_id(&self, id: &DeploymentId) -> bool {
        field_matches(self.cluster.as_ref(), &id.cluster)
            && field_matches(self.repo.as_ref(), &id.location.repo)
            && field_matches(self.dir.as_ref(), &id.location.dir)
            && field_matches(self.flavor.as_ref(), &id.flavor)
    }

    /// Checks every field against a deployment.
    #[must_use]
    pub fn matches_deployment(&self, deployment: &Deployment) -> bool {
        self.matches_id(&deployment.id())
            && self
                .tag
                .as_ref()
                .is_none_or(|tag| *tag == deployment.source_id.version.to_string())
    }
}

fn field_matches(want: Option<&String>, have: &str) -> bool {
    want.is_none_or(|w| w == have)
}

impl fmt::Display for ResolveFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            return write!(f, "<all>");
        }
        let parts: Vec<String> = [
            ("cluster", &self.cluster),
            ("repo", &self.repo),
            ("dir", &self.dir),
            ("flavor", &self.flavor),
            ("tag", &self.tag),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_ref().map(|v| format!("{name}={v}")))
        .collect();
        write!(f, "{}", parts.join(" "))
    }
}
