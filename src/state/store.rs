//! State accessor trait definition.
//!
//! This module defines the common interface for desired-state backends and
//! the write plan every backend applies.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::error::Result;
use crate::model::{Deployment, DeploymentId, Deployments, State};
use crate::planner::{Change, DiffEngine};

/// Whether a history row is a live configuration or a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// The configuration is desired.
    Active,
    /// The deployment was removed; the row keeps its last configuration.
    Decommissioned,
}

/// The operator writing desired state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Display name.
    pub name: String,
    /// Email address, if known.
    #[serde(default)]
    pub email: Option<String>,
}

/// One persisted revision of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRow {
    /// Monotonic revision number, unique across the store.
    pub revision: i64,
    /// Row lifecycle.
    pub lifecycle: Lifecycle,
    /// Configuration at this revision.
    pub deployment: Deployment,
    /// Who wrote it.
    pub written_by: String,
    /// When it was written.
    pub written_at: DateTime<Utc>,
}

/// Rows a write must append.
#[derive(Debug, Clone, Default)]
pub struct WritePlan {
    /// Added or modified deployments, written as active rows.
    pub updates: Vec<Arc<Deployment>>,
    /// Removed deployments, written as decommissioned rows.
    pub tombstones: Vec<Arc<Deployment>>,
    /// Number of deployments left untouched.
    pub unchanged: usize,
}

/// Summary of an applied write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    /// Active rows appended.
    pub updated: usize,
    /// Tombstones appended.
    pub decommissioned: usize,
    /// Deployments left untouched.
    pub unchanged: usize,
}

/// Trait for desired-state backends.
///
/// Implementations must be safe to call concurrently from independent
/// reconciliation cycles.
#[async_trait]
pub trait StateManager: Send + Sync {
    /// Reads the current desired state.
    async fn read_state(&self) -> Result<State>;

    /// Writes a new desired state.
    ///
    /// The write is all-or-nothing. Deployments that are unchanged are not
    /// touched, changed ones are appended as new active rows and removed ones
    /// are appended as tombstones.
    async fn write_state(&self, state: &State, user: &User) -> Result<WriteSummary>;

    /// Returns every persisted revision of a deployment, oldest first.
    async fn history(&self, id: &DeploymentId) -> Result<Vec<HistoryRow>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateManager for Box<dyn StateManager> {
    async fn read_state(&self) -> Result<State> {
        (**self).read_state().await
    }

    async fn write_state(&self, state: &State, user: &User) -> Result<WriteSummary> {
        (**self).write_state(state, user).await
    }

    async fn history(&self, id: &DeploymentId) -> Result<Vec<HistoryRow>> {
        (**self).history(id).await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

/// Repairs and validates a state before it is written.
///
/// Missing resource fields are filled with their defaults so that stored
/// desired state compares equal to what the scheduler reports back.
///
/// # Errors
///
/// Returns a validation error for flaws that cannot be repaired or for
/// deployments on undefined clusters.
pub fn prepare_write(state: &State) -> Result<State> {
    let mut prepared = state.clone();
    for flaw in prepared.repair() {
        warn!("Repaired before writing: {flaw}");
    }
    prepared.validate()?;
    Ok(prepared)
}

/// Plans a write of `next` over the persisted `current` deployments.
#[must_use]
pub fn plan_write(current: &Deployments, next: &Deployments) -> WritePlan {
    let diff = DiffEngine::new().diff(current, next);
    let mut plan = WritePlan::default();

    for d in diff.diffs {
        match d.change {
            Change::Added { post } | Change::Modified { post, .. } => plan.updates.push(post),
            Change::Removed { prior } => plan.tombstones.push(prior),
            Change::Same { .. } => plan.unchanged += 1,
        }
    }

    plan
}

impl WritePlan {
    /// Returns true if the write changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.tombstones.is_empty()
    }

    /// Summary of this plan once applied.
    #[must_use]
    pub fn summary(&self) -> WriteSummary {
        WriteSummary {
            updated: self.updates.len(),
            decommissioned: self.tombstones.len(),
            unchanged: self.unchanged,
        }
    }
}

impl User {
    /// Creates a user with only a name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: None,
        }
    }

    /// Creates a user with a name and email.
    #[must_use]
    pub fn with_email(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: Some(email.into()),
        }
    }

    /// The operator running this process: `$USER@<hostname>`.
    #[must_use]
    pub fn current() -> Self {
        let name = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| String::from("unknown"));
        let hostname = hostname::get()
            .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());
        Self::with_email(name.clone(), format!("{name}@{hostname}"))
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.email {
            Some(email) => write!(f, "{} <{email}>", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Decommissioned => write!(f, "decommissioned"),
        }
    }
}

impl std::str::FromStr for Lifecycle {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "decommissioned" => Ok(Self::Decommissioned),
            other => Err(format!("unknown lifecycle: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SourceId, SourceLocation};
    use semver::Version;

    fn dep(repo: &str, instances: u32) -> Deployment {
        let source = SourceId::new(SourceLocation::new(repo, ""), Version::new(1, 0, 0));
        Deployment::new("east", source, "", instances)
    }

    #[test]
    fn test_plan_write_partitions_changes() {
        let current =
            Deployments::try_from_iter([dep("a", 1), dep("b", 1), dep("c", 1)]).expect("set");
        let next =
            Deployments::try_from_iter([dep("b", 1), dep("c", 2), dep("d", 1)]).expect("set");

        let plan = plan_write(&current, &next);
        let repo = |d: &Arc<Deployment>| d.source_id.location.repo.clone();
        let updated: Vec<String> = plan.updates.iter().map(repo).collect();
        let removed: Vec<String> = plan.tombstones.iter().map(repo).collect();

        assert_eq!(updated, vec!["c", "d"]);
        assert_eq!(removed, vec!["a"]);
        assert_eq!(plan.unchanged, 1);
        assert_eq!(
            plan.summary(),
            WriteSummary {
                updated: 2,
                decommissioned: 1,
                unchanged: 1
            }
        );
    }

    #[test]
    fn test_plan_write_of_same_state_is_empty() {
        let current = Deployments::try_from_iter([dep("a", 1)]).expect("set");
        assert!(plan_write(&current, &current.snapshot()).is_empty());
    }

    #[test]
    fn test_prepare_write_repairs_missing_resources() {
        use crate::model::{Cluster, Resources};

        let mut bare = dep("a", 1);
        bare.resources = Resources::new().with("cpus", "2");
        let mut state = State::default();
        state.defs.add_cluster(Cluster::new("east", "http://east.example"));
        state.deployments.upsert(bare);

        let prepared = prepare_write(&state).expect("repairable");
        let stored = prepared.deployments.get(&dep("a", 1).id()).expect("present");
        assert_eq!(stored.resources.get("memory"), Some("100"));
        assert_eq!(stored.resources.get("cpus"), Some("2"));

        let mut broken = state;
        let mut malformed = dep("a", 1);
        malformed.resources.insert("memory", "lots");
        broken.deployments.upsert(malformed);
        assert!(prepare_write(&broken).is_err());
    }

    #[test]
    fn test_user_display() {
        assert_eq!(User::new("ops").to_string(), "ops");
        assert_eq!(
            User::with_email("ops", "ops@acme.example").to_string(),
            "ops <ops@acme.example>"
        );
        assert!(User::current().email.is_some());
    }
}
