//! In-memory state accessor.
//!
//! Applies exactly the same write plan as the SQL backend over an in-process
//! row log. Used for tests, dry runs and `--storage memory:`.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StorageError};
use crate::model::{Cluster, Defs, Deployment, DeploymentId, Deployments, State};

use super::store::{
    HistoryRow, Lifecycle, StateManager, User, WriteSummary, plan_write, prepare_write,
};

#[derive(Debug, Clone)]
struct Row {
    revision: i64,
    lifecycle: Lifecycle,
    deployment: Arc<Deployment>,
    written_by: String,
    written_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    clusters: BTreeMap<String, Cluster>,
    rows: Vec<Row>,
}

/// Desired-state store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStateManager {
    inner: Mutex<Inner>,
    fail_next_write: AtomicBool,
}

impl MemoryStateManager {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next write fail after its rows are staged.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Total number of rows ever written.
    pub async fn row_count(&self) -> usize {
        self.inner.lock().await.rows.len()
    }
}

impl Inner {
    /// Latest row per deployment, keeping only active ones.
    fn current(&self) -> Deployments {
        let mut latest: HashMap<DeploymentId, &Row> = HashMap::new();
        for row in &self.rows {
            latest.insert(row.deployment.id(), row);
        }

        let mut current = Deployments::new();
        for row in latest.into_values() {
            if row.lifecycle == Lifecycle::Active {
                current.upsert(row.deployment.as_ref().clone());
            }
        }
        current
    }
}

#[async_trait]
impl StateManager for MemoryStateManager {
    async fn read_state(&self) -> Result<State> {
        let inner = self.inner.lock().await;
        Ok(State::new(
            Defs {
                clusters: inner.clusters.clone(),
            },
            inner.current(),
        ))
    }

    async fn write_state(&self, state: &State, user: &User) -> Result<WriteSummary> {
        let state = prepare_write(state)?;

        let mut inner = self.inner.lock().await;
        let plan = plan_write(&inner.current(), &state.deployments);

        let now = Utc::now();
        let written_by = user.to_string();
        let mut revision = inner.rows.last().map_or(0, |r| r.revision);
        let mut staged = Vec::with_capacity(plan.updates.len() + plan.tombstones.len());

        let rows = plan
            .updates
            .iter()
            .map(|d| (Lifecycle::Active, d))
            .chain(plan.tombstones.iter().map(|d| (Lifecycle::Decommissioned, d)));
        for (lifecycle, deployment) in rows {
            revision += 1;
            staged.push(Row {
                revision,
                lifecycle,
                deployment: Arc::clone(deployment),
                written_by: written_by.clone(),
                written_at: now,
            });
        }

        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(StorageError::transaction("committing", "injected failure").into());
        }

        for cluster in state.defs.clusters.values() {
            inner.clusters.insert(cluster.name.clone(), cluster.clone());
        }
        inner.rows.extend(staged);

        let summary = plan.summary();
        if plan.is_empty() {
            debug!("Desired state unchanged");
        } else {
            info!(
                "Wrote desired state: {} updated, {} decommissioned",
                summary.updated, summary.decommissioned
            );
        }
        Ok(summary)
    }

    async fn history(&self, id: &DeploymentId) -> Result<Vec<HistoryRow>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rows
            .iter()
            .filter(|row| row.deployment.id() == *id)
            .map(|row| HistoryRow {
                revision: row.revision,
                lifecycle: row.lifecycle,
                deployment: row.deployment.as_ref().clone(),
                written_by: row.written_by.clone(),
                written_at: row.written_at,
            })
            .collect())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Resources, SourceId, SourceLocation};
    use semver::Version;

    fn dep(repo: &str, instances: u32) -> Deployment {
        let source = SourceId::new(SourceLocation::new(repo, ""), Version::new(1, 0, 0));
        let mut dep = Deployment::new("east", source, "", instances);
        dep.resources = Resources::new()
            .with("cpus", "0.1")
            .with("memory", "100")
            .with("ports", "1");
        dep
    }

    fn state(deps: Vec<Deployment>) -> State {
        let mut defs = Defs::default();
        defs.add_cluster(Cluster::new("east", "http://east.example"));
        State::new(defs, Deployments::try_from_iter(deps).expect("set"))
    }

    #[tokio::test]
    async fn test_repeated_write_changes_nothing() {
        let store = MemoryStateManager::new();
        let desired = state(vec![dep("a", 1), dep("b", 2)]);
        let user = User::new("ops");

        store.write_state(&desired, &user).await.expect("first write");
        let rows = store.row_count().await;
        let summary = store.write_state(&desired, &user).await.expect("second write");

        assert_eq!(summary.updated + summary.decommissioned, 0);
        assert_eq!(store.row_count().await, rows);
        assert_eq!(store.read_state().await.expect("read"), desired);
    }

    #[tokio::test]
    async fn test_removal_writes_tombstone() {
        let store = MemoryStateManager::new();
        let user = User::new("ops");
        store.write_state(&state(vec![dep("a", 1)]), &user).await.expect("write");
        store.write_state(&state(vec![]), &user).await.expect("remove");

        assert!(store.read_state().await.expect("read").deployments.is_empty());
        let history = store.history(&dep("a", 1).id()).await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].lifecycle, Lifecycle::Active);
        assert_eq!(history[1].lifecycle, Lifecycle::Decommissioned);
        assert_eq!(history[1].deployment.num_instances, 1);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_state_unchanged() {
        let store = MemoryStateManager::new();
        let user = User::new("ops");
        let before = state(vec![dep("a", 1)]);
        store.write_state(&before, &user).await.expect("write");

        store.fail_next_write();
        let result = store.write_state(&state(vec![dep("a", 5), dep("b", 1)]), &user).await;
        assert!(result.is_err());
        assert_eq!(store.read_state().await.expect("read"), before);
        assert_eq!(store.row_count().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_state_is_rejected_before_writing() {
        let store = MemoryStateManager::new();
        let mut bad = state(vec![dep("a", 1)]);
        bad.defs.clusters.clear();
        assert!(store.write_state(&bad, &User::new("ops")).await.is_err());
        assert_eq!(store.row_count().await, 0);
    }

    #[tokio::test]
    async fn test_readd_after_removal_is_active_again() {
        let store = MemoryStateManager::new();
        let user = User::new("ops");
        store.write_state(&state(vec![dep("a", 1)]), &user).await.expect("add");
        store.write_state(&state(vec![]), &user).await.expect("remove");
        store.write_state(&state(vec![dep("a", 3)]), &user).await.expect("re-add");

        let current = store.read_state().await.expect("read");
        assert_eq!(current.deployments.get(&dep("a", 1).id()).map(|d| d.num_instances), Some(3));
        assert_eq!(store.history(&dep("a", 1).id()).await.expect("history").len(), 3);
    }
}
