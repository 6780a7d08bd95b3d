//! Reconciler for maintaining desired state.
//!
//! This module implements the reconciliation loop: read desired state from
//! the store, read what the scheduler is running, diff the two and push every
//! in-scope diff through the per-resource queue set. One cycle never aborts on
//! a failing deployment; failures are counted and left to the next cycle.
//!
//! [`AutoReconciler`] repeats cycles on a fixed minimum interval and keeps a
//! bounded history of recent reports.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::model::ResolveFilter;
use crate::planner::{DiffEngine, DiffResult};
use crate::rectify::{Executor, OutcomeTag, QueueSet, RectifyContext, Resolution};
use crate::scheduler::Deployer;
use crate::state::StateManager;

/// Default number of cycle reports kept by [`AutoReconciler`].
pub const DEFAULT_HISTORY_SIZE: usize = 20;

/// Runs reconciliation cycles.
pub struct Reconciler {
    state: Arc<dyn StateManager>,
    deployer: Arc<dyn Deployer>,
    filter: ResolveFilter,
    queues: QueueSet,
    diff_engine: DiffEngine,
}

/// Result of one reconciliation cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    /// Unique cycle identifier.
    pub cycle_id: Uuid,
    /// When the cycle started.
    pub started_at: DateTime<Utc>,
    /// When the cycle finished.
    pub finished_at: DateTime<Utc>,
    /// Number of desired deployments.
    pub desired: usize,
    /// Number of running deployments.
    pub observed: usize,
    /// Deployments created.
    pub created: usize,
    /// Deployments updated.
    pub updated: usize,
    /// Deployments deleted.
    pub deleted: usize,
    /// Deployments already converged.
    pub unchanged: usize,
    /// Rectifications that failed.
    pub failed: usize,
    /// Pushes replaced by a newer push before they ran.
    pub superseded: usize,
    /// Diffs left alone because they fall outside the scope filter.
    pub out_of_scope: usize,
    /// Errors from failed rectifications.
    pub errors: Vec<String>,
    /// Set when desired or observed state could not be read, in which case
    /// nothing was rectified.
    pub read_error: Option<String>,
}

impl Reconciler {
    /// Creates a reconciler that rectifies through `ctx`.
    #[must_use]
    pub fn new(ctx: RectifyContext) -> Self {
        let queues = QueueSet::new(Arc::new(Executor::new(ctx.clone())));
        Self::with_queues(ctx, queues)
    }

    /// Creates a reconciler that pushes into an existing queue set.
    #[must_use]
    pub fn with_queues(ctx: RectifyContext, queues: QueueSet) -> Self {
        Self {
            state: ctx.state,
            deployer: ctx.deployer,
            filter: ctx.filter,
            queues,
            diff_engine: DiffEngine::new(),
        }
    }

    /// Returns the queue set diffs are pushed into.
    #[must_use]
    pub const fn queues(&self) -> &QueueSet {
        &self.queues
    }

    /// Returns the scope filter.
    #[must_use]
    pub const fn filter(&self) -> &ResolveFilter {
        &self.filter
    }

    /// Computes the in-scope diffs between running and desired state without
    /// acting on them.
    ///
    /// # Errors
    ///
    /// Returns an error if either state cannot be read.
    pub async fn plan(&self) -> Result<DiffResult> {
        let (mut diff, _, _) = self.compute().await?;
        diff.retain(|d| self.filter.matches_deployment(d.subject()));
        Ok(diff)
    }

    async fn compute(&self) -> Result<(DiffResult, usize, usize)> {
        let desired = self.state.read_state().await?;
        let observed = self.deployer.running_deployments(&desired.defs).await?;
        debug!(
            "Read {} desired and {} running deployments",
            desired.deployments.len(),
            observed.len()
        );

        let diff = self.diff_engine.diff(&observed, &desired.deployments);
        Ok((diff, desired.deployments.len(), observed.len()))
    }

    /// Runs one reconciliation cycle.
    ///
    /// Every in-scope diff is pushed before any outcome is awaited, so
    /// different deployments are rectified in parallel.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::new();
        info!("Starting reconciliation cycle {} ({})", report.cycle_id, self.filter);

        let (diff, desired, observed) = match self.compute().await {
            Ok(computed) => computed,
            Err(e) => {
                error!("Cycle {} could not read state: {e}", report.cycle_id);
                report.read_error = Some(e.to_string());
                report.finished_at = Utc::now();
                return report;
            }
        };
        report.desired = desired;
        report.observed = observed;

        let mut queued = Vec::with_capacity(diff.diffs.len());
        for d in diff.diffs {
            if self.filter.matches_deployment(d.subject()) {
                queued.push(self.queues.push(d));
            } else {
                report.out_of_scope += 1;
            }
        }

        for handle in queued {
            report.record(handle.resolution().await);
        }

        report.finished_at = Utc::now();
        if report.failed > 0 {
            warn!("Cycle {} finished: {}", report.cycle_id, report.summary());
        } else {
            info!("Cycle {} finished: {}", report.cycle_id, report.summary());
        }
        report
    }
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("state", &self.state.backend_type())
            .field("deployer", &self.deployer.backend_type())
            .field("filter", &self.filter)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

impl CycleReport {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            cycle_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            desired: 0,
            observed: 0,
            created: 0,
            updated: 0,
            deleted: 0,
            unchanged: 0,
            failed: 0,
            superseded: 0,
            out_of_scope: 0,
            errors: Vec::new(),
            read_error: None,
        }
    }

    fn record(&mut self, resolution: Resolution) {
        let outcome = match resolution {
            Resolution::Completed(outcome) => outcome,
            Resolution::Superseded { by } => {
                debug!("Push superseded by {by}");
                self.superseded += 1;
                return;
            }
        };

        match outcome.tag {
            OutcomeTag::Created => self.created += 1,
            OutcomeTag::Updated => self.updated += 1,
            OutcomeTag::Deleted => self.deleted += 1,
            OutcomeTag::Unchanged => self.unchanged += 1,
            OutcomeTag::Failed => {
                self.failed += 1;
                let message = outcome.error.as_ref().map_or_else(
                    || String::from("unknown error"),
                    |e| {
                        if e.is_transient() {
                            format!("{e} (transient)")
                        } else {
                            e.to_string()
                        }
                    },
                );
                self.errors.push(format!("{}: {message}", outcome.id));
            }
        }
    }

    /// Returns true if state was read and no rectification failed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.read_error.is_none() && self.failed == 0
    }

    /// Returns true if the cycle found nothing to change.
    #[must_use]
    pub const fn is_converged(&self) -> bool {
        self.is_success() && self.created == 0 && self.updated == 0 && self.deleted == 0
    }

    /// How long the cycle took.
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// One-line summary of the counts.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} created, {} updated, {} deleted, {} unchanged, {} failed, {} superseded",
            self.created, self.updated, self.deleted, self.unchanged, self.failed, self.superseded
        )
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.is_success() { "successful" } else { "failed" };
        writeln!(f, "Cycle {} {status}:", self.cycle_id)?;

        if let Some(error) = &self.read_error {
            return writeln!(f, "  Could not read state: {error}");
        }

        writeln!(f, "  Desired: {}", self.desired)?;
        writeln!(f, "  Running: {}", self.observed)?;
        writeln!(f, "  Created: {}", self.created)?;
        writeln!(f, "  Updated: {}", self.updated)?;
        writeln!(f, "  Deleted: {}", self.deleted)?;
        writeln!(f, "  Unchanged: {}", self.unchanged)?;
        writeln!(f, "  Failed: {}", self.failed)?;
        if self.superseded > 0 {
            writeln!(f, "  Superseded: {}", self.superseded)?;
        }
        if self.out_of_scope > 0 {
            writeln!(f, "  Out of scope: {}", self.out_of_scope)?;
        }

        if !self.errors.is_empty() {
            writeln!(f, "  Errors:")?;
            for error in &self.errors {
                writeln!(f, "    - {error}")?;
            }
        }

        Ok(())
    }
}

/// Runs reconciliation cycles on a fixed minimum interval.
#[derive(Debug)]
pub struct AutoReconciler {
    reconciler: Arc<Reconciler>,
    interval: Duration,
    history_size: usize,
}

struct Shared {
    history: Mutex<VecDeque<CycleReport>>,
    history_size: usize,
    skipped: AtomicU64,
    kick: Notify,
}

/// Handle to a running [`AutoReconciler`].
pub struct AutoReconcilerHandle {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AutoReconciler {
    /// Creates a self-scheduling reconciler.
    #[must_use]
    pub fn new(reconciler: Reconciler, interval: Duration) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            interval,
            history_size: DEFAULT_HISTORY_SIZE,
        }
    }

    /// Sets how many cycle reports to keep.
    #[must_use]
    pub fn with_history_size(mut self, history_size: usize) -> Self {
        self.history_size = history_size.max(1);
        self
    }

    /// Starts the loop. The first cycle begins immediately.
    #[must_use]
    pub fn start(self) -> AutoReconcilerHandle {
        let shared = Arc::new(Shared {
            history: Mutex::new(VecDeque::with_capacity(self.history_size)),
            history_size: self.history_size,
            skipped: AtomicU64::new(0),
            kick: Notify::new(),
        });
        let (shutdown, rx) = watch::channel(false);

        info!(
            "Reconciling every {}s ({})",
            self.interval.as_secs(),
            self.reconciler.filter()
        );
        let task = tokio::spawn(run_loop(
            self.reconciler,
            self.interval,
            Arc::clone(&shared),
            rx,
        ));

        AutoReconcilerHandle {
            shared,
            shutdown,
            task,
        }
    }
}

async fn run_loop(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut current: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = shared.kick.notified() => debug!("Cycle requested"),
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        if current.as_ref().is_some_and(|cycle| !cycle.is_finished()) {
            let skipped = shared.skipped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("Previous cycle still outstanding, skipping ({skipped} skipped so far)");
            continue;
        }

        let reconciler = Arc::clone(&reconciler);
        let recorder = Arc::clone(&shared);
        current = Some(tokio::spawn(async move {
            let report = reconciler.run_cycle().await;
            recorder.record(report);
        }));
    }

    if let Some(cycle) = current {
        if let Err(e) = cycle.await {
            error!("Reconciliation cycle did not finish: {e}");
        }
    }
    info!("Reconciler stopped");
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, VecDeque<CycleReport>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, report: CycleReport) {
        let mut history = self.lock();
        while history.len() >= self.history_size {
            history.pop_front();
        }
        history.push_back(report);
    }
}

impl AutoReconcilerHandle {
    /// Requests a cycle now. Ignored if a cycle is still outstanding.
    pub fn kick(&self) {
        self.shared.kick.notify_one();
    }

    /// Recent cycle reports, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<CycleReport> {
        self.shared.lock().iter().cloned().collect()
    }

    /// The most recent cycle report.
    #[must_use]
    pub fn latest(&self) -> Option<CycleReport> {
        self.shared.lock().back().cloned()
    }

    /// Number of cycle starts suppressed because a cycle was outstanding.
    #[must_use]
    pub fn skipped_cycles(&self) -> u64 {
        self.shared.skipped.load(Ordering::Relaxed)
    }

    /// Stops the loop and waits for any outstanding cycle to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Reconciler loop did not stop cleanly: {e}");
        }
    }
}

impl fmt::Debug for AutoReconcilerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoReconcilerHandle")
            .field("skipped_cycles", &self.skipped_cycles())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Cluster, Defs, Deployment, Deployments, SourceId, SourceLocation, State};
    use crate::scheduler::{InMemoryRegistry, RecordingDeployer, SchedulerCall};
    use crate::error::StorageError;
    use crate::model::DeploymentId;
    use crate::state::{HistoryRow, Lifecycle, MemoryStateManager, User, WriteSummary};
    use semver::Version;

    fn deployment(cluster: &str, repo: &str, instances: u32) -> Deployment {
        let source = SourceId::new(SourceLocation::new(repo, ""), Version::new(1, 0, 0));
        Deployment::new(cluster, source, "", instances)
    }

    fn state(deps: Vec<Deployment>) -> State {
        let mut defs = Defs::default();
        defs.add_cluster(Cluster::new("east", "http://east.example"));
        defs.add_cluster(Cluster::new("west", "http://west.example"));
        State::new(defs, Deployments::try_from_iter(deps).expect("unique ids"))
    }

    fn context(
        store: &Arc<MemoryStateManager>,
        deployer: &Arc<RecordingDeployer>,
        filter: ResolveFilter,
    ) -> RectifyContext {
        RectifyContext {
            deployer: deployer.clone(),
            registry: Arc::new(InMemoryRegistry::permissive()),
            filter,
            state: store.clone(),
        }
    }

    async fn wait_for_cycles(handle: &AutoReconcilerHandle, count: usize) {
        for _ in 0..200 {
            if handle.history().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} cycles, saw {}", handle.history().len());
    }

    #[tokio::test]
    async fn test_cycles_converge_and_tombstone() {
        let store = Arc::new(MemoryStateManager::new());
        let deployer = Arc::new(RecordingDeployer::new());
        let reconciler = Reconciler::new(context(&store, &deployer, ResolveFilter::all()));
        let user = User::new("test");
        let web = deployment("east", "github.com/acme/web", 3);

        store.write_state(&state(vec![web.clone()]), &user).await.expect("seed");
        let first = reconciler.run_cycle().await;
        assert_eq!(first.created, 1);
        assert!(first.is_success());
        assert!(matches!(
            deployer.calls().as_slice(),
            [SchedulerCall::Created { .. }, SchedulerCall::Deployed { .. }]
        ));

        deployer.clear_calls();
        let second = reconciler.run_cycle().await;
        assert_eq!(second.unchanged, 1);
        assert!(second.is_converged());
        assert!(deployer.calls().is_empty());

        store.write_state(&state(vec![]), &user).await.expect("remove");
        let third = reconciler.run_cycle().await;
        assert_eq!(third.deleted, 1);
        assert!(matches!(
            deployer.calls().as_slice(),
            [SchedulerCall::Deleted { .. }]
        ));
        assert!(deployer.observed().is_empty());

        let history = store.history(&web.id()).await.expect("history");
        assert_eq!(
            history.iter().map(|row| row.lifecycle).collect::<Vec<_>>(),
            vec![Lifecycle::Active, Lifecycle::Decommissioned]
        );
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_heals() {
        let store = Arc::new(MemoryStateManager::new());
        let deployer = Arc::new(RecordingDeployer::new());
        let reconciler = Reconciler::new(context(&store, &deployer, ResolveFilter::all()));
        let web = deployment("east", "github.com/acme/web", 1);
        let api = deployment("east", "github.com/acme/api", 1);

        store
            .write_state(&state(vec![web.clone(), api.clone()]), &User::new("test"))
            .await
            .expect("seed");
        deployer.fail_for(&web.id());

        let first = reconciler.run_cycle().await;
        assert_eq!(first.created, 1);
        assert_eq!(first.failed, 1);
        assert_eq!(first.errors.len(), 1);
        assert!(first.errors[0].starts_with(&web.id().to_string()));
        assert!(deployer.observed().contains(&api.id()));

        deployer.recover(&web.id());
        let second = reconciler.run_cycle().await;
        assert_eq!(second.created, 1);
        assert_eq!(second.unchanged, 1);
        assert!(second.is_success());
    }

    #[tokio::test]
    async fn test_scope_filter_limits_pushes() {
        let store = Arc::new(MemoryStateManager::new());
        let deployer = Arc::new(RecordingDeployer::new());
        let filter = ResolveFilter::all().with_cluster("east");
        let reconciler = Reconciler::new(context(&store, &deployer, filter));

        store
            .write_state(
                &state(vec![
                    deployment("east", "github.com/acme/web", 1),
                    deployment("west", "github.com/acme/web", 1),
                ]),
                &User::new("test"),
            )
            .await
            .expect("seed");

        let report = reconciler.run_cycle().await;
        assert_eq!(report.created, 1);
        assert_eq!(report.out_of_scope, 1);
        assert!(deployer.calls().iter().all(|call| match call {
            SchedulerCall::Created { cluster, .. } => cluster == "east",
            SchedulerCall::Deployed { id, .. } => id.cluster == "east",
            SchedulerCall::Deleted { .. } => false,
        }));
    }

    #[tokio::test]
    async fn test_plan_does_not_act() {
        let store = Arc::new(MemoryStateManager::new());
        let deployer = Arc::new(RecordingDeployer::new());
        let reconciler = Reconciler::new(context(&store, &deployer, ResolveFilter::all()));
        store
            .write_state(
                &state(vec![deployment("east", "github.com/acme/web", 1)]),
                &User::new("test"),
            )
            .await
            .expect("seed");

        let plan = reconciler.plan().await.expect("plan");
        assert_eq!(plan.added, 1);
        assert!(deployer.calls().is_empty());
    }

    struct Unreadable;

    #[async_trait::async_trait]
    impl StateManager for Unreadable {
        async fn read_state(&self) -> Result<State> {
            Err(StorageError::Connection(String::from("database is locked")).into())
        }

        async fn write_state(&self, _state: &State, _user: &User) -> Result<WriteSummary> {
            Err(StorageError::Connection(String::from("database is locked")).into())
        }

        async fn history(&self, _id: &DeploymentId) -> Result<Vec<HistoryRow>> {
            Ok(Vec::new())
        }

        fn backend_type(&self) -> &'static str {
            "unreadable"
        }
    }

    #[tokio::test]
    async fn test_read_failure_is_reported() {
        let deployer = Arc::new(RecordingDeployer::new());
        let reconciler = Reconciler::new(RectifyContext {
            deployer: deployer.clone(),
            registry: Arc::new(InMemoryRegistry::permissive()),
            filter: ResolveFilter::all(),
            state: Arc::new(Unreadable),
        });

        let report = reconciler.run_cycle().await;
        assert!(report.read_error.is_some());
        assert!(!report.is_success());
        assert!(report.to_string().contains("Could not read state"));
        assert!(deployer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_auto_reconciler_records_history_and_stops() {
        let store = Arc::new(MemoryStateManager::new());
        let deployer = Arc::new(RecordingDeployer::new());
        store
            .write_state(
                &state(vec![deployment("east", "github.com/acme/web", 1)]),
                &User::new("test"),
            )
            .await
            .expect("seed");

        let reconciler = Reconciler::new(context(&store, &deployer, ResolveFilter::all()));
        let handle = AutoReconciler::new(reconciler, Duration::from_secs(3600))
            .with_history_size(2)
            .start();

        wait_for_cycles(&handle, 1).await;
        assert_eq!(handle.latest().map(|r| r.created), Some(1));

        handle.kick();
        wait_for_cycles(&handle, 2).await;
        assert_eq!(handle.latest().map(|r| r.unchanged), Some(1));

        handle.kick();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.kick();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.history().len(), 2);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_auto_reconciler_skips_while_cycle_outstanding() {
        let store = Arc::new(MemoryStateManager::new());
        let deployer =
            Arc::new(RecordingDeployer::new().with_latency(Duration::from_millis(100)));
        store
            .write_state(
                &state(vec![deployment("east", "github.com/acme/web", 1)]),
                &User::new("test"),
            )
            .await
            .expect("seed");

        let reconciler = Reconciler::new(context(&store, &deployer, ResolveFilter::all()));
        let handle = AutoReconciler::new(reconciler, Duration::from_millis(10)).start();

        wait_for_cycles(&handle, 1).await;
        assert!(handle.skipped_cycles() > 0);
        handle.stop().await;

        let created = deployer
            .calls()
            .iter()
            .filter(|call| matches!(call, SchedulerCall::Created { .. }))
            .count();
        assert_eq!(created, 1);
    }
}
