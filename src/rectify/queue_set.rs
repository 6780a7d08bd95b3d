//! Per-resource queue set.
//!
//! Rectifications for one [`DeploymentId`] run strictly one after another;
//! different IDs run in parallel. Each ID holds at most one in-flight and one
//! pending rectification. A push while another is pending replaces it, and
//! the replaced push resolves as [`Resolution::Superseded`].
//!
//! A worker task exists exactly while its ID has an entry in the table. The
//! worker removes the entry itself, under the table lock, once nothing is
//! pending, so a later push always finds either a live worker or no entry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::RectifyError;
use crate::model::DeploymentId;
use crate::planner::{Diff, DiffKind};

use super::rectification::{Rectification, RectificationOutcome, RectifyContext};

/// Executes one rectification from start to finish.
#[async_trait]
pub trait RectificationHandler: Send + Sync {
    /// Runs the rectification and returns its outcome.
    async fn handle(&self, rectification: Rectification) -> RectificationOutcome;
}

/// Handler that begins a rectification against real capabilities and waits
/// for it.
#[derive(Debug, Clone)]
pub struct Executor {
    ctx: RectifyContext,
}

impl Executor {
    /// Creates an executor acting through `ctx`.
    #[must_use]
    pub const fn new(ctx: RectifyContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl RectificationHandler for Executor {
    async fn handle(&self, mut rectification: Rectification) -> RectificationOutcome {
        let id = rectification.id().clone();
        let kind = rectification.diff().kind();
        let result = match rectification.begin(self.ctx.clone()) {
            Ok(()) => rectification.wait().await,
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| RectificationOutcome::failed(id, kind, e))
    }
}

/// How a push was resolved.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The rectification ran.
    Completed(RectificationOutcome),
    /// A newer push replaced this one before it started.
    Superseded {
        /// Ticket of the push that replaced it.
        by: Uuid,
    },
}

/// Handle to one pushed diff.
#[derive(Debug)]
pub struct QueuedRectification {
    ticket: Uuid,
    id: DeploymentId,
    kind: DiffKind,
    rx: oneshot::Receiver<Resolution>,
}

/// Snapshot of one ID's queue, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct QueueStatus {
    /// Deployment identity.
    pub id: DeploymentId,
    /// Ticket of the running rectification.
    pub in_flight: Option<Uuid>,
    /// Ticket of the waiting rectification.
    pub pending: Option<Uuid>,
}

struct Pending {
    ticket: Uuid,
    rectification: Rectification,
    tx: oneshot::Sender<Resolution>,
}

#[derive(Default)]
struct Slot {
    in_flight: Option<Uuid>,
    pending: Option<Pending>,
}

struct Inner {
    handler: Arc<dyn RectificationHandler>,
    slots: Mutex<HashMap<DeploymentId, Slot>>,
}

/// Serialises rectifications per deployment.
#[derive(Clone)]
pub struct QueueSet {
    inner: Arc<Inner>,
}

impl QueuedRectification {
    /// Ticket identifying this push.
    #[must_use]
    pub const fn ticket(&self) -> Uuid {
        self.ticket
    }

    /// Deployment this push targets.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.id
    }

    /// Waits until the push is executed or superseded.
    pub async fn resolution(self) -> Resolution {
        match self.rx.await {
            Ok(resolution) => resolution,
            Err(_) => Resolution::Completed(RectificationOutcome::failed(
                self.id.clone(),
                self.kind,
                RectifyError::Abandoned {
                    deployment: self.id.to_string(),
                    reason: String::from("queue worker stopped"),
                }
                .into(),
            )),
        }
    }
}

impl QueueSet {
    /// Creates a queue set that runs rectifications through `handler`.
    #[must_use]
    pub fn new(handler: Arc<dyn RectificationHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                handler,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Queues a diff for rectification.
    ///
    /// Starts a worker if the ID has none; otherwise replaces any pending
    /// diff, resolving the replaced push as superseded.
    #[must_use = "dropping the handle discards the resolution"]
    pub fn push(&self, diff: Diff) -> QueuedRectification {
        let ticket = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let id = diff.id.clone();
        let kind = diff.kind();
        let pending = Pending {
            ticket,
            rectification: Rectification::new(diff),
            tx,
        };

        let mut slots = self.inner.lock_slots();
        match slots.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                if let Some(mut replaced) = entry.get_mut().pending.replace(pending) {
                    debug!("Push {ticket} for {id} supersedes {}", replaced.ticket);
                    if let Err(e) = replaced.rectification.cancel() {
                        warn!("Could not cancel superseded rectification: {e}");
                    }
                    let _ = replaced.tx.send(Resolution::Superseded { by: ticket });
                }
            }
            Entry::Vacant(entry) => {
                debug!("Starting queue for {id}");
                entry.insert(Slot {
                    in_flight: None,
                    pending: Some(pending),
                });
                tokio::spawn(run_worker(Arc::clone(&self.inner), id.clone()));
            }
        }
        drop(slots);

        QueuedRectification {
            ticket,
            id,
            kind,
            rx,
        }
    }

    /// Lists every ID with queued or running work.
    #[must_use]
    pub fn queued(&self) -> Vec<QueueStatus> {
        let slots = self.inner.lock_slots();
        let mut statuses: Vec<QueueStatus> = slots
            .iter()
            .map(|(id, slot)| QueueStatus {
                id: id.clone(),
                in_flight: slot.in_flight,
                pending: slot.pending.as_ref().map(|p| p.ticket),
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Number of IDs with queued or running work.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock_slots().len()
    }

    /// Returns true if no work is queued or running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock_slots().is_empty()
    }
}

impl Inner {
    fn lock_slots(&self) -> MutexGuard<'_, HashMap<DeploymentId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the next pending item, or tears the queue down when none is left.
    fn next(&self, id: &DeploymentId) -> Option<Pending> {
        let mut slots = self.lock_slots();
        let Some(slot) = slots.get_mut(id) else {
            warn!("Queue for {id} vanished while its worker was running");
            return None;
        };

        match slot.pending.take() {
            Some(pending) => {
                slot.in_flight = Some(pending.ticket);
                Some(pending)
            }
            None => {
                debug!("Queue for {id} drained");
                slots.remove(id);
                None
            }
        }
    }
}

async fn run_worker(inner: Arc<Inner>, id: DeploymentId) {
    while let Some(pending) = inner.next(&id) {
        let Pending {
            ticket,
            rectification,
            tx,
        } = pending;
        let kind = rectification.diff().kind();
        let handler = Arc::clone(&inner.handler);

        // Run on its own task so a panicking handler cannot take the worker
        // down with it.
        let outcome = match tokio::spawn(async move { handler.handle(rectification).await }).await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Rectification {ticket} for {id} did not finish: {e}");
                RectificationOutcome::failed(
                    id.clone(),
                    kind,
                    RectifyError::Abandoned {
                        deployment: id.to_string(),
                        reason: e.to_string(),
                    }
                    .into(),
                )
            }
        };

        if tx.send(Resolution::Completed(outcome)).is_err() {
            debug!("Nobody is waiting for rectification {ticket}");
        }
    }
}

impl std::fmt::Debug for QueueSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSet")
            .field("queues", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Deployment, Deployments, SourceId, SourceLocation};
    use crate::planner::Change;
    use crate::rectify::OutcomeTag;
    use semver::Version;
    use std::time::Duration;
    use tokio::sync::{Barrier, Semaphore, mpsc};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn added(repo: &str, instances: u32) -> Diff {
        let source = SourceId::new(SourceLocation::new(repo, ""), Version::new(1, 0, 0));
        let post = Arc::new(Deployment::new("east", source, "", instances));
        Diff {
            id: post.id(),
            change: Change::Added { post },
        }
    }

    fn completed(id: &DeploymentId) -> RectificationOutcome {
        RectificationOutcome {
            id: id.clone(),
            kind: DiffKind::Added,
            tag: OutcomeTag::Created,
            error: None,
            deploy_id: None,
            detail: None,
        }
    }

    /// Reports each start, then blocks until a permit is released.
    struct GatedHandler {
        started: mpsc::UnboundedSender<u32>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl RectificationHandler for GatedHandler {
        async fn handle(&self, rectification: Rectification) -> RectificationOutcome {
            let instances = rectification
                .diff()
                .post()
                .map_or(0, |post| post.num_instances);
            let _ = self.started.send(instances);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            completed(rectification.id())
        }
    }

    struct BarrierHandler {
        barrier: Arc<Barrier>,
    }

    #[async_trait]
    impl RectificationHandler for BarrierHandler {
        async fn handle(&self, rectification: Rectification) -> RectificationOutcome {
            self.barrier.wait().await;
            completed(rectification.id())
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl RectificationHandler for PanickingHandler {
        async fn handle(&self, _rectification: Rectification) -> RectificationOutcome {
            panic!("handler exploded");
        }
    }

    fn gated() -> (QueueSet, mpsc::UnboundedReceiver<u32>, Arc<Semaphore>) {
        let (started, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        let handler = GatedHandler {
            started,
            gate: Arc::clone(&gate),
        };
        (QueueSet::new(Arc::new(handler)), rx, gate)
    }

    async fn drained(queues: &QueueSet) {
        timeout(WAIT, async {
            while !queues.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue should drain");
    }

    #[tokio::test]
    async fn test_pushes_coalesce_to_in_flight_plus_latest() {
        let (queues, mut started, gate) = gated();

        let first = queues.push(added("github.com/acme/web", 1));
        assert_eq!(timeout(WAIT, started.recv()).await.expect("start"), Some(1));

        let middle: Vec<_> = (2..=4)
            .map(|n| queues.push(added("github.com/acme/web", n)))
            .collect();
        let last = queues.push(added("github.com/acme/web", 5));

        let status = queues.queued();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].in_flight, Some(first.ticket()));
        assert_eq!(status[0].pending, Some(last.ticket()));

        gate.add_permits(10);

        assert!(matches!(first.resolution().await, Resolution::Completed(_)));
        for queued in middle {
            match queued.resolution().await {
                Resolution::Superseded { .. } => {}
                Resolution::Completed(outcome) => panic!("intermediate push ran: {outcome}"),
            }
        }
        assert!(matches!(last.resolution().await, Resolution::Completed(_)));

        assert_eq!(timeout(WAIT, started.recv()).await.expect("start"), Some(5));
        drained(&queues).await;
        assert!(started.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_superseded_points_at_replacement() {
        let (queues, mut started, gate) = gated();
        let _running = queues.push(added("github.com/acme/web", 1));
        timeout(WAIT, started.recv()).await.expect("start");

        let replaced = queues.push(added("github.com/acme/web", 2));
        let replacement = queues.push(added("github.com/acme/web", 3));
        let replacement_ticket = replacement.ticket();

        match replaced.resolution().await {
            Resolution::Superseded { by } => assert_eq!(by, replacement_ticket),
            Resolution::Completed(_) => panic!("replaced push should not run"),
        }
        gate.add_permits(10);
        assert!(matches!(replacement.resolution().await, Resolution::Completed(_)));
    }

    #[tokio::test]
    async fn test_distinct_ids_run_in_parallel() {
        const K: usize = 6;
        let handler = BarrierHandler {
            barrier: Arc::new(Barrier::new(K)),
        };
        let queues = QueueSet::new(Arc::new(handler));

        let pushed: Vec<_> = (0..K)
            .map(|i| queues.push(added(&format!("github.com/acme/svc{i}"), 1)))
            .collect();
        assert_eq!(queues.len(), K);

        for queued in pushed {
            let resolution = timeout(WAIT, queued.resolution())
                .await
                .expect("every id should proceed without waiting on the others");
            assert!(matches!(resolution, Resolution::Completed(_)));
        }
    }

    #[tokio::test]
    async fn test_push_after_teardown_recreates_queue() {
        let (queues, _started, gate) = gated();
        gate.add_permits(100);

        let first = queues.push(added("github.com/acme/web", 1));
        assert!(matches!(first.resolution().await, Resolution::Completed(_)));
        drained(&queues).await;

        let second = queues.push(added("github.com/acme/web", 2));
        let resolution = timeout(WAIT, second.resolution()).await.expect("resolved");
        assert!(matches!(resolution, Resolution::Completed(_)));
        drained(&queues).await;
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_outcome_and_queue_survives() {
        let queues = QueueSet::new(Arc::new(PanickingHandler));

        let queued = queues.push(added("github.com/acme/web", 1));
        match timeout(WAIT, queued.resolution()).await.expect("resolved") {
            Resolution::Completed(outcome) => {
                assert_eq!(outcome.tag, OutcomeTag::Failed);
                assert!(outcome.error.is_some());
            }
            Resolution::Superseded { .. } => panic!("nothing superseded it"),
        }
        drained(&queues).await;
    }

    #[tokio::test]
    async fn test_executor_runs_rectification() {
        use crate::model::{Cluster, Defs, ResolveFilter, State};
        use crate::scheduler::{InMemoryRegistry, RecordingDeployer};
        use crate::state::{MemoryStateManager, StateManager, User};

        let diff = added("github.com/acme/web", 2);
        let mut defs = Defs::default();
        defs.add_cluster(Cluster::new("east", "http://east.example"));
        let desired = Deployments::try_from_iter([diff.post().expect("post").as_ref().clone()])
            .expect("deployments");
        let store = Arc::new(MemoryStateManager::new());
        store
            .write_state(&State::new(defs, desired), &User::new("test"))
            .await
            .expect("seed");

        let deployer = Arc::new(RecordingDeployer::new());
        let executor = Executor::new(RectifyContext {
            deployer: deployer.clone(),
            registry: Arc::new(InMemoryRegistry::permissive()),
            filter: ResolveFilter::all(),
            state: store,
        });
        let queues = QueueSet::new(Arc::new(executor));

        match queues.push(diff).resolution().await {
            Resolution::Completed(outcome) => assert_eq!(outcome.tag, OutcomeTag::Created),
            Resolution::Superseded { .. } => panic!("nothing superseded it"),
        }
        assert_eq!(deployer.calls().len(), 2);
    }
}
