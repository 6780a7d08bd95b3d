//! Rectification state machine.
//!
//! A rectification turns one [`Diff`] into the single scheduler call it
//! implies:
//!
//! | Diff     | Calls                                |
//! |----------|--------------------------------------|
//! | Same     | none                                 |
//! | Added    | `post_request` then `deploy`         |
//! | Modified | `deploy` (carries the instance count)|
//! | Removed  | `delete_request`                     |
//!
//! States move `Created -> Started -> Succeeded | Failed`, or
//! `Created -> Cancelled` when a newer diff supersedes it before it starts.
//! Nothing is retried here; the next reconciliation cycle re-derives the diff.
//! Every action re-reads desired state first and fails with
//! [`RectifyError::StaleDiff`] if the diff no longer describes it.

use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{ConvergeError, RectifyError, Result, ValidationError};
use crate::model::{Cluster, Deployment, DeploymentId, ResolveFilter};
use crate::planner::{Change, Diff, DiffKind};
use crate::scheduler::{Deployer, Registry};
use crate::state::StateManager;

use super::deployable::Deployable;

/// Message attached to soft deletions.
const REMOVAL_MESSAGE: &str = "removed from desired state by converge";

/// Lifecycle of a rectification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RectificationState {
    /// Waiting to start.
    Created,
    /// The scheduler call is running.
    Started,
    /// Finished without error.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Superseded before starting.
    Cancelled,
}

/// What a finished rectification did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeTag {
    /// Request registered and first deploy pushed.
    Created,
    /// New deploy pushed.
    Updated,
    /// Request soft-deleted.
    Deleted,
    /// No call was needed.
    Unchanged,
    /// A call failed.
    Failed,
}

/// Result of executing one rectification.
#[derive(Debug, Clone)]
pub struct RectificationOutcome {
    /// Deployment identity.
    pub id: DeploymentId,
    /// Kind of the diff that was rectified.
    pub kind: DiffKind,
    /// What happened.
    pub tag: OutcomeTag,
    /// The error, when `tag` is `Failed`.
    pub error: Option<Arc<ConvergeError>>,
    /// Deploy identifier pushed, for creations and updates.
    pub deploy_id: Option<String>,
    /// Free-form note, e.g. why nothing was done.
    pub detail: Option<String>,
}

/// Capabilities a rectification acts through.
#[derive(Clone)]
pub struct RectifyContext {
    /// Scheduler capability.
    pub deployer: Arc<dyn Deployer>,
    /// Artifact registry.
    pub registry: Arc<dyn Registry>,
    /// Diffs outside this scope are left alone.
    pub filter: ResolveFilter,
    /// Desired-state accessor, used to look up cluster definitions.
    pub state: Arc<dyn StateManager>,
}

/// One unit of convergence work for a single deployment.
#[derive(Debug)]
pub struct Rectification {
    diff: Diff,
    state: RectificationState,
    task: Option<JoinHandle<RectificationOutcome>>,
    outcome: Option<RectificationOutcome>,
}

impl RectificationOutcome {
    fn new(id: DeploymentId, kind: DiffKind, tag: OutcomeTag) -> Self {
        Self {
            id,
            kind,
            tag,
            error: None,
            deploy_id: None,
            detail: None,
        }
    }

    /// Builds a failed outcome.
    #[must_use]
    pub fn failed(id: DeploymentId, kind: DiffKind, error: ConvergeError) -> Self {
        Self {
            error: Some(Arc::new(error)),
            ..Self::new(id, kind, OutcomeTag::Failed)
        }
    }

    /// Returns true unless the rectification failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.tag != OutcomeTag::Failed
    }
}

impl Rectification {
    /// Creates a rectification in the `Created` state.
    #[must_use]
    pub const fn new(diff: Diff) -> Self {
        Self {
            diff,
            state: RectificationState::Created,
            task: None,
            outcome: None,
        }
    }

    /// The diff being rectified.
    #[must_use]
    pub const fn diff(&self) -> &Diff {
        &self.diff
    }

    /// The deployment being rectified.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.diff.id
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> RectificationState {
        self.state
    }

    /// Starts the scheduler call on a background task.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation unless the rectification is `Created`.
    pub fn begin(&mut self, ctx: RectifyContext) -> Result<()> {
        if self.state != RectificationState::Created {
            return Err(ConvergeError::invariant(format!(
                "rectification of {} begun in state {}",
                self.diff.id, self.state
            )));
        }

        let diff = self.diff.clone();
        self.task = Some(tokio::spawn(async move { execute(&diff, &ctx).await }));
        self.state = RectificationState::Started;
        Ok(())
    }

    /// Waits for the scheduler call to finish and returns its outcome.
    ///
    /// Waiting again after completion returns the same outcome.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if the rectification was never begun or
    /// was cancelled.
    pub async fn wait(&mut self) -> Result<RectificationOutcome> {
        if let Some(outcome) = &self.outcome {
            return Ok(outcome.clone());
        }

        let Some(task) = self.task.take() else {
            return Err(ConvergeError::invariant(format!(
                "waited on rectification of {} in state {}",
                self.diff.id, self.state
            )));
        };

        let outcome = task.await.unwrap_or_else(|e| {
            error!("Rectification task for {} did not finish: {e}", self.diff.id);
            RectificationOutcome::failed(
                self.diff.id.clone(),
                self.diff.kind(),
                RectifyError::Abandoned {
                    deployment: self.diff.id.to_string(),
                    reason: e.to_string(),
                }
                .into(),
            )
        });

        self.state = if outcome.is_success() {
            RectificationState::Succeeded
        } else {
            RectificationState::Failed
        };
        self.outcome = Some(outcome.clone());
        Ok(outcome)
    }

    /// Cancels a rectification that has not started.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if the rectification already started.
    pub fn cancel(&mut self) -> Result<()> {
        match self.state {
            RectificationState::Created | RectificationState::Cancelled => {
                self.state = RectificationState::Cancelled;
                Ok(())
            }
            other => Err(ConvergeError::invariant(format!(
                "cannot cancel rectification of {} in state {other}",
                self.diff.id
            ))),
        }
    }
}

/// Performs the one action implied by the diff.
async fn execute(diff: &Diff, ctx: &RectifyContext) -> RectificationOutcome {
    let id = diff.id.clone();
    let kind = diff.kind();

    if !ctx.filter.matches_deployment(diff.subject()) {
        debug!("Skipping {id}: outside scope {}", ctx.filter);
        return RectificationOutcome {
            detail: Some(format!("outside scope {}", ctx.filter)),
            ..RectificationOutcome::new(id, kind, OutcomeTag::Unchanged)
        };
    }

    if kind != DiffKind::Same {
        info!("Rectifying {diff}");
    }

    let result = match &diff.change {
        Change::Same { .. } => Ok(RectificationOutcome::new(
            id.clone(),
            kind,
            OutcomeTag::Unchanged,
        )),
        Change::Added { post } => create(&id, post, ctx).await,
        Change::Modified { post, .. } => update(&id, post, ctx).await,
        Change::Removed { prior } => delete(&id, prior, ctx).await,
    };

    result.unwrap_or_else(|e| {
        error!("Rectification of {id} failed: {e}");
        RectificationOutcome::failed(id, kind, e)
    })
}

async fn create(
    id: &DeploymentId,
    post: &Arc<Deployment>,
    ctx: &RectifyContext,
) -> Result<RectificationOutcome> {
    let deployable = prepare(id, post, ctx).await?;
    let request_id = id.request_id();

    ctx.deployer
        .post_request(
            &deployable.cluster,
            &request_id,
            post.num_instances,
            post.kind,
            &post.owners,
            &post.schedule,
        )
        .await?;
    ctx.deployer.deploy(&deployable, &request_id).await?;

    Ok(RectificationOutcome {
        deploy_id: Some(deployable.deploy_id()),
        ..RectificationOutcome::new(id.clone(), DiffKind::Added, OutcomeTag::Created)
    })
}

async fn update(
    id: &DeploymentId,
    post: &Arc<Deployment>,
    ctx: &RectifyContext,
) -> Result<RectificationOutcome> {
    let deployable = prepare(id, post, ctx).await?;
    ctx.deployer.deploy(&deployable, &id.request_id()).await?;

    Ok(RectificationOutcome {
        deploy_id: Some(deployable.deploy_id()),
        ..RectificationOutcome::new(id.clone(), DiffKind::Modified, OutcomeTag::Updated)
    })
}

async fn delete(
    id: &DeploymentId,
    prior: &Arc<Deployment>,
    ctx: &RectifyContext,
) -> Result<RectificationOutcome> {
    let state = ctx.state.read_state().await?;
    if state.deployments.get(id).is_some() {
        return Err(RectifyError::StaleDiff {
            deployment: id.to_string(),
        }
        .into());
    }

    let cluster = cluster_for(id, prior, &state.defs.clusters)?;
    ctx.deployer
        .delete_request(&cluster, &id.request_id(), REMOVAL_MESSAGE)
        .await?;

    Ok(RectificationOutcome::new(
        id.clone(),
        DiffKind::Removed,
        OutcomeTag::Deleted,
    ))
}

/// Looks up the cluster, checks the diff is still current and resolves the
/// artifact.
async fn prepare(
    id: &DeploymentId,
    post: &Arc<Deployment>,
    ctx: &RectifyContext,
) -> Result<Deployable> {
    let state = ctx.state.read_state().await?;
    let cluster = cluster_for(id, post, &state.defs.clusters)?;

    let current = state.deployments.get(id);
    if current.is_none_or(|desired| desired.as_ref() != post.as_ref()) {
        return Err(RectifyError::StaleDiff {
            deployment: id.to_string(),
        }
        .into());
    }

    let artifact = ctx.registry.resolve(&post.source_id).await?;
    debug!("Resolved {} to {}", post.source_id, artifact.reference());
    Ok(Deployable::new(Arc::clone(post), cluster, artifact))
}

fn cluster_for(
    id: &DeploymentId,
    deployment: &Deployment,
    clusters: &std::collections::BTreeMap<String, Cluster>,
) -> Result<Cluster> {
    clusters
        .get(&deployment.cluster_name)
        .cloned()
        .ok_or_else(|| {
            ValidationError::UnknownCluster {
                deployment: id.to_string(),
                cluster: deployment.cluster_name.clone(),
            }
            .into()
        })
}

impl fmt::Display for RectificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for OutcomeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for RectificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.tag)?;
        if let Some(error) = &self.error {
            write!(f, " ({error})")?;
        } else if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

impl fmt::Debug for RectifyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RectifyContext")
            .field("deployer", &self.deployer.backend_type())
            .field("filter", &self.filter)
            .field("state", &self.state.backend_type())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Defs, Deployments, SourceId, SourceLocation, State};
    use crate::planner::DiffEngine;
    use crate::scheduler::{
        BuildArtifact, InMemoryRegistry, MockRegistry, RecordingDeployer, SchedulerCall,
    };
    use crate::state::{MemoryStateManager, User};
    use semver::Version;

    fn deployment(repo: &str, instances: u32) -> Deployment {
        let source = SourceId::new(SourceLocation::new(repo, ""), Version::new(1, 0, 0));
        Deployment::new("east", source, "", instances)
    }

    fn set(deps: Vec<Deployment>) -> Deployments {
        Deployments::try_from_iter(deps).expect("unique ids")
    }

    async fn context(desired: Deployments) -> (RectifyContext, Arc<RecordingDeployer>) {
        let mut defs = Defs::default();
        defs.add_cluster(Cluster::new("east", "http://east.example"));
        let store = Arc::new(MemoryStateManager::new());
        store
            .write_state(&State::new(defs, desired), &User::new("test"))
            .await
            .expect("seed state");

        let deployer = Arc::new(RecordingDeployer::new());
        let ctx = RectifyContext {
            deployer: deployer.clone(),
            registry: Arc::new(InMemoryRegistry::permissive()),
            filter: ResolveFilter::all(),
            state: store,
        };
        (ctx, deployer)
    }

    fn single_diff(current: &Deployments, next: &Deployments) -> Diff {
        let result = DiffEngine::new().diff(current, next);
        assert_eq!(result.diffs.len(), 1);
        result.diffs[0].clone()
    }

    #[tokio::test]
    async fn test_added_posts_request_then_deploys() {
        let desired = set(vec![deployment("github.com/acme/web", 3)]);
        let (ctx, deployer) = context(desired.clone()).await;

        let mut rect = Rectification::new(single_diff(&Deployments::new(), &desired));
        rect.begin(ctx).expect("begin");
        assert_eq!(rect.state(), RectificationState::Started);

        let outcome = rect.wait().await.expect("wait");
        assert_eq!(outcome.tag, OutcomeTag::Created);
        assert!(outcome.deploy_id.is_some());
        assert_eq!(rect.state(), RectificationState::Succeeded);

        let calls = deployer.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0], SchedulerCall::Created { count: 3, .. }));
        assert!(matches!(calls[1], SchedulerCall::Deployed { count: 3, .. }));
    }

    #[tokio::test]
    async fn test_modified_deploys_once() {
        let desired = set(vec![deployment("github.com/acme/web", 5)]);
        let (ctx, deployer) = context(desired.clone()).await;
        let observed = set(vec![deployment("github.com/acme/web", 3)]);

        let mut rect = Rectification::new(single_diff(&observed, &desired));
        rect.begin(ctx).expect("begin");
        let outcome = rect.wait().await.expect("wait");

        assert_eq!(outcome.tag, OutcomeTag::Updated);
        let calls = deployer.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], SchedulerCall::Deployed { count: 5, .. }));
    }

    #[tokio::test]
    async fn test_removed_deletes_request() {
        let (ctx, deployer) = context(Deployments::new()).await;
        let observed = set(vec![deployment("github.com/acme/web", 3)]);

        let mut rect = Rectification::new(single_diff(&observed, &Deployments::new()));
        rect.begin(ctx).expect("begin");
        let outcome = rect.wait().await.expect("wait");

        assert_eq!(outcome.tag, OutcomeTag::Deleted);
        assert!(matches!(
            deployer.calls().as_slice(),
            [SchedulerCall::Deleted { message, .. }] if message == REMOVAL_MESSAGE
        ));
    }

    #[tokio::test]
    async fn test_same_makes_no_calls() {
        let desired = set(vec![deployment("github.com/acme/web", 3)]);
        let (ctx, deployer) = context(desired.clone()).await;

        let mut rect = Rectification::new(single_diff(&desired, &desired));
        rect.begin(ctx).expect("begin");
        assert_eq!(rect.wait().await.expect("wait").tag, OutcomeTag::Unchanged);
        assert!(deployer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_scope_is_left_alone() {
        let desired = set(vec![deployment("github.com/acme/web", 3)]);
        let (mut ctx, deployer) = context(desired.clone()).await;
        ctx.filter = ResolveFilter::all().with_cluster("west");

        let mut rect = Rectification::new(single_diff(&Deployments::new(), &desired));
        rect.begin(ctx).expect("begin");
        let outcome = rect.wait().await.expect("wait");
        assert_eq!(outcome.tag, OutcomeTag::Unchanged);
        assert!(outcome.detail.is_some());
        assert!(deployer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_scheduler_failure_is_reported_not_retried() {
        let desired = set(vec![deployment("github.com/acme/web", 3)]);
        let (ctx, deployer) = context(desired.clone()).await;
        deployer.fail_for(&deployment("github.com/acme/web", 3).id());

        let mut rect = Rectification::new(single_diff(&Deployments::new(), &desired));
        rect.begin(ctx).expect("begin");
        let outcome = rect.wait().await.expect("wait");

        assert_eq!(outcome.tag, OutcomeTag::Failed);
        assert!(outcome.error.is_some());
        assert_eq!(rect.state(), RectificationState::Failed);
        assert!(deployer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stale_diff_fails_without_calls() {
        let (ctx, deployer) = context(set(vec![deployment("github.com/acme/web", 7)])).await;
        let stale = set(vec![deployment("github.com/acme/web", 3)]);

        let mut rect = Rectification::new(single_diff(&Deployments::new(), &stale));
        rect.begin(ctx).expect("begin");
        let outcome = rect.wait().await.expect("wait");

        assert_eq!(outcome.tag, OutcomeTag::Failed);
        let error = outcome.error.expect("error");
        assert!(matches!(
            error.as_ref(),
            ConvergeError::Rectify(RectifyError::StaleDiff { .. })
        ));
        assert!(deployer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_removal_of_readded_deployment_is_stale() {
        let desired = set(vec![deployment("github.com/acme/web", 3)]);
        let (ctx, deployer) = context(desired.clone()).await;

        let mut rect = Rectification::new(single_diff(&desired, &Deployments::new()));
        rect.begin(ctx).expect("begin");
        let outcome = rect.wait().await.expect("wait");

        assert_eq!(outcome.tag, OutcomeTag::Failed);
        let error = outcome.error.expect("error");
        assert!(matches!(
            error.as_ref(),
            ConvergeError::Rectify(RectifyError::StaleDiff { .. })
        ));
        assert!(deployer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_registry_is_consulted_for_deploys() {
        let desired = set(vec![deployment("github.com/acme/web", 1)]);
        let (mut ctx, deployer) = context(desired.clone()).await;

        let mut registry = MockRegistry::new();
        registry.expect_resolve().times(1).returning(|source| {
            Ok(BuildArtifact {
                name: format!("registry.example/acme/web:{}", source.version),
                digest: Some(String::from("sha256:0ff1ce")),
            })
        });
        ctx.registry = Arc::new(registry);

        let mut rect = Rectification::new(single_diff(&Deployments::new(), &desired));
        rect.begin(ctx).expect("begin");
        assert_eq!(rect.wait().await.expect("wait").tag, OutcomeTag::Created);
        assert_eq!(deployer.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_state_transitions_are_enforced() {
        let desired = set(vec![deployment("github.com/acme/web", 1)]);
        let (ctx, _) = context(desired.clone()).await;
        let diff = single_diff(&Deployments::new(), &desired);

        let mut never_started = Rectification::new(diff.clone());
        assert!(never_started.wait().await.is_err());

        let mut cancelled = Rectification::new(diff.clone());
        cancelled.cancel().expect("cancel");
        assert_eq!(cancelled.state(), RectificationState::Cancelled);
        assert!(cancelled.begin(ctx.clone()).is_err());

        let mut started = Rectification::new(diff);
        started.begin(ctx.clone()).expect("begin");
        assert!(started.cancel().is_err());
        assert!(started.begin(ctx).is_err());
        let first = started.wait().await.expect("wait");
        let second = started.wait().await.expect("wait again");
        assert_eq!(first.tag, second.tag);
    }
}
