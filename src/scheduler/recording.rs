//! Recording scheduler double.
//!
//! Keeps an in-process picture of what would be running and records every
//! call in order. Used by tests and by `--dry-run`.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::model::{Cluster, Defs, DeploymentId, Deployments, ManifestKind, OwnerSet};
use crate::rectify::Deployable;

use super::deployer::Deployer;

/// One recorded scheduler call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCall {
    /// A request was registered.
    Created {
        /// Cluster name.
        cluster: String,
        /// Request identifier.
        request_id: String,
        /// Instance count.
        count: u32,
        /// Workload kind.
        kind: ManifestKind,
    },
    /// A deploy was pushed.
    Deployed {
        /// Deployment identity.
        id: DeploymentId,
        /// Request identifier.
        request_id: String,
        /// Deploy identifier.
        deploy_id: String,
        /// Instance count.
        count: u32,
    },
    /// A request was deleted.
    Deleted {
        /// Cluster name.
        cluster: String,
        /// Request identifier.
        request_id: String,
        /// Reason given.
        message: String,
    },
}

#[derive(Debug, Default)]
struct Inner {
    calls: Vec<SchedulerCall>,
    observed: Deployments,
    requests: HashMap<(String, String), Option<DeploymentId>>,
    failing: HashSet<String>,
}

/// Scheduler double that records calls and simulates observed state.
#[derive(Debug, Default)]
pub struct RecordingDeployer {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
}

impl RecordingDeployer {
    /// Creates an empty recording deployer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call by `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Seeds the simulated running state.
    #[must_use]
    pub fn with_observed(self, observed: Deployments) -> Self {
        {
            let mut inner = self.lock();
            for (id, _) in observed.iter() {
                inner
                    .requests
                    .insert((id.cluster.clone(), id.request_id()), Some(id.clone()));
            }
            inner.observed = observed;
        }
        self
    }

    /// Makes every call for the given deployment fail.
    pub fn fail_for(&self, id: &DeploymentId) {
        self.lock().failing.insert(id.request_id());
    }

    /// Stops failing calls for the given deployment.
    pub fn recover(&self, id: &DeploymentId) {
        self.lock().failing.remove(&id.request_id());
    }

    /// Returns every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<SchedulerCall> {
        self.lock().calls.clone()
    }

    /// Clears the call log, keeping the simulated state.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Returns the simulated running state.
    #[must_use]
    pub fn observed(&self) -> Deployments {
        self.lock().observed.snapshot()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_failure(inner: &Inner, request_id: &str) -> Result<()> {
        if inner.failing.contains(request_id) {
            let message = format!("injected failure for {request_id}");
            return Err(SchedulerError::api_error(500, message).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Deployer for RecordingDeployer {
    async fn running_deployments(&self, defs: &Defs) -> Result<Deployments> {
        self.delay().await;
        let inner = self.lock();
        Ok(inner
            .observed
            .filtered(|dep| defs.clusters.contains_key(&dep.cluster_name)))
    }

    async fn deploy(&self, deployable: &Deployable, request_id: &str) -> Result<()> {
        self.delay().await;
        let mut inner = self.lock();
        Self::check_failure(&inner, request_id)?;

        let id = deployable.deployment.id();
        debug!("Recording deploy of {id} under {request_id}");
        inner.calls.push(SchedulerCall::Deployed {
            id: id.clone(),
            request_id: request_id.to_string(),
            deploy_id: deployable.deploy_id(),
            count: deployable.deployment.num_instances,
        });
        inner
            .requests
            .insert((deployable.cluster.name.clone(), request_id.to_string()), Some(id));
        inner.observed.upsert(deployable.deployment.as_ref().clone());
        Ok(())
    }

    async fn post_request(
        &self,
        cluster: &Cluster,
        request_id: &str,
        count: u32,
        kind: ManifestKind,
        _owners: &OwnerSet,
        _schedule: &str,
    ) -> Result<()> {
        self.delay().await;
        let mut inner = self.lock();
        Self::check_failure(&inner, request_id)?;

        debug!("Recording request {request_id} on {}", cluster.name);
        inner.calls.push(SchedulerCall::Created {
            cluster: cluster.name.clone(),
            request_id: request_id.to_string(),
            count,
            kind,
        });
        inner
            .requests
            .entry((cluster.name.clone(), request_id.to_string()))
            .or_insert(None);
        Ok(())
    }

    async fn delete_request(
        &self,
        cluster: &Cluster,
        request_id: &str,
        message: &str,
    ) -> Result<()> {
        self.delay().await;
        let mut inner = self.lock();
        Self::check_failure(&inner, request_id)?;

        debug!("Recording deletion of {request_id} on {}", cluster.name);
        inner.calls.push(SchedulerCall::Deleted {
            cluster: cluster.name.clone(),
            request_id: request_id.to_string(),
            message: message.to_string(),
        });
        let key = (cluster.name.clone(), request_id.to_string());
        if let Some(Some(id)) = inner.requests.remove(&key) {
            inner.observed.remove(&id);
        }
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Deployment, SourceId, SourceLocation};
    use crate::scheduler::BuildArtifact;
    use semver::Version;
    use std::sync::Arc;

    fn deployable() -> Deployable {
        let source = SourceId::new(
            SourceLocation::new("github.com/acme/web", ""),
            Version::new(1, 0, 0),
        );
        Deployable::new(
            Arc::new(Deployment::new("east", source, "", 2)),
            Cluster::new("east", "http://east.example"),
            BuildArtifact {
                name: String::from("acme/web:1.0.0"),
                digest: None,
            },
        )
    }

    fn defs() -> Defs {
        let mut defs = Defs::default();
        defs.add_cluster(Cluster::new("east", "http://east.example"));
        defs
    }

    #[tokio::test]
    async fn test_records_calls_and_simulates_state() {
        let deployer = RecordingDeployer::new();
        let deployable = deployable();
        let id = deployable.deployment.id();
        let request_id = id.request_id();

        deployer
            .post_request(
                &deployable.cluster,
                &request_id,
                2,
                ManifestKind::HttpService,
                &OwnerSet::new(),
                "",
            )
            .await
            .expect("post");
        deployer.deploy(&deployable, &request_id).await.expect("deploy");
        assert!(deployer.running_deployments(&defs()).await.expect("read").contains(&id));

        deployer
            .delete_request(&deployable.cluster, &request_id, "gone")
            .await
            .expect("delete");
        assert!(deployer.observed().is_empty());

        let calls = deployer.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(calls[0], SchedulerCall::Created { count: 2, .. }));
        assert!(matches!(calls[1], SchedulerCall::Deployed { .. }));
        assert!(matches!(calls[2], SchedulerCall::Deleted { .. }));
    }

    #[tokio::test]
    async fn test_injected_failure_records_nothing() {
        let deployer = RecordingDeployer::new();
        let deployable = deployable();
        let id = deployable.deployment.id();
        deployer.fail_for(&id);

        assert!(deployer.deploy(&deployable, &id.request_id()).await.is_err());
        assert!(deployer.calls().is_empty());

        deployer.recover(&id);
        deployer.deploy(&deployable, &id.request_id()).await.expect("recovered");
        assert_eq!(deployer.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_seeded_state_is_filtered_by_defs() {
        let deployable = deployable();
        let mut seeded = Deployments::new();
        seeded.upsert(deployable.deployment.as_ref().clone());
        let deployer = RecordingDeployer::new().with_observed(seeded);

        assert_eq!(deployer.running_deployments(&defs()).await.expect("read").len(), 1);
        assert!(deployer.running_deployments(&Defs::default()).await.expect("read").is_empty());
    }
}
