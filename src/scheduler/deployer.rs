//! Scheduler capability trait.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::model::{Cluster, Defs, Deployments, ManifestKind, OwnerSet};
use crate::rectify::Deployable;

/// Operations the engine needs from a cluster scheduler.
///
/// Implementations perform exactly the call asked of them. Retrying is left
/// to the next reconciliation cycle.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Reads what is currently running on every cluster in `defs`.
    async fn running_deployments(&self, defs: &Defs) -> Result<Deployments>;

    /// Pushes a concrete deploy for an existing request.
    async fn deploy(&self, deployable: &Deployable, request_id: &str) -> Result<()>;

    /// Registers the logical request a deployment runs under.
    ///
    /// `schedule` is the cron expression of scheduled workloads and empty for
    /// every other kind.
    async fn post_request(
        &self,
        cluster: &Cluster,
        request_id: &str,
        count: u32,
        kind: ManifestKind,
        owners: &OwnerSet,
        schedule: &str,
    ) -> Result<()>;

    /// Soft-deletes a request; the scheduler drains its tasks.
    async fn delete_request(&self, cluster: &Cluster, request_id: &str, message: &str)
    -> Result<()>;

    /// Name of the implementation, for logs.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl<T: Deployer + ?Sized> Deployer for Arc<T> {
    async fn running_deployments(&self, defs: &Defs) -> Result<Deployments> {
        (**self).running_deployments(defs).await
    }

    async fn deploy(&self, deployable: &Deployable, request_id: &str) -> Result<()> {
        (**self).deploy(deployable, request_id).await
    }

    async fn post_request(
        &self,
        cluster: &Cluster,
        request_id: &str,
        count: u32,
        kind: ManifestKind,
        owners: &OwnerSet,
        schedule: &str,
    ) -> Result<()> {
        (**self)
            .post_request(cluster, request_id, count, kind, owners, schedule)
            .await
    }

    async fn delete_request(
        &self,
        cluster: &Cluster,
        request_id: &str,
        message: &str,
    ) -> Result<()> {
        (**self).delete_request(cluster, request_id, message).await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
