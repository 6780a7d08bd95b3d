//! A keyed set of deployments with cheap snapshots.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::deployment::Deployment;
use super::id::DeploymentId;
use crate::error::{ConvergeError, Result};

/// At most one [`Deployment`] per [`DeploymentId`].
///
/// Cloning a `Deployments` is a snapshot: the clone shares storage with the
/// original until either side is mutated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deployments {
    inner: Arc<BTreeMap<DeploymentId, Arc<Deployment>>>,
}

impl Deployments {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a deployment.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if a deployment with the same ID is
    /// already present.
    pub fn add(&mut self, deployment: Deployment) -> Result<()> {
        let id = deployment.id();
        if self.inner.contains_key(&id) {
            return Err(ConvergeError::invariant(format!(
                "deployment {id} added twice"
            )));
        }
        Arc::make_mut(&mut self.inner).insert(id, Arc::new(deployment));
        Ok(())
    }

    /// Inserts or replaces a deployment, returning the previous one.
    pub fn upsert(&mut self, deployment: Deployment) -> Option<Arc<Deployment>> {
        Arc::make_mut(&mut self.inner).insert(deployment.id(), Arc::new(deployment))
    }

    /// Removes a deployment by ID.
    pub fn remove(&mut self, id: &DeploymentId) -> Option<Arc<Deployment>> {
        if !self.inner.contains_key(id) {
            return None;
        }
        Arc::make_mut(&mut self.inner).remove(id)
    }

    /// Looks up a deployment by ID.
    #[must_use]
    pub fn get(&self, id: &DeploymentId) -> Option<&Arc<Deployment>> {
        self.inner.get(id)
    }

    /// Returns true if the ID is present.
    #[must_use]
    pub fn contains(&self, id: &DeploymentId) -> bool {
        self.inner.contains_key(id)
    }

    /// Number of deployments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if there are no deployments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates in ID order.
    pub fn iter(&self) -> impl Iterator<Item = (&DeploymentId, &Arc<Deployment>)> {
        self.inner.iter()
    }

    /// Iterates over IDs in order.
    pub fn ids(&self) -> impl Iterator<Item = &DeploymentId> {
        self.inner.keys()
    }

    /// Returns an immutable point-in-time view.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    /// Keeps only the deployments matching the predicate.
    #[must_use]
    pub fn filtered(&self, mut keep: impl FnMut(&Deployment) -> bool) -> Self {
        let inner = self
            .inner
            .iter()
            .filter(|(_, dep)| keep(dep))
            .map(|(id, dep)| (id.clone(), Arc::clone(dep)))
            .collect();
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Builds a set from deployments, rejecting duplicate IDs.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation on the first duplicate ID.
    pub fn try_from_iter(deployments: impl IntoIterator<Item = Deployment>) -> Result<Self> {
        let mut set = Self::new();
        for deployment in deployments {
            set.add(deployment)?;
        }
        Ok(set)
    }
}

impl Serialize for Deployments {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.inner.values().map(AsRef::as_ref))
    }
}

impl<'de> Deserialize<'de> for Deployments {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let list = Vec::<Deployment>::deserialize(deserializer)?;
        Self::try_from_iter(list).map_err(serde::de::Error::custom)
    }
}
