//! Desired state: cluster definitions plus deployments.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::deployments::Deployments;
use super::resources::Flaw;
use crate::error::{Result, ValidationError};

/// The scheduler implementation backing a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterKind {
    /// A Singularity-compatible scheduler.
    #[default]
    Singularity,
}

/// A cluster the engine deploys to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Unique cluster name.
    pub name: String,
    /// Scheduler implementation.
    #[serde(default)]
    pub kind: ClusterKind,
    /// Base URL of the cluster's scheduler API.
    pub base_url: String,
}

/// Global definitions shared by all deployments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defs {
    /// Clusters keyed by name.
    #[serde(default)]
    pub clusters: BTreeMap<String, Cluster>,
}

/// The complete desired state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Global definitions.
    #[serde(default)]
    pub defs: Defs,
    /// All deployments across all clusters.
    #[serde(default)]
    pub deployments: Deployments,
}

impl Cluster {
    /// Creates a Singularity cluster definition.
    #[must_use]
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ClusterKind::Singularity,
            base_url: base_url.into(),
        }
    }
}

impl Defs {
    /// Adds or replaces a cluster definition.
    pub fn add_cluster(&mut self, cluster: Cluster) {
        self.clusters.insert(cluster.name.clone(), cluster);
    }

    /// Looks up a cluster by name.
    #[must_use]
    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        self.clusters.get(name)
    }
}

impl State {
    /// Creates a state from its parts.
    #[must_use]
    pub const fn new(defs: Defs, deployments: Deployments) -> Self {
        Self { defs, deployments }
    }

    /// Collects resource flaws across all deployments.
    #[must_use]
    pub fn flaws(&self) -> Vec<Flaw> {
        self.deployments
            .iter()
            .flat_map(|(_, dep)| dep.validate())
            .collect()
    }

    /// Repairs every repairable flaw, returning the flaws that were fixed.
    pub fn repair(&mut self) -> Vec<Flaw> {
        let mut fixed = Vec::new();
        let snapshot = self.deployments.snapshot();

        for (_, dep) in snapshot.iter() {
            let flaws: Vec<Flaw> = dep
                .validate()
                .into_iter()
                .filter(Flaw::is_repairable)
                .collect();
            if flaws.is_empty() {
                continue;
            }

            let mut repaired = dep.as_ref().clone();
            for flaw in flaws {
                if flaw.repair(&mut repaired.resources).is_ok() {
                    fixed.push(flaw);
                }
            }
            self.deployments.upsert(repaired);
        }

        fixed
    }

    /// Checks that the state is safe to persist.
    ///
    /// # Errors
    ///
    /// Returns a validation error if a deployment references an undefined
    /// cluster or carries a resource flaw.
    pub fn validate(&self) -> Result<()> {
        for (id, dep) in self.deployments.iter() {
            if self.defs.cluster(&id.cluster).is_none() {
                return Err(ValidationError::UnknownCluster {
                    deployment: id.to_string(),
                    cluster: id.cluster.clone(),
                }
                .into());
            }
            if let Some(flaw) = dep.validate().into_iter().next() {
                return Err(match flaw {
                    Flaw::MalformedResource {
                        context,
                        field,
                        value,
                    } => ValidationError::MalformedResource {
                        field,
                        value,
                        context,
                    },
                    missing @ Flaw::MissingResource { .. } => {
                        ValidationError::field("resources", missing.to_string())
                    }
                }
                .into());
            }
        }
        Ok(())
    }
}

impl fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Singularity => write!(f, "singularity"),
        }
    }
}

impl std::str::FromStr for ClusterKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "singularity" => Ok(Self::Singularity),
            other => Err(format!("unknown cluster kind: {other}")),
        }
    }
}
