//! Diff engine for comparing two deployment sets.
//!
//! The same classification drives both reconciliation (desired vs observed)
//! and persistence (stored vs newly written desired state).

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::model::{Deployment, DeploymentId, Deployments};

/// Engine for computing diffs between deployment sets.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiffEngine;

/// Kind of difference detected for one ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffKind {
    /// Present only in the next set.
    Added,
    /// Present in both with different configuration.
    Modified,
    /// Present only in the current set.
    Removed,
    /// Present in both and equal.
    Same,
}

/// The deployments a diff refers to. Each variant carries exactly the sides
/// that exist.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Deployment to create.
    Added {
        /// Desired configuration.
        post: Arc<Deployment>,
    },
    /// Deployment to update.
    Modified {
        /// Configuration being replaced.
        prior: Arc<Deployment>,
        /// Desired configuration.
        post: Arc<Deployment>,
    },
    /// Deployment to remove.
    Removed {
        /// Configuration being removed.
        prior: Arc<Deployment>,
    },
    /// Nothing to do.
    Same {
        /// Current configuration.
        prior: Arc<Deployment>,
        /// Next configuration, equal to `prior`.
        post: Arc<Deployment>,
    },
}

/// Classified difference for a single deployment ID.
#[derive(Debug, Clone, PartialEq)]
pub struct Diff {
    /// Deployment identity.
    pub id: DeploymentId,
    /// The classified change.
    pub change: Change,
}

/// Complete diff result.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    /// One diff per ID in the union of both sets, in ID order.
    pub diffs: Vec<Diff>,
    /// Number of added deployments.
    pub added: usize,
    /// Number of modified deployments.
    pub modified: usize,
    /// Number of removed deployments.
    pub removed: usize,
    /// Number of unchanged deployments.
    pub same: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Classifies every ID in `current ∪ next`.
    ///
    /// The result is independent of insertion order and has no side effects.
    #[must_use]
    pub fn diff(&self, current: &Deployments, next: &Deployments) -> DiffResult {
        let ids: BTreeSet<&DeploymentId> = current.ids().chain(next.ids()).collect();
        let mut result = DiffResult::default();

        for id in ids {
            let change = match (current.get(id), next.get(id)) {
                (None, Some(post)) => {
                    debug!("Deployment {id} added");
                    result.added += 1;
                    Change::Added {
                        post: Arc::clone(post),
                    }
                }
                (Some(prior), None) => {
                    debug!("Deployment {id} removed");
                    result.removed += 1;
                    Change::Removed {
                        prior: Arc::clone(prior),
                    }
                }
                (Some(prior), Some(post)) if prior == post => {
                    result.same += 1;
                    Change::Same {
                        prior: Arc::clone(prior),
                        post: Arc::clone(post),
                    }
                }
                (Some(prior), Some(post)) => {
                    debug!(
                        "Deployment {id} modified ({})",
                        prior.differences(post).join(", ")
                    );
                    result.modified += 1;
                    Change::Modified {
                        prior: Arc::clone(prior),
                        post: Arc::clone(post),
                    }
                }
                (None, None) => continue,
            };
            result.diffs.push(Diff {
                id: id.clone(),
                change,
            });
        }

        result
    }
}

impl Diff {
    /// Returns the kind of this diff.
    #[must_use]
    pub const fn kind(&self) -> DiffKind {
        match self.change {
            Change::Added { .. } => DiffKind::Added,
            Change::Modified { .. } => DiffKind::Modified,
            Change::Removed { .. } => DiffKind::Removed,
            Change::Same { .. } => DiffKind::Same,
        }
    }

    /// The configuration before the change, if any.
    #[must_use]
    pub const fn prior(&self) -> Option<&Arc<Deployment>> {
        match &self.change {
            Change::Modified { prior, .. }
            | Change::Removed { prior }
            | Change::Same { prior, .. } => Some(prior),
            Change::Added { .. } => None,
        }
    }

    /// The configuration after the change, if any.
    #[must_use]
    pub const fn post(&self) -> Option<&Arc<Deployment>> {
        match &self.change {
            Change::Added { post } | Change::Modified { post, .. } | Change::Same { post, .. } => {
                Some(post)
            }
            Change::Removed { .. } => None,
        }
    }

    /// The deployment a scope filter should judge: the prior one for removals,
    /// otherwise the post one.
    #[must_use]
    pub const fn subject(&self) -> &Arc<Deployment> {
        match &self.change {
            Change::Removed { prior } => prior,
            Change::Added { post } | Change::Modified { post, .. } | Change::Same { post, .. } => {
                post
            }
        }
    }

    /// Fields that differ, for modifications.
    #[must_use]
    pub fn changed_fields(&self) -> Vec<&'static str> {
        match &self.change {
            Change::Modified { prior, post } => prior.differences(post),
            _ => Vec::new(),
        }
    }
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.added > 0 || self.modified > 0 || self.removed > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.added + self.modified + self.removed
    }

    /// Keeps only the diffs for which `keep` returns true, recounting kinds.
    pub fn retain(&mut self, mut keep: impl FnMut(&Diff) -> bool) {
        self.diffs.retain(|d| keep(d));
        let (mut added, mut modified, mut removed, mut same) = (0, 0, 0, 0);
        for d in &self.diffs {
            match d.kind() {
                DiffKind::Added => added += 1,
                DiffKind::Modified => modified += 1,
                DiffKind::Removed => removed += 1,
                DiffKind::Same => same += 1,
            }
        }
        self.added = added;
        self.modified = modified;
        self.removed = removed;
        self.same = same;
    }

    /// Filters to only diffs that require action.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&Diff> {
        self.diffs
            .iter()
            .filter(|d| d.kind() != DiffKind::Same)
            .collect()
    }
}

impl fmt::Display for DiffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Removed => "removed",
            Self::Same => "same",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.kind())?;
        let fields = self.changed_fields();
        if !fields.is_empty() {
            write!(f, " ({})", fields.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SourceId, SourceLocation};
    use semver::Version;
    use std::collections::HashMap;

    fn dep(cluster: &str, repo: &str, instances: u32) -> Deployment {
        let source = SourceId::new(SourceLocation::new(repo, ""), Version::new(1, 0, 0));
        Deployment::new(cluster, source, "", instances)
    }

    fn set(deps: Vec<Deployment>) -> Deployments {
        Deployments::try_from_iter(deps).expect("unique ids")
    }

    fn kinds(result: &DiffResult) -> HashMap<DeploymentId, DiffKind> {
        result.diffs.iter().map(|d| (d.id.clone(), d.kind())).collect()
    }

    #[test]
    fn test_every_id_classified_once() {
        let current = set(vec![dep("east", "a", 1), dep("east", "b", 1), dep("east", "c", 1)]);
        let next = set(vec![dep("east", "b", 1), dep("east", "c", 5), dep("east", "d", 1)]);

        let result = DiffEngine::new().diff(&current, &next);
        assert_eq!(result.diffs.len(), 4);
        assert_eq!((result.added, result.modified, result.removed, result.same), (1, 1, 1, 1));

        let kinds = kinds(&result);
        assert_eq!(kinds[&dep("east", "a", 1).id()], DiffKind::Removed);
        assert_eq!(kinds[&dep("east", "b", 1).id()], DiffKind::Same);
        assert_eq!(kinds[&dep("east", "c", 1).id()], DiffKind::Modified);
        assert_eq!(kinds[&dep("east", "d", 1).id()], DiffKind::Added);
        assert_eq!(result.actionable_diffs().len(), 3);
    }

    #[test]
    fn test_retain_recounts() {
        let current = set(vec![dep("east", "a", 1), dep("west", "b", 1)]);
        let next = set(vec![dep("west", "b", 2), dep("east", "c", 1)]);

        let mut result = DiffEngine::new().diff(&current, &next);
        result.retain(|d| d.subject().cluster_name == "east");
        assert_eq!(result.diffs.len(), 2);
        assert_eq!((result.added, result.modified, result.removed, result.same), (1, 0, 1, 0));
    }

    #[test]
    fn test_swapping_inputs_mirrors_added_and_removed() {
        let a = set(vec![dep("east", "a", 1), dep("east", "b", 1), dep("west", "c", 1)]);
        let b = set(vec![dep("east", "b", 2), dep("west", "c", 1), dep("west", "d", 1)]);

        let forward = kinds(&DiffEngine::new().diff(&a, &b));
        let backward = kinds(&DiffEngine::new().diff(&b, &a));

        assert_eq!(forward.len(), backward.len());
        for (id, kind) in &forward {
            let mirrored = match kind {
                DiffKind::Added => DiffKind::Removed,
                DiffKind::Removed => DiffKind::Added,
                other => *other,
            };
            assert_eq!(backward[id], mirrored, "{id}");
        }
    }

    #[test]
    fn test_diff_against_itself_is_all_same() {
        let deployments = set(vec![dep("east", "a", 1), dep("west", "a", 3)]);
        let result = DiffEngine::new().diff(&deployments, &deployments.snapshot());
        assert!(!result.has_changes());
        assert!(result.diffs.iter().all(|d| d.kind() == DiffKind::Same));
    }

    #[test]
    fn test_formatting_only_resource_change_is_same() {
        let mut before = dep("east", "a", 1);
        before.resources.insert("cpus", "1");
        let mut after = dep("east", "a", 1);
        after.resources.insert("cpus", "1.0");

        let result = DiffEngine::new().diff(&set(vec![before]), &set(vec![after]));
        assert_eq!(result.same, 1);
    }

    #[test]
    fn test_sides_and_display() {
        let result = DiffEngine::new().diff(
            &set(vec![dep("east", "a", 1)]),
            &set(vec![dep("east", "a", 2)]),
        );
        let diff = &result.diffs[0];
        assert_eq!(diff.prior().map(|d| d.num_instances), Some(1));
        assert_eq!(diff.post().map(|d| d.num_instances), Some(2));
        assert_eq!(diff.subject().num_instances, 2);
        assert_eq!(diff.to_string(), "east:a: modified (num_instances)");

        let removed = DiffEngine::new().diff(&set(vec![dep("east", "a", 1)]), &Deployments::new());
        assert!(removed.diffs[0].post().is_none());
        assert_eq!(removed.diffs[0].subject().num_instances, 1);
    }
}
