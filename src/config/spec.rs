//! Service configuration types.
//!
//! This module defines the structs that map to the `converge.yaml` file.
//! Every section is optional; a missing file section takes its defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::model::ResolveFilter;
use crate::state::User;

/// Storage URL selecting the in-process store.
pub const MEMORY_STORAGE: &str = "memory";

/// The root configuration structure for the converge service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Desired-state storage.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Scheduler client settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Artifact registry settings.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Reconciliation loop settings.
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Default scope for reconciliation.
    #[serde(default)]
    pub scope: ResolveFilter,
    /// Identity recorded on state writes. Defaults to `$USER@<hostname>`.
    #[serde(default)]
    pub user: Option<User>,
}

/// Desired-state storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// `SQLite` URL, or `memory` for a non-persistent store.
    #[serde(default = "default_storage_url")]
    pub url: String,
    /// Maximum pooled connections.
    #[serde(default)]
    pub max_connections: Option<u32>,
}

/// Scheduler client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Per-request timeout in seconds.
    #[serde(default = "default_scheduler_timeout")]
    pub timeout_secs: u64,
}

/// Artifact registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Docker registry base URL. Without one, artifact names are derived from
    /// the source location and never pinned.
    #[serde(default)]
    pub url: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,
}

/// Reconciliation loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Minimum seconds between cycle starts.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Number of cycle reports kept in memory.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

fn default_storage_url() -> String {
    String::from("sqlite://converge.db")
}

const fn default_scheduler_timeout() -> u64 {
    30
}

const fn default_registry_timeout() -> u64 {
    10
}

const fn default_interval() -> u64 {
    60
}

const fn default_history_size() -> usize {
    crate::reconciler::DEFAULT_HISTORY_SIZE
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: default_storage_url(),
            max_connections: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_scheduler_timeout(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_registry_timeout(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            history_size: default_history_size(),
        }
    }
}

impl StorageConfig {
    /// Returns true if the in-process store is selected.
    #[must_use]
    pub fn is_memory(&self) -> bool {
        self.url == MEMORY_STORAGE
    }
}

impl ReconcileConfig {
    /// The cycle interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl ServiceConfig {
    /// The identity recorded on state writes.
    #[must_use]
    pub fn user(&self) -> User {
        self.user.clone().unwrap_or_else(User::current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_takes_defaults() {
        let config: ServiceConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.storage.url, "sqlite://converge.db");
        assert_eq!(config.reconcile.interval(), Duration::from_secs(60));
        assert!(config.scope.is_all());
    }

    #[test]
    fn test_partial_sections_keep_field_defaults() {
        let yaml = r"
storage:
  url: memory
reconcile:
  interval_secs: 5
scope:
  cluster: east
user:
  name: ops
";
        let config: ServiceConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.storage.is_memory());
        assert_eq!(config.reconcile.interval_secs, 5);
        assert_eq!(config.reconcile.history_size, 20);
        assert_eq!(config.scope.cluster.as_deref(), Some("east"));
        assert_eq!(config.user().name, "ops");
    }
}
