//! Validation of service configuration and desired state.
//!
//! Validation collects every problem instead of stopping at the first, so the
//! `validate` command can report a whole manifest at once.

use crate::error::{ConfigError, Result, ValidationError};
use std::fmt;
use tracing::debug;

use crate::model::{Flaw, ManifestKind, State};

use super::spec::ServiceConfig;

/// Validator for service configuration and desired state.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all problems found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Problems that block use.
    pub errors: Vec<Issue>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

/// A single validation problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates the service configuration.
    #[must_use]
    pub fn validate_config(&self, config: &ServiceConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        let url = &config.storage.url;
        if url.is_empty() {
            result.error("storage.url", "Storage URL cannot be empty");
        } else if !config.storage.is_memory() && !url.starts_with("sqlite:") {
            result.error(
                "storage.url",
                format!("Unsupported storage URL '{url}'. Expected sqlite:... or memory"),
            );
        }
        if config.storage.is_memory() {
            result
                .warnings
                .push(String::from("storage.url: in-memory storage is lost on exit"));
        }
        if config.storage.max_connections == Some(0) {
            result.error("storage.max_connections", "Must be at least 1");
        }

        if config.scheduler.timeout_secs == 0 {
            result.error("scheduler.timeout_secs", "Timeout must be at least 1 second");
        }

        if let Some(url) = &config.registry.url {
            if !is_http_url(url) {
                result.error(
                    "registry.url",
                    format!("Registry URL must start with http:// or https://: {url}"),
                );
            }
        }
        if config.registry.timeout_secs == 0 {
            result.error("registry.timeout_secs", "Timeout must be at least 1 second");
        }

        if config.reconcile.interval_secs == 0 {
            result.error("reconcile.interval_secs", "Interval must be at least 1 second");
        } else if config.reconcile.interval_secs < 5 {
            result.warnings.push(format!(
                "reconcile.interval_secs: {}s is aggressive for a remote scheduler",
                config.reconcile.interval_secs
            ));
        }
        if config.reconcile.history_size == 0 {
            result.error("reconcile.history_size", "Must keep at least 1 report");
        }

        debug!(
            "Configuration validation found {} errors, {} warnings",
            result.error_count(),
            result.warning_count()
        );
        result
    }

    /// Validates a desired state.
    ///
    /// Missing resources are warnings, since they are repaired on write.
    #[must_use]
    pub fn validate_state(&self, state: &State) -> ValidationResult {
        let mut result = ValidationResult::default();

        for (name, cluster) in &state.defs.clusters {
            if !is_http_url(&cluster.base_url) {
                result.error(
                    format!("clusters.{name}.base_url"),
                    format!(
                        "Scheduler URL must start with http:// or https://: {}",
                        cluster.base_url
                    ),
                );
            }
        }

        for (id, dep) in state.deployments.iter() {
            let prefix = id.to_string();

            if state.defs.cluster(&id.cluster).is_none() {
                result.error(
                    format!("{prefix}.cluster"),
                    format!("Cluster '{}' is not defined", id.cluster),
                );
            }

            if id.location.repo.is_empty() {
                result.error(format!("{prefix}.repo"), "Repository cannot be empty");
            }

            for flaw in dep.validate() {
                match flaw {
                    missing @ Flaw::MissingResource { .. } => {
                        result.warnings.push(format!("{missing} (repaired on write)"));
                    }
                    malformed @ Flaw::MalformedResource { .. } => {
                        result.error(format!("{prefix}.resources"), malformed.to_string());
                    }
                }
            }

            match dep.kind {
                ManifestKind::Scheduled if dep.schedule.trim().is_empty() => {
                    result.error(
                        format!("{prefix}.schedule"),
                        "Scheduled workloads need a schedule",
                    );
                }
                ManifestKind::Scheduled => {}
                _ if !dep.schedule.is_empty() => {
                    result.warnings.push(format!(
                        "{prefix}.schedule: ignored for {} workloads",
                        dep.kind
                    ));
                }
                _ => {}
            }

            if dep.num_instances == 0 && dep.kind == ManifestKind::HttpService {
                result.warnings.push(format!(
                    "{prefix}.num_instances: service will have no running instances"
                ));
            }

            if !dep.kind.is_instanced() && dep.num_instances != 1 {
                result.warnings.push(format!(
                    "{prefix}.num_instances: ignored for {} workloads",
                    dep.kind
                ));
            }

            for key in dep.metadata.keys().filter(|k| k.starts_with(RESERVED_PREFIX)) {
                result.error(
                    format!("{prefix}.metadata.{key}"),
                    format!("Metadata keys starting with '{RESERVED_PREFIX}' are reserved"),
                );
            }

            if dep.owners.is_empty() {
                result.warnings.push(format!("{prefix}.owners: no owners listed"));
            }
        }

        result
    }
}

/// Metadata prefix the scheduler client uses for its own bookkeeping.
const RESERVED_PREFIX: &str = "converge.";

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(Issue {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    /// Converts the first error of a configuration check into an error.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if any problem was found.
    pub fn into_config_result(self) -> Result<Self> {
        match self.errors.first() {
            None => Ok(self),
            Some(issue) => Err(ConfigError::invalid(&issue.field, &issue.message).into()),
        }
    }

    /// Converts the first error of a state check into an error.
    ///
    /// # Errors
    ///
    /// Returns a validation error if any problem was found.
    pub fn into_state_result(self) -> Result<Self> {
        match self.errors.first() {
            None => Ok(self),
            Some(issue) => Err(ValidationError::field(&issue.field, &issue.message).into()),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Cluster, Defs, Deployment, Deployments, Resources, SourceId, SourceLocation,
    };
    use semver::Version;

    fn state(deps: Vec<Deployment>) -> State {
        let mut defs = Defs::default();
        defs.add_cluster(Cluster::new("east", "http://east.example"));
        State::new(defs, Deployments::try_from_iter(deps).unwrap())
    }

    fn dep(cluster: &str) -> Deployment {
        let source = SourceId::new(
            SourceLocation::new("github.com/acme/web", ""),
            Version::new(1, 0, 0),
        );
        let mut dep = Deployment::new(cluster, source, "", 1);
        dep.owners.insert(String::from("web@acme.example"));
        dep
    }

    #[test]
    fn test_default_config_is_valid() {
        let result = ConfigValidator::new().validate_config(&ServiceConfig::default());
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_bad_config_collects_every_error() {
        let mut config = ServiceConfig::default();
        config.storage.url = String::from("postgres://db");
        config.registry.url = Some(String::from("registry.acme.example"));
        config.reconcile.interval_secs = 0;

        let result = ConfigValidator::new().validate_config(&config);
        assert_eq!(result.error_count(), 3);
        let err = result.into_config_result().unwrap_err();
        assert!(err.to_string().contains("storage.url"));
    }

    #[test]
    fn test_clean_state_is_valid() {
        let result = ConfigValidator::new().validate_state(&state(vec![dep("east")]));
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_state_problems() {
        let mut scheduled = dep("east");
        scheduled.kind = ManifestKind::Scheduled;
        scheduled.flavor = String::from("nightly");
        scheduled.resources = Resources::new().with("cpus", "1").with("memory", "lots");

        let result = ConfigValidator::new().validate_state(&state(vec![dep("west"), scheduled]));
        let fields: Vec<&str> = result.errors.iter().map(|i| i.field.as_str()).collect();
        assert_eq!(result.error_count(), 3, "{fields:?}");
        assert!(fields.iter().any(|f| f.ends_with(".cluster")));
        assert!(fields.iter().any(|f| f.ends_with(".resources")));
        assert!(fields.iter().any(|f| f.ends_with(".schedule")));
        assert!(result.warnings.iter().any(|w| w.contains("repaired on write")));
        assert!(result.into_state_result().is_err());
    }

    #[test]
    fn test_reserved_metadata_and_ignored_instances() {
        let mut job = dep("east");
        job.kind = ManifestKind::Once;
        job.num_instances = 4;
        job.metadata.insert(String::from("converge.revision"), String::from("x"));

        let result = ConfigValidator::new().validate_state(&state(vec![job]));
        assert_eq!(result.error_count(), 1);
        assert!(result.errors[0].field.ends_with(".metadata.converge.revision"));
        assert!(result.warnings.iter().any(|w| w.contains("num_instances: ignored")));
    }
}
