//! The configuration of one deployable unit on one cluster.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::id::{DeploymentId, SourceId, SourceLocation};
use super::resources::{Flaw, Resources};

/// Environment variables, ordered by name.
pub type Env = BTreeMap<String, String>;

/// Free-form metadata, ordered by key.
pub type Metadata = BTreeMap<String, String>;

/// Email addresses of the owners of a deployable.
pub type OwnerSet = BTreeSet<String>;

/// The kind of workload a manifest describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestKind {
    /// Long-running service answering HTTP health checks.
    #[default]
    HttpService,
    /// Long-running background worker.
    Worker,
    /// Run on demand.
    OnDemand,
    /// Run on a cron schedule.
    Scheduled,
    /// Run exactly once.
    Once,
}

/// Volume access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VolumeMode {
    /// Read-only.
    #[default]
    RO,
    /// Read-write.
    RW,
}

/// A host directory mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Volume {
    /// Host path.
    pub host: String,
    /// Path inside the container.
    pub container: String,
    /// Access mode.
    #[serde(default)]
    pub mode: VolumeMode,
}

/// Health-check and startup behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Startup {
    /// Skip health checking entirely.
    pub skip_check: bool,
    /// Seconds to wait before the first connection attempt.
    pub connect_delay: u32,
    /// Seconds the deploy may take to become healthy.
    pub timeout: u32,
    /// Seconds between connection attempts.
    pub connect_interval: u32,
    /// Protocol for the readiness check.
    pub check_ready_protocol: String,
    /// Path for the readiness check.
    pub check_ready_uri_path: String,
    /// Index of the port the readiness check targets.
    pub check_ready_port_index: u32,
    /// HTTP statuses that count as definite failure.
    pub check_ready_failure_statuses: Vec<u16>,
    /// Seconds before one readiness request times out.
    pub check_ready_uri_timeout: u32,
    /// Seconds between readiness checks.
    pub check_ready_interval: u32,
    /// Readiness retries before the deploy fails.
    pub check_ready_retries: u32,
}

impl Default for Startup {
    fn default() -> Self {
        Self {
            skip_check: false,
            connect_delay: 10,
            timeout: 30,
            connect_interval: 1,
            check_ready_protocol: String::from("HTTP"),
            check_ready_uri_path: String::from("/health"),
            check_ready_port_index: 0,
            check_ready_failure_statuses: vec![500, 503],
            check_ready_uri_timeout: 5,
            check_ready_interval: 1,
            check_ready_retries: 3,
        }
    }
}

/// Desired or observed configuration for one [`DeploymentId`].
///
/// Two deployments are equal when their identity matches and
/// [`Deployment::differences`] is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Cluster name.
    pub cluster_name: String,
    /// Source and version to run.
    pub source_id: SourceId,
    /// Flavor, empty for the default flavor.
    #[serde(default)]
    pub flavor: String,
    /// Workload kind.
    #[serde(default)]
    pub kind: ManifestKind,
    /// Owners.
    #[serde(default)]
    pub owners: OwnerSet,
    /// Number of instances to run.
    pub num_instances: u32,
    /// Resource requests.
    #[serde(default)]
    pub resources: Resources,
    /// Environment variables.
    #[serde(default)]
    pub env: Env,
    /// Metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Volume mounts.
    #[serde(default)]
    pub volumes: Vec<Volume>,
    /// Health-check configuration.
    #[serde(default)]
    pub startup: Startup,
    /// Cron schedule for scheduled workloads.
    #[serde(default)]
    pub schedule: String,
}

impl Deployment {
    /// Creates a deployment with default configuration and default resources.
    #[must_use]
    pub fn new(
        cluster_name: impl Into<String>,
        source_id: SourceId,
        flavor: impl Into<String>,
        num_instances: u32,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            source_id,
            flavor: flavor.into(),
            kind: ManifestKind::default(),
            owners: OwnerSet::new(),
            num_instances,
            resources: Resources::defaults(),
            env: Env::new(),
            metadata: Metadata::new(),
            volumes: Vec::new(),
            startup: Startup::default(),
            schedule: String::new(),
        }
    }

    /// Returns the identity of this deployment.
    #[must_use]
    pub fn id(&self) -> DeploymentId {
        DeploymentId::new(
            self.cluster_name.clone(),
            self.source_id.location.clone(),
            self.flavor.clone(),
        )
    }

    /// Returns the source location.
    #[must_use]
    pub const fn location(&self) -> &SourceLocation {
        &self.source_id.location
    }

    /// Validates the resource requests of this deployment.
    #[must_use]
    pub fn validate(&self) -> Vec<Flaw> {
        self.resources.validate(&self.id().to_string())
    }

    /// Lists the fields that differ from another deployment of the same ID.
    ///
    /// The instance count only counts for kinds the scheduler keeps a count
    /// for.
    #[must_use]
    pub fn differences(&self, other: &Self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.source_id.version != other.source_id.version {
            fields.push("version");
        }
        if self.kind != other.kind {
            fields.push("kind");
        }
        if self.owners != other.owners {
            fields.push("owners");
        }
        if self.kind.is_instanced() && self.num_instances != other.num_instances {
            fields.push("num_instances");
        }
        if self.resources != other.resources {
            fields.push("resources");
        }
        if self.env != other.env {
            fields.push("env");
        }
        if self.metadata != other.metadata {
            fields.push("metadata");
        }
        if self.volumes != other.volumes {
            fields.push("volumes");
        }
        if self.startup != other.startup {
            fields.push("startup");
        }
        if self.schedule != other.schedule {
            fields.push("schedule");
        }
        fields
    }
}

impl ManifestKind {
    /// Returns true if the scheduler keeps an instance count for this kind.
    #[must_use]
    pub const fn is_instanced(self) -> bool {
        matches!(self, Self::HttpService | Self::Worker)
    }
}

impl PartialEq for Deployment {
    fn eq(&self, other: &Self) -> bool {
        self.cluster_name == other.cluster_name
            && self.source_id.location == other.source_id.location
            && self.flavor == other.flavor
            && self.differences(other).is_empty()
    }
}

impl fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::HttpService => "http-service",
            Self::Worker => "worker",
            Self::OnDemand => "on-demand",
            Self::Scheduled => "scheduled",
            Self::Once => "once",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ManifestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http-service" => Ok(Self::HttpService),
            "worker" => Ok(Self::Worker),
            "on-demand" => Ok(Self::OnDemand),
            "scheduled" => Ok(Self::Scheduled),
            "once" => Ok(Self::Once),
            other => Err(format!("unknown manifest kind: {other}")),
        }
    }
}

impl fmt::Display for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {} x{}",
            self.id(),
            self.source_id.version,
            self.num_instances
        )
    }
}
