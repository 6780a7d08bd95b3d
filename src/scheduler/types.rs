//! Singularity API types.
//!
//! Only the fields the engine reads or writes are modelled; unknown fields in
//! responses are ignored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{ManifestKind, VolumeMode};

/// Metadata key carrying the cluster name of a deploy.
pub const META_CLUSTER: &str = "converge.cluster";
/// Metadata key carrying the source repository of a deploy.
pub const META_REPO: &str = "converge.repo";
/// Metadata key carrying the source directory of a deploy.
pub const META_DIR: &str = "converge.dir";
/// Metadata key carrying the flavor of a deploy.
pub const META_FLAVOR: &str = "converge.flavor";
/// Metadata key carrying the source version of a deploy.
pub const META_VERSION: &str = "converge.version";
/// Metadata key carrying the revision marker of a deploy.
pub const META_REVISION: &str = "converge.revision";
/// Prefix of metadata keys carrying resources the deploy body has no field
/// for.
pub const META_RESOURCE_PREFIX: &str = "converge.resource.";
/// Prefix shared by every engine-owned metadata key.
pub const META_PREFIX: &str = "converge.";

/// Scheduler request type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    /// Long-running service.
    Service,
    /// Long-running worker.
    Worker,
    /// Run on demand.
    OnDemand,
    /// Cron scheduled.
    Scheduled,
    /// Run once.
    RunOnce,
}

impl From<ManifestKind> for RequestType {
    fn from(kind: ManifestKind) -> Self {
        match kind {
            ManifestKind::HttpService => Self::Service,
            ManifestKind::Worker => Self::Worker,
            ManifestKind::OnDemand => Self::OnDemand,
            ManifestKind::Scheduled => Self::Scheduled,
            ManifestKind::Once => Self::RunOnce,
        }
    }
}

impl From<RequestType> for ManifestKind {
    fn from(kind: RequestType) -> Self {
        match kind {
            RequestType::Service => Self::HttpService,
            RequestType::Worker => Self::Worker,
            RequestType::OnDemand => Self::OnDemand,
            RequestType::Scheduled => Self::Scheduled,
            RequestType::RunOnce => Self::Once,
        }
    }
}

/// A logical request: the long-lived registration a deploy belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingularityRequest {
    /// Request identifier.
    pub id: String,
    /// Request type.
    pub request_type: RequestType,
    /// Desired instance count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<u32>,
    /// Owner email addresses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owners: Vec<String>,
    /// Cron schedule for scheduled requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

/// One entry of the request listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestParent {
    /// The request.
    pub request: SingularityRequest,
    /// Request state, e.g. `ACTIVE`.
    #[serde(default)]
    pub state: String,
    /// The deploy currently serving the request.
    #[serde(default)]
    pub active_deploy: Option<SingularityDeploy>,
}

/// A concrete deploy of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingularityDeploy {
    /// Request this deploy belongs to.
    pub request_id: String,
    /// Deploy identifier.
    pub id: String,
    /// Container to run.
    pub container_info: ContainerInfo,
    /// Resource requests.
    pub resources: DeployResources,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Deploy metadata, including the engine's identity keys.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Health check settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<Healthcheck>,
    /// Skip health checks while deploying.
    #[serde(default)]
    pub skip_healthchecks_on_deploy: bool,
}

/// Container description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    /// Container type, always `DOCKER`.
    #[serde(rename = "type")]
    pub container_type: String,
    /// Docker settings.
    pub docker: DockerInfo,
    /// Volume mounts.
    #[serde(default)]
    pub volumes: Vec<DeployVolume>,
}

/// Docker image settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerInfo {
    /// Image reference.
    pub image: String,
}

/// Volume mount on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployVolume {
    /// Host path.
    pub host_path: String,
    /// Container path.
    pub container_path: String,
    /// Access mode.
    pub mode: VolumeMode,
}

/// Resource requests on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResources {
    /// CPU shares.
    pub cpus: f64,
    /// Memory in MB.
    pub memory_mb: f64,
    /// Number of ports.
    pub num_ports: u32,
}

/// Health check settings on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Healthcheck {
    /// Path to check.
    pub uri: String,
    /// Port index to check.
    pub port_index: u32,
    /// Probe protocol.
    pub protocol: String,
    /// Delay before the first check.
    pub startup_delay_seconds: u32,
    /// Time allowed to become healthy.
    pub startup_timeout_seconds: u32,
    /// Interval between connection attempts.
    pub startup_interval_seconds: u32,
    /// Interval between checks.
    pub interval_seconds: u32,
    /// Timeout of one check.
    pub response_timeout_seconds: u32,
    /// Probes before failing.
    pub max_retries: u32,
    /// Statuses treated as definite failure.
    #[serde(default)]
    pub failure_status_codes: Vec<u16>,
}

/// Body of `POST /api/deploys`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    /// The deploy.
    pub deploy: SingularityDeploy,
    /// Request changes applied with the deploy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_request: Option<SingularityRequest>,
    /// Unpause the request if it was paused.
    #[serde(default)]
    pub unpause_on_successful_deploy: bool,
}

/// Body of `DELETE /api/requests/request/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequestBody {
    /// Reason shown in the scheduler's audit log.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_type_wire_names() {
        let json =
            serde_json::to_string(&RequestType::from(ManifestKind::Once)).expect("serialize");
        assert_eq!(json, "\"RUN_ONCE\"");
        let parsed: RequestType = serde_json::from_str("\"ON_DEMAND\"").expect("parse");
        assert_eq!(ManifestKind::from(parsed), ManifestKind::OnDemand);
    }

    #[test]
    fn test_request_parent_tolerates_missing_deploy() {
        let json =
            r#"{"request":{"id":"web","requestType":"SERVICE","instances":2},"state":"ACTIVE"}"#;
        let parent: RequestParent = serde_json::from_str(json).expect("parse");
        assert_eq!(parent.request.instances, Some(2));
        assert!(parent.active_deploy.is_none());
    }
}
