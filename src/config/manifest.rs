//! Desired-state manifest file.
//!
//! A manifest file declares clusters and, per source location and flavor, the
//! deployment on each cluster:
//!
//! ```yaml
//! clusters:
//!   east:
//!     base_url: http://singularity.east.example
//! manifests:
//!   - repo: github.com/acme/web
//!     kind: http-service
//!     owners: [web@acme.example]
//!     deployments:
//!       east:
//!         version: 1.4.0
//!         num_instances: 3
//!         resources: { cpus: 0.5, memory: 256 }
//! ```

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{ConfigError, Result, ValidationError};
use crate::model::{
    Cluster, ClusterKind, Defs, Deployment, Deployments, Env, ManifestKind, Metadata, OwnerSet,
    Resources, SourceId, SourceLocation, Startup, State, Volume,
};

/// Root of a manifest file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Clusters by name.
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterSpec>,
    /// One entry per source location and flavor.
    #[serde(default)]
    pub manifests: Vec<Manifest>,
}

/// A cluster definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Scheduler implementation.
    #[serde(default)]
    pub kind: ClusterKind,
    /// Scheduler API base URL.
    pub base_url: String,
}

/// Everything deployed from one source location and flavor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Source repository.
    pub repo: String,
    /// Directory within the repository.
    #[serde(default)]
    pub dir: String,
    /// Flavor, empty for the default flavor.
    #[serde(default)]
    pub flavor: String,
    /// Workload kind.
    #[serde(default)]
    pub kind: ManifestKind,
    /// Owner email addresses.
    #[serde(default)]
    pub owners: OwnerSet,
    /// Deployment per cluster name.
    #[serde(default)]
    pub deployments: BTreeMap<String, DeploySpec>,
}

/// The deployment of a manifest on one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploySpec {
    /// Version to run.
    pub version: Version,
    /// Instance count.
    #[serde(default = "default_instances")]
    pub num_instances: u32,
    /// Resource requests. Numbers and strings are both accepted.
    #[serde(default)]
    pub resources: BTreeMap<String, Scalar>,
    /// Environment variables.
    #[serde(default)]
    pub env: Env,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Volume mounts.
    #[serde(default)]
    pub volumes: Vec<Volume>,
    /// Health-check behaviour.
    #[serde(default)]
    pub startup: Startup,
    /// Cron schedule for scheduled workloads.
    #[serde(default)]
    pub schedule: String,
}

/// A YAML scalar kept as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// Text value.
    Text(String),
}

const fn default_instances() -> u32 {
    1
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl ManifestFile {
    /// Loads a manifest file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, unreadable or not valid YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading manifests from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        })?;
        Self::parse(&content, Some(path))
    }

    /// Parses a manifest file from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML does not describe a manifest file.
    pub fn parse(content: &str, source: Option<&Path>) -> Result<Self> {
        let file: Self = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError {
            message: format!("YAML parse error: {e}"),
            location: source.map(|p| p.display().to_string()),
        })?;
        debug!(
            "Parsed {} clusters and {} manifests",
            file.clusters.len(),
            file.manifests.len()
        );
        Ok(file)
    }

    /// Renders the manifest file as YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| {
            ConfigError::ParseError {
                message: format!("YAML render error: {e}"),
                location: None,
            }
            .into()
        })
    }

    /// Converts the manifests into a desired state.
    ///
    /// The result is not validated; undefined clusters and resource flaws are
    /// reported when the state is validated or written.
    ///
    /// # Errors
    ///
    /// Returns an error if two manifests share a source location and flavor.
    pub fn to_state(&self) -> Result<State> {
        let mut defs = Defs::default();
        for (name, spec) in &self.clusters {
            defs.add_cluster(Cluster {
                name: name.clone(),
                kind: spec.kind,
                base_url: spec.base_url.clone(),
            });
        }

        let mut deployments = Deployments::new();
        for (i, manifest) in self.manifests.iter().enumerate() {
            for (cluster, spec) in &manifest.deployments {
                let deployment = manifest.deployment(cluster, spec);
                let id = deployment.id();
                if deployments.contains(&id) {
                    return Err(ValidationError::field(
                        format!("manifests[{i}]"),
                        format!("duplicate deployment {id}"),
                    )
                    .into());
                }
                deployments.upsert(deployment);
            }
        }

        Ok(State::new(defs, deployments))
    }

    /// Builds a manifest file from a desired state.
    #[must_use]
    pub fn from_state(state: &State) -> Self {
        let clusters = state
            .defs
            .clusters
            .values()
            .map(|c| {
                (
                    c.name.clone(),
                    ClusterSpec {
                        kind: c.kind,
                        base_url: c.base_url.clone(),
                    },
                )
            })
            .collect();

        let mut manifests: BTreeMap<(SourceLocation, String), Manifest> = BTreeMap::new();
        for (_, deployment) in state.deployments.iter() {
            let manifest = manifests
                .entry((deployment.location().clone(), deployment.flavor.clone()))
                .or_insert_with(|| Manifest {
                    repo: deployment.location().repo.clone(),
                    dir: deployment.location().dir.clone(),
                    flavor: deployment.flavor.clone(),
                    kind: deployment.kind,
                    owners: deployment.owners.clone(),
                    deployments: BTreeMap::new(),
                });
            manifest
                .deployments
                .insert(deployment.cluster_name.clone(), DeploySpec::from(deployment.as_ref()));
        }

        Self {
            clusters,
            manifests: manifests.into_values().collect(),
        }
    }
}

impl Manifest {
    fn deployment(&self, cluster: &str, spec: &DeploySpec) -> Deployment {
        let source = SourceId::new(
            SourceLocation::new(self.repo.clone(), self.dir.clone()),
            spec.version.clone(),
        );
        let mut deployment =
            Deployment::new(cluster, source, self.flavor.clone(), spec.num_instances);
        deployment.kind = self.kind;
        deployment.owners.clone_from(&self.owners);
        deployment.resources = spec
            .resources
            .iter()
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect::<Resources>();
        deployment.env.clone_from(&spec.env);
        deployment.metadata.clone_from(&spec.metadata);
        deployment.volumes.clone_from(&spec.volumes);
        deployment.startup = spec.startup.clone();
        deployment.schedule.clone_from(&spec.schedule);
        deployment
    }
}

impl From<&Deployment> for DeploySpec {
    fn from(deployment: &Deployment) -> Self {
        Self {
            version: deployment.source_id.version.clone(),
            num_instances: deployment.num_instances,
            resources: deployment
                .resources
                .iter()
                .map(|(name, value)| (name.to_string(), Scalar::Text(value.to_string())))
                .collect(),
            env: deployment.env.clone(),
            metadata: deployment.metadata.clone(),
            volumes: deployment.volumes.clone(),
            startup: deployment.startup.clone(),
            schedule: deployment.schedule.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeploymentId;
    use std::io::Write;

    const MANIFEST: &str = r"
clusters:
  east:
    base_url: http://east.example
  west:
    kind: singularity
    base_url: http://west.example
manifests:
  - repo: github.com/acme/web
    kind: http-service
    owners: [web@acme.example]
    deployments:
      east:
        version: 1.4.0
        num_instances: 3
        resources: { cpus: 0.5, memory: 256, ports: '2' }
        env: { LOG_LEVEL: info }
      west:
        version: 1.3.0
  - repo: github.com/acme/jobs
    dir: nightly
    kind: scheduled
    deployments:
      east:
        version: 2.0.0
        schedule: '0 3 * * *'
";

    #[test]
    fn test_manifest_to_state() {
        let state = ManifestFile::parse(MANIFEST, None).unwrap().to_state().unwrap();
        assert_eq!(state.defs.clusters.len(), 2);
        assert_eq!(state.deployments.len(), 3);

        let id = DeploymentId::new("east", SourceLocation::new("github.com/acme/web", ""), "");
        let web = state.deployments.get(&id).unwrap();
        assert_eq!(web.num_instances, 3);
        assert_eq!(web.resources.get("cpus"), Some("0.5"));
        assert_eq!(web.resources.get("memory"), Some("256"));
        assert_eq!(web.resources.get("ports"), Some("2"));
        assert_eq!(web.env.get("LOG_LEVEL").map(String::as_str), Some("info"));
        assert!(web.owners.contains("web@acme.example"));

        let west = DeploymentId::new("west", SourceLocation::new("github.com/acme/web", ""), "");
        let west = state.deployments.get(&west).unwrap();
        assert_eq!(west.num_instances, 1);
        assert_eq!(west.source_id.version, Version::new(1, 3, 0));

        let jobs = DeploymentId::new(
            "east",
            SourceLocation::new("github.com/acme/jobs", "nightly"),
            "",
        );
        assert_eq!(state.deployments.get(&jobs).unwrap().kind, ManifestKind::Scheduled);

        // Only what the file states is kept; missing resources are repaired later.
        let mut state = state;
        assert!(state.validate().is_err());
        assert_eq!(state.repair().len(), 6);
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_state_survives_yaml_round_trip() {
        let state = ManifestFile::parse(MANIFEST, None).unwrap().to_state().unwrap();
        let yaml = ManifestFile::from_state(&state).to_yaml().unwrap();
        let reparsed = ManifestFile::parse(&yaml, None).unwrap().to_state().unwrap();
        assert_eq!(reparsed, state);
    }

    #[test]
    fn test_duplicate_manifest_is_rejected() {
        let yaml = r"
clusters:
  east: { base_url: http://east.example }
manifests:
  - repo: github.com/acme/web
    deployments: { east: { version: 1.0.0 } }
  - repo: github.com/acme/web
    deployments: { east: { version: 2.0.0 } }
";
        let err = ManifestFile::parse(yaml, None).unwrap().to_state().unwrap_err();
        assert!(err.to_string().contains("manifests[1]"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MANIFEST.as_bytes()).unwrap();

        let manifests = ManifestFile::load(file.path()).unwrap();
        assert_eq!(manifests.manifests.len(), 2);
        assert!(ManifestFile::load(file.path().with_extension("missing")).is_err());
    }

    #[test]
    fn test_bad_version_is_a_parse_error() {
        let yaml = "manifests: [{ repo: a, deployments: { east: { version: latest } } }]";
        assert!(ManifestFile::parse(yaml, None).is_err());
    }
}
