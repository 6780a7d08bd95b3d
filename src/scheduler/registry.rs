//! Artifact registry capability.
//!
//! Resolves a source version to the concrete image a deploy should run.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::error::{RegistryError, Result};
use crate::model::SourceId;

/// Header carrying the content digest of a manifest.
const DIGEST_HEADER: &str = "docker-content-digest";

/// Manifest media types accepted from the registry.
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

/// A resolved, deployable artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildArtifact {
    /// Image name including tag, e.g. `registry.example/acme/web:1.2.0`.
    pub name: String,
    /// Content digest pinning the image, when known.
    pub digest: Option<String>,
}

impl BuildArtifact {
    /// Returns the image reference, pinned by digest when one is known.
    #[must_use]
    pub fn reference(&self) -> String {
        match &self.digest {
            Some(digest) => {
                let repository = self
                    .name
                    .rsplit_once(':')
                    .filter(|(_, tag)| !tag.contains('/'))
                    .map_or(self.name.as_str(), |(repo, _)| repo);
                format!("{repository}@{digest}")
            }
            None => self.name.clone(),
        }
    }
}

/// Capability resolving source versions to artifacts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Registry: Send + Sync {
    /// Resolves the artifact built from a source version.
    async fn resolve(&self, source: &SourceId) -> Result<BuildArtifact>;
}

/// Converts a repository location into an image path.
///
/// `github.com/acme/web` with dir `api` becomes `acme/web/api`.
#[must_use]
pub fn image_path(source: &SourceId) -> String {
    let repo = source.location.repo.trim_end_matches('/');
    let repo = repo.split_once('/').map_or(repo, |(host, rest)| {
        if host.contains('.') { rest } else { repo }
    });
    let mut path = repo.to_ascii_lowercase();
    let dir = source.location.dir.trim_matches('/');
    if !dir.is_empty() {
        path.push('/');
        path.push_str(&dir.to_ascii_lowercase());
    }
    path
}

/// Docker registry v2 client.
#[derive(Debug, Clone)]
pub struct DockerRegistry {
    client: Client,
    base_url: String,
}

impl DockerRegistry {
    /// Creates a registry client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| RegistryError::RequestFailed {
                url: base_url.to_string(),
                message: format!("Failed to create HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn host(&self) -> &str {
        self.base_url
            .split_once("://")
            .map_or(self.base_url.as_str(), |(_, host)| host)
    }
}

#[async_trait]
impl Registry for DockerRegistry {
    async fn resolve(&self, source: &SourceId) -> Result<BuildArtifact> {
        let path = image_path(source);
        let tag = source.version.to_string();
        let url = format!("{}/v2/{path}/manifests/{tag}", self.base_url);
        debug!("Resolving artifact for {source} at {url}");

        let response = self
            .client
            .head(&url)
            .header(header::ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(|e| RegistryError::RequestFailed {
                url: url.clone(),
                message: e.to_string(),
            })?;

        match response.status() {
            status if status.is_success() => {
                let digest = response
                    .headers()
                    .get(DIGEST_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                Ok(BuildArtifact {
                    name: format!("{}/{path}:{tag}", self.host()),
                    digest,
                })
            }
            StatusCode::NOT_FOUND => Err(RegistryError::ArtifactNotFound {
                source_id: source.to_string(),
            }
            .into()),
            status => Err(RegistryError::RequestFailed {
                url,
                message: format!("unexpected status {status}"),
            }
            .into()),
        }
    }
}

/// In-process registry used by tests and dry runs.
///
/// Artifacts must be registered unless the registry is permissive, in which
/// case unknown sources resolve to `<path>:<version>`.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    artifacts: Mutex<HashMap<SourceId, BuildArtifact>>,
    lookups: Mutex<Vec<SourceId>>,
    permissive: bool,
}

impl InMemoryRegistry {
    /// Creates a registry that only knows registered artifacts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry that synthesises artifacts for unknown sources.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Self::default()
        }
    }

    /// Registers an artifact for a source version.
    pub fn register(&self, source: SourceId, artifact: BuildArtifact) {
        self.artifacts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(source, artifact);
    }

    /// Returns every source looked up so far, in order.
    #[must_use]
    pub fn lookups(&self) -> Vec<SourceId> {
        self.lookups
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn resolve(&self, source: &SourceId) -> Result<BuildArtifact> {
        self.lookups
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(source.clone());

        let found = self
            .artifacts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(source)
            .cloned();

        match found {
            Some(artifact) => Ok(artifact),
            None if self.permissive => Ok(BuildArtifact {
                name: format!("{}:{}", image_path(source), source.version),
                digest: None,
            }),
            None => Err(RegistryError::ArtifactNotFound {
                source_id: source.to_string(),
            }
            .into()),
        }
    }
}
