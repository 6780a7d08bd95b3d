//! Singularity scheduler client.
//!
//! This module provides the HTTP client for the Singularity REST API. Each
//! cluster has its own base URL; the client itself is shared.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, header};
use semver::Version;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::error::{ConvergeError, Result, SchedulerError};
use crate::model::{
    Cluster, Defs, Deployment, Deployments, ManifestKind, OwnerSet, Resources, SourceId,
    SourceLocation, Startup, Volume, CPUS, MEMORY, PORTS,
};
use crate::rectify::Deployable;

use super::deployer::Deployer;
use super::types::{
    ContainerInfo, DeleteRequestBody, DeployRequest, DeployResources, DeployVolume, DockerInfo,
    Healthcheck, META_CLUSTER, META_DIR, META_FLAVOR, META_PREFIX, META_REPO,
    META_RESOURCE_PREFIX, META_REVISION, META_VERSION, RequestParent, RequestType,
    SingularityDeploy, SingularityRequest,
};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default wait when a 429 carries no `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Singularity API client.
#[derive(Debug, Clone)]
pub struct SingularityClient {
    /// HTTP client.
    client: Client,
}

impl SingularityClient {
    /// Creates a new client with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| {
                SchedulerError::network("<client>", format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self { client })
    }

    fn request(&self, method: Method, cluster: &Cluster, path: &str) -> (String, RequestBuilder) {
        let url = format!("{}{path}", cluster.base_url.trim_end_matches('/'));
        trace!("{method} {url}");
        let builder = self
            .client
            .request(method, &url)
            .header(header::ACCEPT, "application/json");
        (url, builder)
    }

    /// Sends a request and maps HTTP failures onto scheduler errors.
    async fn send(url: &str, builder: RequestBuilder) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| SchedulerError::network(url, format!("Request failed: {e}")))?;

        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);

            return Err(SchedulerError::RateLimited {
                retry_after_secs: retry_after,
            }
            .into());
        }

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(SchedulerError::AuthenticationFailed {
                message: format!("{url} answered {status}"),
            }
            .into());
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SchedulerError::api_error(status.as_u16(), body).into());
        }

        Ok(response)
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
        response.json().await.map_err(|e| {
            ConvergeError::from(SchedulerError::InvalidResponse {
                message: format!("Failed to parse response: {e}"),
            })
        })
    }

    /// Lists every request on a cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn list_requests(&self, cluster: &Cluster) -> Result<Vec<RequestParent>> {
        let (url, builder) = self.request(Method::GET, cluster, "/api/requests");
        let response = Self::send(&url, builder).await?;
        Self::json(response).await
    }

    /// Reads the deployments running on one cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn cluster_deployments(&self, cluster: &Cluster) -> Result<Vec<Deployment>> {
        let requests = self.list_requests(cluster).await?;
        let total = requests.len();
        let deployments: Vec<Deployment> = requests
            .into_iter()
            .filter_map(|parent| observed_deployment(cluster, parent))
            .collect();
        debug!(
            "Cluster {} has {total} requests, {} managed deployments",
            cluster.name,
            deployments.len()
        );
        Ok(deployments)
    }
}

#[async_trait]
impl Deployer for SingularityClient {
    async fn running_deployments(&self, defs: &Defs) -> Result<Deployments> {
        let mut all = Deployments::new();
        for cluster in defs.clusters.values() {
            for deployment in self.cluster_deployments(cluster).await? {
                if let Some(previous) = all.upsert(deployment) {
                    warn!("Duplicate observed deployment {}, keeping the last one", previous.id());
                }
            }
        }
        Ok(all)
    }

    async fn deploy(&self, deployable: &Deployable, request_id: &str) -> Result<()> {
        let body = deploy_request(deployable, request_id);
        info!(
            "Deploying {} as {} to {}",
            deployable.deployment.id(),
            body.deploy.id,
            deployable.cluster.name
        );

        let (url, builder) = self.request(Method::POST, &deployable.cluster, "/api/deploys");
        Self::send(&url, builder.json(&body)).await?;
        Ok(())
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
        let body = SingularityRequest {
            id: request_id.to_string(),
            request_type: RequestType::from(kind),
            instances: instances_for(kind, count),
            owners: owners.iter().cloned().collect(),
            schedule: schedule_for(schedule),
        };
        info!("Creating request {request_id} on {}", cluster.name);

        let (url, builder) = self.request(Method::POST, cluster, "/api/requests");
        Self::send(&url, builder.json(&body)).await?;
        Ok(())
    }

    async fn delete_request(
        &self,
        cluster: &Cluster,
        request_id: &str,
        message: &str,
    ) -> Result<()> {
        let body = DeleteRequestBody {
            message: message.to_string(),
        };
        info!("Deleting request {request_id} on {}: {message}", cluster.name);

        let path = format!("/api/requests/request/{request_id}");
        let (url, builder) = self.request(Method::DELETE, cluster, &path);
        Self::send(&url, builder.json(&body)).await?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "singularity"
    }
}

/// Only long-running kinds carry an instance count.
const fn instances_for(kind: ManifestKind, count: u32) -> Option<u32> {
    if kind.is_instanced() { Some(count) } else { None }
}

fn schedule_for(schedule: &str) -> Option<String> {
    (!schedule.is_empty()).then(|| schedule.to_string())
}

/// Builds the deploy body, including the request update carrying the
/// instance count.
fn deploy_request(deployable: &Deployable, request_id: &str) -> DeployRequest {
    let dep = &deployable.deployment;

    let mut metadata = dep.metadata.clone();
    metadata.insert(META_CLUSTER.to_string(), dep.cluster_name.clone());
    metadata.insert(META_REPO.to_string(), dep.source_id.location.repo.clone());
    metadata.insert(META_DIR.to_string(), dep.source_id.location.dir.clone());
    metadata.insert(META_FLAVOR.to_string(), dep.flavor.clone());
    metadata.insert(META_VERSION.to_string(), dep.source_id.version.to_string());
    metadata.insert(META_REVISION.to_string(), deployable.revision());
    for (name, value) in dep.resources.iter() {
        if !matches!(name, CPUS | MEMORY | PORTS) {
            metadata.insert(format!("{META_RESOURCE_PREFIX}{name}"), value.to_string());
        }
    }

    let startup = &dep.startup;
    let healthcheck = Healthcheck {
        uri: startup.check_ready_uri_path.clone(),
        port_index: startup.check_ready_port_index,
        protocol: startup.check_ready_protocol.clone(),
        startup_delay_seconds: startup.connect_delay,
        startup_timeout_seconds: startup.timeout,
        startup_interval_seconds: startup.connect_interval,
        interval_seconds: startup.check_ready_interval,
        response_timeout_seconds: startup.check_ready_uri_timeout,
        max_retries: startup.check_ready_retries,
        failure_status_codes: startup.check_ready_failure_statuses.clone(),
    };

    let deploy = SingularityDeploy {
        request_id: request_id.to_string(),
        id: deployable.deploy_id(),
        container_info: ContainerInfo {
            container_type: String::from("DOCKER"),
            docker: DockerInfo {
                image: deployable.artifact.reference(),
            },
            volumes: dep
                .volumes
                .iter()
                .map(|v| DeployVolume {
                    host_path: v.host.clone(),
                    container_path: v.container.clone(),
                    mode: v.mode,
                })
                .collect(),
        },
        resources: DeployResources {
            cpus: dep.resources.cpus(),
            memory_mb: dep.resources.memory(),
            num_ports: dep.resources.ports(),
        },
        env: dep.env.clone(),
        metadata,
        healthcheck: Some(healthcheck),
        skip_healthchecks_on_deploy: startup.skip_check,
    };

    let updated_request = SingularityRequest {
        id: request_id.to_string(),
        request_type: RequestType::from(dep.kind),
        instances: instances_for(dep.kind, dep.num_instances),
        owners: dep.owners.iter().cloned().collect(),
        schedule: schedule_for(&dep.schedule),
    };

    DeployRequest {
        deploy,
        updated_request: Some(updated_request),
        unpause_on_successful_deploy: true,
    }
}

/// Rebuilds a deployment from a request listing entry.
///
/// Requests that were not deployed by this engine, or that have no active
/// deploy, are not observed.
fn observed_deployment(cluster: &Cluster, parent: RequestParent) -> Option<Deployment> {
    let deploy = parent.active_deploy?;
    let meta = &deploy.metadata;

    let owned_by = meta.get(META_CLUSTER)?;
    if *owned_by != cluster.name {
        debug!(
            "Request {} belongs to cluster {owned_by}, not {}",
            parent.request.id, cluster.name
        );
        return None;
    }
    let repo = meta.get(META_REPO)?.clone();
    let version = match Version::parse(meta.get(META_VERSION)?) {
        Ok(version) => version,
        Err(e) => {
            warn!("Request {} has an unparseable version: {e}", parent.request.id);
            return None;
        }
    };
    let dir = meta.get(META_DIR).cloned().unwrap_or_default();
    let flavor = meta.get(META_FLAVOR).cloned().unwrap_or_default();

    let kind = ManifestKind::from(parent.request.request_type);
    let source = SourceId::new(SourceLocation::new(repo, dir), version);
    let mut deployment = Deployment::new(
        cluster.name.clone(),
        source,
        flavor,
        parent.request.instances.unwrap_or(1),
    );
    deployment.kind = kind;
    deployment.owners = parent.request.owners.into_iter().collect();
    deployment.schedule = parent.request.schedule.unwrap_or_default();
    deployment.env = deploy.env;
    deployment.metadata = meta
        .iter()
        .filter(|(k, _)| !k.starts_with(META_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<BTreeMap<_, _>>();
    deployment.resources = Resources::new()
        .with(CPUS, deploy.resources.cpus.to_string())
        .with(MEMORY, deploy.resources.memory_mb.to_string())
        .with(PORTS, deploy.resources.num_ports.to_string());
    for (key, value) in meta {
        if let Some(name) = key.strip_prefix(META_RESOURCE_PREFIX) {
            deployment.resources.insert(name, value.clone());
        }
    }
    deployment.volumes = deploy
        .container_info
        .volumes
        .into_iter()
        .map(|v| Volume {
            host: v.host_path,
            container: v.container_path,
            mode: v.mode,
        })
        .collect();
    deployment.startup = match deploy.healthcheck {
        Some(hc) => Startup {
            skip_check: deploy.skip_healthchecks_on_deploy,
            connect_delay: hc.startup_delay_seconds,
            timeout: hc.startup_timeout_seconds,
            connect_interval: hc.startup_interval_seconds,
            check_ready_protocol: hc.protocol,
            check_ready_uri_path: hc.uri,
            check_ready_port_index: hc.port_index,
            check_ready_failure_statuses: hc.failure_status_codes,
            check_ready_uri_timeout: hc.response_timeout_seconds,
            check_ready_interval: hc.interval_seconds,
            check_ready_retries: hc.max_retries,
        },
        None => Startup {
            skip_check: true,
            ..Startup::default()
        },
    };

    Some(deployment)
}
