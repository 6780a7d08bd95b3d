//! Configuration module for the converge service.
//!
//! This module handles all file-based input:
//! - Parsing `converge.yaml` with environment and `.env` overrides
//! - Reading and writing desired-state manifest files
//! - Validation of configuration and desired state

mod manifest;
mod parser;
mod spec;
mod validator;

pub use manifest::{ClusterSpec, DeploySpec, Manifest, ManifestFile, Scalar};
pub use parser::{
    ConfigParser, DEFAULT_CONFIG_FILES, ENV_CLUSTER, ENV_INTERVAL_SECS, ENV_REGISTRY_URL,
    ENV_STORAGE_URL, find_config_file,
};
pub use spec::{
    MEMORY_STORAGE, ReconcileConfig, RegistryConfig, SchedulerConfig, ServiceConfig,
    StorageConfig,
};
pub use validator::{ConfigValidator, Issue, ValidationResult};
