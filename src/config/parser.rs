//! Configuration parser for loading service configuration.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with environment values taking precedence over the file.

use crate::error::{ConfigError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::ServiceConfig;

/// Environment variable overriding `storage.url`.
pub const ENV_STORAGE_URL: &str = "CONVERGE_STORAGE_URL";
/// Environment variable overriding `registry.url`.
pub const ENV_REGISTRY_URL: &str = "CONVERGE_REGISTRY_URL";
/// Environment variable overriding `reconcile.interval_secs`.
pub const ENV_INTERVAL_SECS: &str = "CONVERGE_INTERVAL_SECS";
/// Environment variable overriding `scope.cluster`.
pub const ENV_CLUSTER: &str = "CONVERGE_CLUSTER";

/// Configuration parser for loading service configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving the `.env` file.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ServiceConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

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

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<ServiceConfig> {
        debug!("Parsing YAML configuration");

        // An empty file is a valid, all-default configuration.
        if content.trim().is_empty() {
            return Ok(ServiceConfig::default());
        }

        let config: ServiceConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })?;

        debug!("Parsed configuration with storage at {}", config.storage.url);
        Ok(config)
    }

    /// Loads configuration from `path` if given, otherwise from the nearest
    /// `converge.yaml`, falling back to defaults when there is none. The
    /// process environment is applied on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a file is found but cannot be parsed, or an
    /// environment override is invalid.
    pub fn load(&self, path: Option<&Path>) -> Result<ServiceConfig> {
        let mut config = match path {
            Some(path) => self.load_file(path)?,
            None => {
                let start = self
                    .base_path
                    .clone()
                    .map_or_else(std::env::current_dir, Ok)?;
                match find_config_file(&start) {
                    Ok(found) => self.load_file(found)?,
                    Err(_) => {
                        debug!("No configuration file found, using defaults");
                        ServiceConfig::default()
                    }
                }
            }
        };

        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies environment overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if an override value is invalid.
    pub fn apply_env_overrides(
        config: &mut ServiceConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(url) = lookup(ENV_STORAGE_URL) {
            debug!("Overriding storage.url from environment");
            config.storage.url = url;
        }

        if let Some(url) = lookup(ENV_REGISTRY_URL) {
            debug!("Overriding registry.url from environment");
            config.registry.url = Some(url);
        }

        if let Some(secs) = lookup(ENV_INTERVAL_SECS) {
            debug!("Overriding reconcile.interval_secs from environment");
            config.reconcile.interval_secs = secs
                .trim()
                .parse()
                .map_err(|e| ConfigError::invalid(ENV_INTERVAL_SECS, format!("{secs:?}: {e}")))?;
        }

        if let Some(cluster) = lookup(ENV_CLUSTER) {
            debug!("Overriding scope.cluster from environment");
            config.scope.cluster = Some(cluster);
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| ConfigError::ParseError {
                message: format!("Failed to load .env file: {e}"),
                location: Some(env_path.display().to_string()),
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["converge.yaml", "converge.yml"];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }
    .into())
}
