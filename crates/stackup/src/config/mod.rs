//! # Deployment Files
//!
//! Loads a TOML deployment description into a [`Topology`] and a
//! [`ControllerConfig`].
//!
//! ```toml
//! [orchestrator]
//! max_retries = 5
//! base_delay_ms = 250
//!
//! [[services]]
//! name = "db"
//! image = "postgres:15"
//! ports = ["5432:5432"]
//! env_file = "db.env"
//! required_env = ["POSTGRES_PASSWORD"]
//!
//! [[services]]
//! name = "bot"
//! image = "registry.local/bot:latest"
//! ports = ["8000"]
//! depends_on = ["db"]
//! environment = { DATABASE_HOST = "db" }
//!
//! [[volumes]]
//! name = "pgdata"
//! owner = "db"
//! mount_path = "/var/lib/postgresql/data"
//! ```
//!
//! Services may reference each other in any order within the file. Relative
//! `env_file` paths resolve against the directory of the deployment file, and
//! inline `environment` entries override values read from the env file.

mod env_file;

pub use env_file::{parse_env, read_env_file};

use crate::error::ConfigError;
use crate::lifecycle::{ControllerConfig, RetryPolicy};
use crate::service::{Environment, PortMapping, Service, ServiceId, Volume};
use crate::topology::Topology;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// A parsed deployment file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
}

/// `[orchestrator]` table. Every field is optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            stop_timeout_ms: 10_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            retry: RetryPolicy::new(
                self.max_retries,
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            ),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
        }
    }
}

/// One `[[services]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub ports: Vec<String>,
    pub env_file: Option<PathBuf>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub required_env: Vec<String>,
}

/// One `[[volumes]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeConfig {
    pub name: String,
    pub owner: String,
    pub mount_path: String,
}

impl DeploymentConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        info!(
            path = %path.display(),
            services = config.services.len(),
            volumes = config.volumes.len(),
            "Deployment file loaded"
        );
        Ok(config)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        self.orchestrator.controller_config()
    }

    /// Builds the topology, reading env files relative to `base_dir`.
    pub fn into_topology(self, base_dir: impl AsRef<Path>) -> Result<Topology, ConfigError> {
        let base_dir = base_dir.as_ref();

        let services = self
            .services
            .into_iter()
            .map(|entry| entry.into_service(base_dir))
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = Topology::builder();
        builder.add_services(services)?;
        for volume in self.volumes {
            builder.add_volume(Volume::new(volume.name, volume.mount_path), volume.owner)?;
        }
        Ok(builder.build()?)
    }
}

impl ServiceConfig {
    fn into_service(self, base_dir: &Path) -> Result<Service, ConfigError> {
        let mut environment = match &self.env_file {
            Some(file) => {
                let path = base_dir.join(file);
                debug!(service = %self.name, path = %path.display(), "Reading env file");
                read_env_file(&path)?
            }
            None => Environment::new(),
        };
        environment.extend(self.environment);

        let ports = self
            .ports
            .iter()
            .map(|port| port.parse::<PortMapping>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Service {
            id: ServiceId::new(self.name),
            image: self.image,
            ports,
            environment,
            depends_on: self.depends_on.into_iter().map(ServiceId::from).collect::<BTreeSet<_>>(),
            required_env: self.required_env,
        })
    }
}
