//! # Service & Volume Declarations
//!
//! Immutable value types describing *what* should run. Nothing in here knows
//! about runtime state; the [`lifecycle`](crate::lifecycle) module owns that.
//!
//! - [`Service`]: image, ports, environment and `depends_on` edges.
//! - [`Volume`]: persistent storage mounted into exactly one owning service.
//! - [`PortMapping`]: a `host:container` pair, parsed from strings like `"8000:80"`.

use crate::error::TopologyError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Environment variables handed to a service, ordered by key.
pub type Environment = BTreeMap<String, String>;

/// Unique name of a service within a topology (e.g. `db`, `bot`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ServiceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Unique name of a persistent volume (e.g. `pgdata`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(String);

impl VolumeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VolumeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for VolumeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A published port: traffic to `host` on the machine reaches `container` inside the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl PortMapping {
    pub fn new(host: u16, container: u16) -> Self {
        Self { host, container }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

impl FromStr for PortMapping {
    type Err = TopologyError;

    /// Accepts `"HOST:CONTAINER"` or a bare `"PORT"` (same port on both sides).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| TopologyError::InvalidPort(s.to_string()))
        };

        match s.split_once(':') {
            Some((host, container)) => Ok(Self::new(parse(host)?, parse(container)?)),
            None => {
                let port = parse(s)?;
                Ok(Self::new(port, port))
            }
        }
    }
}

/// A single deployable unit in the topology.
///
/// Built with a small fluent API:
///
/// ```rust
/// use stackup::Service;
///
/// let bot = Service::new("bot", "registry.local/bot:latest")
///     .with_port(8000, 8000)
///     .with_env("DATABASE_HOST", "db")
///     .depends_on("db");
///
/// assert_eq!(bot.depends_on.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub id: ServiceId,
    pub image: String,
    pub ports: Vec<PortMapping>,
    pub environment: Environment,
    pub depends_on: BTreeSet<ServiceId>,
    /// Keys that must be present in `environment` for the service to be declared.
    pub required_env: Vec<String>,
}

impl Service {
    pub fn new(id: impl Into<ServiceId>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            ports: Vec::new(),
            environment: Environment::new(),
            depends_on: BTreeSet::new(),
            required_env: Vec::new(),
        }
    }

    pub fn with_port(mut self, host: u16, container: u16) -> Self {
        self.ports.push(PortMapping::new(host, container));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Merges `environment` into the service's variables; later values win.
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment.extend(environment);
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<ServiceId>) -> Self {
        self.depends_on.insert(dependency.into());
        self
    }

    pub fn require_env(mut self, key: impl Into<String>) -> Self {
        self.required_env.push(key.into());
        self
    }

    /// Required keys that have no value in the environment.
    pub fn missing_env(&self) -> impl Iterator<Item = &str> {
        self.required_env
            .iter()
            .filter(|key| !self.environment.contains_key(key.as_str()))
            .map(String::as_str)
    }
}

/// Persistent storage that outlives the process of the service it is mounted into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Volume {
    pub id: VolumeId,
    /// Absolute path inside the owning service's filesystem.
    pub mount_path: String,
}

impl Volume {
    pub fn new(id: impl Into<VolumeId>, mount_path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mount_path: mount_path.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_container_pairs() {
        let mapping: PortMapping = "8000:80".parse().unwrap();
        assert_eq!(mapping, PortMapping::new(8000, 80));
        assert_eq!(mapping.to_string(), "8000:80");
    }

    #[test]
    fn bare_port_maps_to_itself() {
        let mapping: PortMapping = "5432".parse().unwrap();
        assert_eq!(mapping, PortMapping::new(5432, 5432));
    }

    #[test]
    fn rejects_malformed_ports() {
        for input in ["", "abc", "80:", ":80", "0:80", "70000:80", "1:2:3"] {
            let result = input.parse::<PortMapping>();
            assert!(
                matches!(result, Err(TopologyError::InvalidPort(_))),
                "expected {input:?} to be rejected"
            );
        }
    }

    #[test]
    fn reports_missing_required_env() {
        let service = Service::new("db", "postgres:15")
            .with_env("POSTGRES_USER", "bot")
            .require_env("POSTGRES_USER")
            .require_env("POSTGRES_PASSWORD");

        let missing: Vec<&str> = service.missing_env().collect();
        assert_eq!(missing, vec!["POSTGRES_PASSWORD"]);
    }
}
