//! # Container Runtime Interface
//!
//! The orchestrator never pulls images, configures networks or mounts filesystems
//! itself. It drives an external runtime through the narrow [`ContainerRuntime`]
//! trait and reacts to the results.
//!
//! Implementations:
//! - [`MockRuntime`](crate::mock::MockRuntime) for tests, with scripted probe outcomes.
//! - `DockerCliRuntime` in the `stackup-sample` crate, which shells out to `docker`.

use crate::error::RuntimeError;
use crate::service::{Service, ServiceId, Volume};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Opaque reference to a started container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    pub service: ServiceId,
    /// Runtime-specific identifier (container id, pid, ...).
    pub id: String,
}

impl ContainerHandle {
    pub fn new(service: ServiceId, id: impl Into<String>) -> Self {
        Self {
            service,
            id: id.into(),
        }
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service, self.id)
    }
}

/// Outcome of a single readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    Ready,
    NotReady,
    /// The probe itself failed. Counts as a failed attempt, like `NotReady`.
    Errored(String),
}

/// Operations the lifecycle controller needs from a container runtime.
///
/// All methods take `&self`; implementations are shared between the concurrent
/// per-service tasks behind an `Arc<dyn ContainerRuntime>`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Starts `service` with `volumes` mounted and returns a handle to it.
    async fn start(
        &self,
        service: &Service,
        volumes: &[Volume],
    ) -> Result<ContainerHandle, RuntimeError>;

    /// Asks the container to shut down gracefully within `timeout`.
    async fn stop(&self, handle: &ContainerHandle, timeout: Duration) -> Result<(), RuntimeError>;

    /// Terminates the container immediately.
    async fn kill(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Checks whether the container is ready to serve its dependents.
    async fn probe(&self, handle: &ContainerHandle) -> ProbeStatus;
}
