//! # Stackup
//!
//! Dependency-aware orchestration for a small set of containerized services: declare
//! services, their `depends_on` edges and their persistent volumes, then start them
//! in dependency order, wait for each to report ready, and stop them in reverse.
//!
//! ## Architecture Overview
//!
//! The crate separates concerns into three layers:
//!
//! 1. **Topology Model** ([`Topology`]) - the immutable, validated dependency graph
//! 2. **Lifecycle Controller** ([`LifecycleController`]) - per-service state machines driven concurrently
//! 3. **State Store Binding** ([`store::VolumeStore`]) - which service currently owns which volume
//!
//! The controller never talks to a container engine directly. It goes through the
//! [`ContainerRuntime`] trait, so the same orchestration logic runs against Docker in
//! production and against [`mock::MockRuntime`] in tests.
//!
//! ## Quick Start
//!
//! ```rust
//! use stackup::mock::MockRuntime;
//! use stackup::{ControllerConfig, LifecycleController, Service, ServiceState, Topology, Volume};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 1. Declare the topology
//!     let mut builder = Topology::builder();
//!     builder.add_service(Service::new("db", "postgres:15").with_port(5432, 5432))?;
//!     builder.add_service(Service::new("bot", "bot:latest").with_port(8000, 8000).depends_on("db"))?;
//!     builder.add_volume(Volume::new("pgdata", "/var/lib/postgresql/data"), "db")?;
//!     let topology = builder.build()?;
//!
//!     // 2. Bring it up
//!     let runtime = Arc::new(MockRuntime::new());
//!     let controller = LifecycleController::new(topology, runtime, ControllerConfig::default());
//!     let report = controller.start_all().await;
//!     assert!(report.all_ready());
//!
//!     // 3. Tear it down
//!     let report = controller.stop_all().await;
//!     assert_eq!(report.state_of(&"db".into()), Some(ServiceState::Stopped));
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency Model
//!
//! - Each service starts in its own Tokio task; independent branches start in parallel
//! - A service enters `Starting` only after all of its dependencies are `Ready`
//! - The volume store is an actor task; bindings are only touched by that task
//! - Long waits (dependencies, start, probes, backoff) are cancellable
//!
//! ## Testing
//!
//! [`mock::MockRuntime`] scripts probe outcomes, start failures and slow stops per
//! service and records every call with a timestamp. See the [`mock`] module.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod mock;
pub mod runtime;
pub mod service;
pub mod store;
pub mod topology;
pub mod tracing;

// Re-export core types for convenience
pub use config::DeploymentConfig;
pub use error::{ConfigError, LifecycleError, RuntimeError, StoreError, TopologyError};
pub use lifecycle::{
    ControllerConfig, LifecycleController, LifecycleReport, RetryPolicy, ServiceState,
    ServiceStatus,
};
pub use runtime::{ContainerHandle, ContainerRuntime, ProbeStatus};
pub use service::{Environment, PortMapping, Service, ServiceId, Volume, VolumeId};
pub use store::{VolumeBinding, VolumeStore, VolumeStoreClient};
pub use topology::{Topology, TopologyBuilder, VolumeDeclaration};
