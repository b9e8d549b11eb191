//! # Deployment
//!
//! Wires a deployment file, a container runtime and a [`LifecycleController`]
//! together, the way a binary uses the library.
//!
//! ```rust,ignore
//! let runtime = Arc::new(DockerCliRuntime::new("shop"));
//! let deployment = Deployment::load("stackup.toml", runtime)?;
//!
//! let report = deployment.up().await;      // dependency order, waits for readiness
//! println!("{report}");
//!
//! deployment.shutdown().await;             // cancel anything in flight, stop in reverse
//! ```

use stackup::{
    ConfigError, ContainerRuntime, DeploymentConfig, LifecycleController, LifecycleReport,
    ServiceId, Topology, TopologyError,
};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Deployment {
    pub controller: LifecycleController,
}

/// How [`Deployment::up_until`] ended.
#[derive(Debug)]
pub enum UpOutcome {
    /// Startup ran to completion. The report may still contain failures.
    Finished(LifecycleReport),
    /// Startup was interrupted; the report is from the shutdown that followed.
    Interrupted(LifecycleReport),
}

impl Deployment {
    /// Loads `path`, resolving env files next to it. Must be called within a Tokio runtime.
    pub fn load(
        path: impl AsRef<Path>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = DeploymentConfig::load(path)?;
        let settings = config.controller_config();
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let topology = config.into_topology(base_dir)?;

        info!(services = topology.len(), volumes = topology.volumes().len(), "Deployment ready");
        Ok(Self {
            controller: LifecycleController::new(topology, runtime, settings),
        })
    }

    pub fn topology(&self) -> &Topology {
        self.controller.topology()
    }

    /// Start and stop order, without touching the runtime.
    pub fn plan(&self) -> Result<(Vec<ServiceId>, Vec<ServiceId>), TopologyError> {
        let topology = self.topology();
        Ok((topology.resolve_start_order()?, topology.resolve_stop_order()?))
    }

    pub async fn up(&self) -> LifecycleReport {
        self.controller.start_all().await
    }

    /// Runs [`up`](Self::up) unless `interrupt` resolves first.
    ///
    /// On interrupt the start is cancelled and still awaited, so no start task is
    /// dropped while a container may be coming up, then the stack is shut down.
    pub async fn up_until(&self, interrupt: impl Future<Output = ()>) -> UpOutcome {
        let up = self.up();
        tokio::pin!(up);

        tokio::select! {
            report = &mut up => UpOutcome::Finished(report),
            _ = interrupt => {
                warn!("Interrupted during startup");
                self.controller.cancel().await;
                let report = up.await;
                debug!(all_ready = report.all_ready(), "Startup wound down");
                UpOutcome::Interrupted(self.shutdown().await)
            }
        }
    }

    /// Cancels in-flight starts, then stops everything in reverse dependency order.
    pub async fn shutdown(&self) -> LifecycleReport {
        self.controller.cancel().await;
        self.controller.stop_all().await
    }
}
