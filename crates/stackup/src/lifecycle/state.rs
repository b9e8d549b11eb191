//! Per-service lifecycle states, transition history and the reports built from them.

use crate::error::LifecycleError;
use crate::service::ServiceId;
use std::fmt;
use tokio::time::Instant;

/// Where a service is in its lifecycle.
///
/// Legal transitions:
///
/// ```text
/// Pending  -> Starting | Stopped
/// Starting -> Ready | Failed | Stopping
/// Ready    -> Stopping
/// Stopping -> Stopped
/// Stopped  -> Starting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    /// Declared, not started yet.
    Pending,
    /// Start requested, readiness probe not satisfied yet.
    Starting,
    /// Probe succeeded; dependents may start.
    Ready,
    /// Shutdown in progress.
    Stopping,
    /// Shutdown complete (or never started and retired by `stop_all`).
    Stopped,
    /// Start attempt exhausted its retry budget.
    Failed,
}

impl ServiceState {
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::{Failed, Pending, Ready, Starting, Stopped, Stopping};
        matches!(
            (self, next),
            (Pending, Starting)
                | (Pending, Stopped)
                | (Starting, Ready)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Ready, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Starting)
        )
    }

    /// States from which `start_all` will (re)start the service.
    pub fn is_startable(self) -> bool {
        matches!(self, ServiceState::Pending | ServiceState::Stopped)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Pending => "pending",
            ServiceState::Starting => "starting",
            ServiceState::Ready => "ready",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One recorded state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ServiceState,
    pub to: ServiceState,
    pub at: Instant,
}

/// Snapshot of one service's runtime state.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub id: ServiceId,
    pub state: ServiceState,
    pub last_error: Option<LifecycleError>,
    pub transitions: Vec<Transition>,
}

impl ServiceStatus {
    /// When the service most recently entered `state`.
    pub fn entered(&self, state: ServiceState) -> Option<Instant> {
        self.transitions
            .iter()
            .rev()
            .find(|t| t.to == state)
            .map(|t| t.at)
    }
}

/// Final state of every service after a lifecycle operation, in start order.
#[derive(Debug, Clone, Default)]
pub struct LifecycleReport {
    pub services: Vec<ServiceStatus>,
}

impl LifecycleReport {
    pub fn get(&self, id: &ServiceId) -> Option<&ServiceStatus> {
        self.services.iter().find(|s| &s.id == id)
    }

    pub fn state_of(&self, id: &ServiceId) -> Option<ServiceState> {
        self.get(id).map(|s| s.state)
    }

    /// `true` when every service is `Ready`.
    pub fn all_ready(&self) -> bool {
        self.services.iter().all(|s| s.state == ServiceState::Ready)
    }

    /// Services carrying an error.
    pub fn failures(&self) -> impl Iterator<Item = &ServiceStatus> {
        self.services.iter().filter(|s| s.last_error.is_some())
    }
}

impl fmt::Display for LifecycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for status in &self.services {
            write!(f, "{:<20} {}", status.id.as_str(), status.state)?;
            if let Some(err) = &status.last_error {
                write!(f, " ({err})")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ServiceState::*;

    #[test]
    fn legal_transitions() {
        assert!(Pending.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Failed));
    }

    #[test]
    fn illegal_transitions() {
        assert!(!Pending.can_transition_to(Ready));
        assert!(!Failed.can_transition_to(Starting));
        assert!(!Ready.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Stopping));
        assert!(!Ready.can_transition_to(Ready));
    }
}
