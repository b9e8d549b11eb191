//! # Service Lifecycle
//!
//! Everything that happens to a service after the [`Topology`](crate::Topology) is built.
//!
//! ## Modules
//!
//! - [`state`] - the per-service state machine and the reports built from it
//! - [`retry`] - readiness backoff and controller settings
//! - [`controller`] - the [`LifecycleController`] that drives services through the machine
//!
//! ## Start and Stop Ordering
//!
//! `start_all` starts dependencies first and only lets a dependent enter `Starting`
//! once every dependency is `Ready`. `stop_all` runs the other way: a service is
//! stopped only after everything that depends on it has stopped.
//!
//! ```text
//!   start:  db ──► cache ──► bot
//!   stop:   bot ──► cache ──► db
//! ```

pub mod controller;
pub mod retry;
pub mod state;

pub use controller::LifecycleController;
pub use retry::{ControllerConfig, RetryPolicy};
pub use state::{LifecycleReport, ServiceState, ServiceStatus, Transition};
