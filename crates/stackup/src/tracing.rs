//! # Observability & Tracing
//!
//! [`setup_tracing`] installs a global `tracing` subscriber for binaries built on
//! this crate.
//!
//! ## Configuration
//!
//! Log levels come from `RUST_LOG`. The compact format hides module paths
//! (`with_target(false)`) because every event already carries a `service` or
//! `container` field.
//!
//! ```bash
//! # Transitions and start/stop summaries
//! RUST_LOG=info stackup up
//!
//! # Every probe attempt, backoff and dependency wait
//! RUST_LOG=debug stackup up
//!
//! # Only the controller
//! RUST_LOG=stackup::lifecycle=debug stackup up
//! ```
//!
//! ## What Gets Traced
//!
//! - **Transitions**: `from`/`to` on every state change (debug)
//! - **Start**: image, attempts until ready, probe errors (warn), failures with their cause
//! - **Stop**: graceful stop, timeouts escalating to kill
//! - **Volume store**: attach/detach with owner and attach count
//!
//! With `RUST_LOG=info` a healthy two-service start looks like:
//!
//! ```text
//! INFO start_all: Starting services order=[ServiceId("db"), ServiceId("bot")]
//! INFO start_all: Starting service service=db image=postgres:15
//! INFO start_all: Service ready service=db attempts=2
//! INFO start_all: Starting service service=bot image=bot:latest
//! INFO start_all: Service ready service=bot attempts=1
//! INFO start_all: Start finished ready=2 failed=0
//! ```

/// Initializes the global subscriber. Panics if one is already installed.
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();
}
