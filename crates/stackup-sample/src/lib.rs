//! Docker-backed deployment of a [`stackup`] topology: the [`DockerCliRuntime`],
//! the [`Deployment`] wiring and the command line of the `stackup` binary.

pub mod cli;
pub mod deployment;
pub mod docker;

pub use deployment::{Deployment, UpOutcome};
pub use docker::DockerCliRuntime;
