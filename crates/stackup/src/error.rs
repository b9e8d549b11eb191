//! # Orchestrator Errors
//!
//! Errors are grouped by *when* they can happen, because each group is handled differently:
//!
//! | Error | Raised by | Handling |
//! |-------|-----------|----------|
//! | [`TopologyError`] | building a [`Topology`](crate::Topology) | Fatal. No topology exists. |
//! | [`LifecycleError`] | starting/stopping one service | Recorded per service, other branches continue. |
//! | [`StoreError`] | volume binding | Caller-correctable. |
//! | [`RuntimeError`] | a [`ContainerRuntime`](crate::ContainerRuntime) adapter | Wrapped into a `LifecycleError`. |
//! | [`ConfigError`] | loading a deployment file | Fatal at startup. |

use crate::lifecycle::ServiceState;
use crate::service::{ServiceId, VolumeId};
use std::path::PathBuf;
use thiserror::Error;

/// Structural problems detected while declaring services and volumes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Cyclic dependency involving service: {0}")]
    CyclicDependency(ServiceId),

    #[error("Service {service} depends on unknown service {dependency}")]
    UnknownDependency {
        service: ServiceId,
        dependency: ServiceId,
    },

    #[error("Volume {volume} is owned by unknown service {owner}")]
    UnknownOwner { volume: VolumeId, owner: ServiceId },

    #[error("Host port {port} is exposed by both {first} and {second}")]
    PortConflict {
        port: u16,
        first: ServiceId,
        second: ServiceId,
    },

    #[error("Service already declared: {0}")]
    DuplicateService(ServiceId),

    #[error("Volume already declared: {0}")]
    DuplicateVolume(VolumeId),

    #[error("Service {service} is missing required environment variable {key}")]
    MissingEnvironment { service: ServiceId, key: String },

    #[error("Invalid port mapping: {0:?}")]
    InvalidPort(String),

    #[error("Volume {volume} needs an absolute mount path, got {path:?}")]
    InvalidMountPath { volume: VolumeId, path: String },
}

/// Errors from the volume binding table.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Volume {volume} is already bound to {owner}")]
    VolumeAlreadyBound { volume: VolumeId, owner: ServiceId },

    #[error("Volume {volume} is in use by {owner}")]
    VolumeInUse { volume: VolumeId, owner: ServiceId },

    #[error("Unknown volume: {0}")]
    UnknownVolume(VolumeId),

    #[error("Volume store closed")]
    StoreClosed,

    #[error("Volume store dropped response channel")]
    StoreDropped,
}

/// Failures reported by a container runtime adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Container start failed: {0}")]
    Start(String),

    #[error("Container stop failed: {0}")]
    Stop(String),

    #[error("Runtime command failed: {0}")]
    Command(String),

    #[error("Runtime unavailable: {0}")]
    Unavailable(String),
}

/// Per-service runtime failures. Recorded in the service's status, never propagated
/// across service boundaries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Service {service} cannot start: dependency {dependency} did not become ready")]
    DependencyFailed {
        service: ServiceId,
        dependency: ServiceId,
    },

    #[error("Service {service} not ready after {attempts} probe attempts")]
    ProbeTimeout { service: ServiceId, attempts: u32 },

    #[error("Service {service} failed to start: {source}")]
    StartFailed {
        service: ServiceId,
        #[source]
        source: RuntimeError,
    },

    #[error("Volume binding failed for {service}: {source}")]
    Volume {
        service: ServiceId,
        #[source]
        source: StoreError,
    },

    #[error("Lifecycle operation on {0} was cancelled")]
    Cancelled(ServiceId),

    #[error("Unknown service: {0}")]
    UnknownService(ServiceId),

    #[error("Service {service} cannot be restarted while {state}")]
    NotRestartable {
        service: ServiceId,
        state: ServiceState,
    },
}

/// Errors raised while loading a deployment file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid deployment file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{path}:{line}: {message}")]
    EnvFile {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error(transparent)]
    Topology(#[from] TopologyError),
}
