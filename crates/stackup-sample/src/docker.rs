//! # Docker CLI Runtime
//!
//! A [`ContainerRuntime`] that shells out to the `docker` binary with
//! `tokio::process`. Containers are named `{project}-{service}`, volumes
//! `{project}_{volume}`, and every container joins the `{project}` network under
//! its service name, so `bot` reaches `db` at the hostname `db`.
//!
//! Readiness comes from `docker inspect`: the health status when the image defines
//! a healthcheck, otherwise the plain container status.
//!
//! | Inspect result | Probe |
//! |----------------|-------|
//! | `healthy`, `running` | `Ready` |
//! | `starting`, `created`, `restarting` | `NotReady` |
//! | anything else (`unhealthy`, `exited`, ...) | `Errored` |

use async_trait::async_trait;
use stackup::{ContainerHandle, ContainerRuntime, ProbeStatus, RuntimeError, Service, Volume};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const STATUS_FORMAT: &str =
    "{{if .State.Health}}{{.State.Health.Status}}{{else}}{{.State.Status}}{{end}}";

#[derive(Debug, Clone)]
pub struct DockerCliRuntime {
    binary: String,
    project: String,
}

impl DockerCliRuntime {
    pub fn new(project: impl Into<String>) -> Self {
        Self::with_binary("docker", project)
    }

    /// Uses another docker-compatible binary, e.g. `podman`.
    pub fn with_binary(binary: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            project: project.into(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Creates the project network unless it exists already.
    pub async fn ensure_network(&self) -> Result<(), RuntimeError> {
        let inspect = ["network", "inspect", self.project.as_str()].map(String::from);
        if self.docker(&inspect).await.is_ok() {
            debug!(network = %self.project, "Network exists");
            return Ok(());
        }
        let create = ["network", "create", self.project.as_str()].map(String::from);
        self.docker(&create).await?;
        info!(network = %self.project, "Network created");
        Ok(())
    }

    pub fn container_name(&self, service: &Service) -> String {
        format!("{}-{}", self.project, service.id)
    }

    pub fn volume_name(&self, volume: &Volume) -> String {
        format!("{}_{}", self.project, volume.id)
    }

    pub fn run_args(&self, service: &Service, volumes: &[Volume]) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.container_name(service),
            "--network".to_string(),
            self.project.clone(),
            "--network-alias".to_string(),
            service.id.to_string(),
        ];
        for port in &service.ports {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        for (key, value) in &service.environment {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for volume in volumes {
            args.push("-v".to_string());
            args.push(format!("{}:{}", self.volume_name(volume), volume.mount_path));
        }
        args.push(service.image.clone());
        args
    }

    pub fn stop_args(handle: &ContainerHandle, timeout: Duration) -> Vec<String> {
        vec![
            "stop".to_string(),
            "-t".to_string(),
            timeout.as_secs().to_string(),
            handle.id.clone(),
        ]
    }

    async fn docker(&self, args: &[String]) -> Result<String, RuntimeError> {
        debug!(binary = %self.binary, ?args, "Running");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => {
                    RuntimeError::Unavailable(format!("{} not found on PATH", self.binary))
                }
                _ => RuntimeError::Command(err.to_string()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let subcommand = args.first().map(String::as_str).unwrap_or_default();
            return Err(RuntimeError::Command(format!(
                "{} {subcommand} exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Maps `docker inspect` output to a probe result.
pub fn parse_probe(status: &str) -> ProbeStatus {
    match status.trim() {
        "healthy" | "running" => ProbeStatus::Ready,
        "starting" | "created" | "restarting" => ProbeStatus::NotReady,
        other => ProbeStatus::Errored(format!("container is {other}")),
    }
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    async fn start(
        &self,
        service: &Service,
        volumes: &[Volume],
    ) -> Result<ContainerHandle, RuntimeError> {
        // A container left over from an earlier run would block the name.
        let name = self.container_name(service);
        let stale = ["rm", "-f", name.as_str()].map(String::from);
        if let Err(err) = self.docker(&stale).await {
            debug!(service = %service.id, error = %err, "No stale container removed");
        }

        let id = self
            .docker(&self.run_args(service, volumes))
            .await
            .map_err(|err| match err {
                RuntimeError::Command(message) => RuntimeError::Start(message),
                other => other,
            })?;
        Ok(ContainerHandle::new(service.id.clone(), id))
    }

    async fn stop(&self, handle: &ContainerHandle, timeout: Duration) -> Result<(), RuntimeError> {
        self.docker(&Self::stop_args(handle, timeout))
            .await
            .map_err(|err| RuntimeError::Stop(err.to_string()))?;
        let remove = ["rm", handle.id.as_str()].map(String::from);
        self.docker(&remove).await?;
        Ok(())
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let kill = ["kill", handle.id.as_str()].map(String::from);
        if let Err(err) = self.docker(&kill).await {
            warn!(container = %handle, error = %err, "Kill failed, removing anyway");
        }
        let remove = ["rm", "-f", handle.id.as_str()].map(String::from);
        self.docker(&remove).await?;
        Ok(())
    }

    async fn probe(&self, handle: &ContainerHandle) -> ProbeStatus {
        let inspect = ["inspect", "--format", STATUS_FORMAT, handle.id.as_str()].map(String::from);
        match self.docker(&inspect).await {
            Ok(status) => parse_probe(&status),
            Err(err) => ProbeStatus::Errored(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bot() -> Service {
        Service::new("bot", "registry.local/bot:latest")
            .with_port(8000, 80)
            .with_env("DATABASE_HOST", "db")
            .with_env("API_TOKEN", "secret")
    }

    #[test]
    fn run_args_carry_ports_env_and_volumes() {
        let runtime = DockerCliRuntime::new("shop");
        let volumes = [Volume::new("cache", "/var/cache/bot")];

        let args = runtime.run_args(&bot(), &volumes);

        assert_eq!(
            args,
            [
                "run",
                "-d",
                "--name",
                "shop-bot",
                "--network",
                "shop",
                "--network-alias",
                "bot",
                "-p",
                "8000:80",
                "-e",
                "API_TOKEN=secret",
                "-e",
                "DATABASE_HOST=db",
                "-v",
                "shop_cache:/var/cache/bot",
                "registry.local/bot:latest",
            ]
        );
    }

    #[test]
    fn stop_args_use_whole_seconds() {
        let handle = ContainerHandle::new("db".into(), "abc123");
        let args = DockerCliRuntime::stop_args(&handle, Duration::from_millis(10_500));
        assert_eq!(args, ["stop", "-t", "10", "abc123"]);
    }

    #[test]
    fn probe_status_mapping() {
        assert_eq!(parse_probe("healthy\n"), ProbeStatus::Ready);
        assert_eq!(parse_probe("running"), ProbeStatus::Ready);
        assert_eq!(parse_probe("starting"), ProbeStatus::NotReady);
        assert_eq!(
            parse_probe("unhealthy"),
            ProbeStatus::Errored("container is unhealthy".into())
        );
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let runtime = DockerCliRuntime::with_binary("definitely-not-a-docker-binary", "shop");

        let err = runtime.start(&bot(), &[]).await.unwrap_err();

        assert!(matches!(err, RuntimeError::Unavailable(_)), "got {err}");
        assert!(matches!(
            runtime.probe(&ContainerHandle::new("bot".into(), "x")).await,
            ProbeStatus::Errored(_)
        ));
    }
}
