//! # stackup
//!
//! Runs a deployment file against the local Docker daemon.
//!
//! ```bash
//! stackup plan                       # validate and print the order
//! RUST_LOG=info stackup up           # start, wait for Ctrl-C, stop
//! stackup -f deploy/prod.toml -p shop up
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use stackup::tracing::setup_tracing;
use stackup_sample::cli::{Cli, Commands};
use stackup_sample::{Deployment, DockerCliRuntime, UpOutcome};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    let runtime = DockerCliRuntime::new(cli.project.clone());
    let deployment = Deployment::load(&cli.file, Arc::new(runtime.clone()))
        .with_context(|| format!("Failed to load {}", cli.file.display()))?;

    match cli.command {
        Commands::Plan => {
            let (start, stop) = deployment.plan()?;
            let names = |ids: &[stackup::ServiceId]| {
                ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(" -> ")
            };
            println!("start: {}", names(&start));
            println!("stop:  {}", names(&stop));
            for service in deployment.topology().services() {
                let ports: Vec<String> = service.ports.iter().map(ToString::to_string).collect();
                let volumes: Vec<String> = deployment
                    .topology()
                    .volumes_of(&service.id)
                    .map(|v| format!("{}:{}", v.id, v.mount_path))
                    .collect();
                println!(
                    "  {:<16} {:<32} ports=[{}] volumes=[{}]",
                    service.id.as_str(),
                    service.image,
                    ports.join(", "),
                    volumes.join(", ")
                );
            }
        }
        Commands::Up => {
            runtime
                .ensure_network()
                .await
                .context("Failed to prepare the project network")?;

            let interrupt = async {
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            let report = match deployment.up_until(interrupt).await {
                UpOutcome::Finished(report) => report,
                UpOutcome::Interrupted(report) => {
                    print!("{report}");
                    return Ok(());
                }
            };
            print!("{report}");

            if !report.all_ready() {
                let failed = report.failures().count();
                print!("{}", deployment.shutdown().await);
                bail!("{failed} service(s) did not become ready");
            }

            info!("All services ready, press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;

            info!("Shutting down");
            print!("{}", deployment.shutdown().await);
        }
    }

    Ok(())
}
