use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "stackup")]
#[command(about = "Start a set of dependent containers in order and keep them running", long_about = None)]
pub struct Cli {
    /// Deployment file
    #[arg(short, long, default_value = "stackup.toml")]
    pub file: PathBuf,

    /// Prefix for container, volume and network names
    #[arg(short, long, default_value = "stackup")]
    pub project: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Validate the deployment file and print start and stop order
    Plan,
    /// Start every service, wait for Ctrl-C, then stop them in reverse order
    Up,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["stackup", "plan"]).unwrap();
        assert_eq!(cli.file, PathBuf::from("stackup.toml"));
        assert_eq!(cli.project, "stackup");
        assert_eq!(cli.command, Commands::Plan);
    }

    #[test]
    fn file_and_project_flags() {
        let cli = Cli::try_parse_from(["stackup", "-f", "deploy/prod.toml", "--project", "shop", "up"])
            .unwrap();
        assert_eq!(cli.file, PathBuf::from("deploy/prod.toml"));
        assert_eq!(cli.project, "shop");
        assert_eq!(cli.command, Commands::Up);
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["stackup"]).is_err());
    }
}
