//! DriveSnap CLI - Command-line interface for DriveSnap
//!
//! Provides commands for:
//! - Planning a backup from a recorded or live delta feed
//! - Inspecting and validating configuration

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drivesnap_core::config::{Config, LoggingConfig};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;
mod replay;

use commands::{config::ConfigCommand, plan::PlanCommand};
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "drivesnap", version, about = "Incremental OneDrive and SharePoint backups")]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Compute the collections of a backup
    Plan(PlanCommand),
    /// View and validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

/// Level used when `RUST_LOG` is unset: `-v` flags win over the config file.
fn log_level(verbose: u8, logging: &LoggingConfig) -> &str {
    match verbose {
        0 => logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    }
}

fn init_tracing(verbose: u8, logging: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level(verbose, logging)));

    // Logs go to stderr so JSON output on stdout stays parseable.
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => Config::load_or_default(&config_path),
    };

    init_tracing(cli.verbose, &config.logging);

    let format = OutputFormat::from_json_flag(cli.json);

    match cli.command {
        Commands::Plan(cmd) => cmd.execute(format, &config).await,
        Commands::Config(cmd) => cmd.execute(format, &config_path).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_log_level_prefers_verbose_flag() {
        let logging = LoggingConfig {
            level: "warn".to_string(),
            json: false,
        };
        assert_eq!(log_level(0, &logging), "warn");
        assert_eq!(log_level(1, &logging), "debug");
        assert_eq!(log_level(3, &logging), "trace");
    }

    #[test]
    fn test_plan_requires_a_feed() {
        let parsed = Cli::try_parse_from(["drivesnap", "plan", "--tenant", "t", "--owner", "u"]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from([
            "drivesnap", "plan", "--tenant", "t", "--owner", "u", "--input", "rec.json",
            "--access-token", "x",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_parse_plan() {
        let cli = Cli::try_parse_from([
            "drivesnap",
            "--json",
            "plan",
            "--input",
            "rec.json",
            "--tenant",
            "t",
            "--owner",
            "u",
            "--service",
            "sharepoint",
            "--select",
            "Documents",
            "--select",
            "Pictures/*",
        ])
        .unwrap();

        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Plan(_)));
    }

    #[test]
    fn test_parse_config_path() {
        let cli = Cli::try_parse_from(["drivesnap", "config", "path", "--config", "/tmp/c.yaml"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.yaml")));
        assert!(matches!(cli.command, Commands::Config(ConfigCommand::Path)));
    }
}
