//! Config command - Inspect DriveSnap configuration
//!
//! Provides the `drivesnap config` CLI command which:
//! 1. Shows the effective configuration (YAML or JSON)
//! 2. Validates the configuration file and reports errors
//! 3. Prints the configuration file location

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use drivesnap_core::config::{Config, ValidationError};
use tracing::info;

use crate::output::{get_formatter, plural, OutputFormat};

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display the effective configuration
    Show,
    /// Validate the configuration file
    Validate,
    /// Print the configuration file path
    Path,
}

impl ConfigCommand {
    /// Execute the config command against the file at `config_path`
    pub async fn execute(&self, format: OutputFormat, config_path: &Path) -> Result<()> {
        match self {
            ConfigCommand::Show => execute_show(format, config_path),
            ConfigCommand::Validate => execute_validate(format, config_path),
            ConfigCommand::Path => execute_path(format, config_path),
        }
    }
}

fn execute_show(format: OutputFormat, config_path: &Path) -> Result<()> {
    let formatter = get_formatter(format);
    let config = Config::load_or_default(config_path);

    info!(config_path = %config_path.display(), "Showing configuration");

    if format.is_json() {
        let json =
            serde_json::to_value(&config).context("Failed to serialize configuration to JSON")?;
        formatter.print_json(&json);
        return Ok(());
    }

    formatter.success(&format!("Configuration ({})", config_path.display()));
    formatter.info("");

    let yaml =
        serde_yaml::to_string(&config).context("Failed to serialize configuration to YAML")?;
    for line in yaml.lines() {
        formatter.info(line);
    }

    Ok(())
}

/// Outcome of validating a configuration file
#[derive(Debug, PartialEq)]
enum Validation {
    Missing,
    Unparsable(String),
    Checked(Vec<ValidationError>),
}

fn validate_file(config_path: &Path) -> Validation {
    if !config_path.exists() {
        return Validation::Missing;
    }

    match Config::load(config_path) {
        Ok(config) => Validation::Checked(config.validate()),
        Err(e) => Validation::Unparsable(e.to_string()),
    }
}

fn execute_validate(format: OutputFormat, config_path: &Path) -> Result<()> {
    let formatter = get_formatter(format);

    info!(config_path = %config_path.display(), "Validating configuration");

    let validation = validate_file(config_path);

    if format.is_json() {
        let (valid, errors) = match &validation {
            Validation::Missing => (
                true,
                vec!["Configuration file not found. Using defaults.".to_string()],
            ),
            Validation::Unparsable(e) => {
                (false, vec![format!("Failed to parse configuration: {e}")])
            }
            Validation::Checked(errors) => {
                (errors.is_empty(), errors.iter().map(ToString::to_string).collect())
            }
        };
        formatter.print_json(&serde_json::json!({
            "valid": valid,
            "config_path": config_path.display().to_string(),
            "errors": errors,
        }));
        return Ok(());
    }

    match validation {
        Validation::Missing => {
            formatter.info(&format!(
                "Configuration file not found at {}",
                config_path.display()
            ));
            formatter.info("Using default configuration.");
        }
        Validation::Unparsable(e) => {
            formatter.error(&format!("Failed to parse configuration: {e}"));
            formatter.info(&format!("File: {}", config_path.display()));
        }
        Validation::Checked(errors) if errors.is_empty() => {
            formatter.success("Configuration is valid");
            formatter.info(&format!("File: {}", config_path.display()));
        }
        Validation::Checked(errors) => {
            formatter.error(&format!("Configuration has {}:", plural(errors.len(), "error")));
            formatter.info(&format!("File: {}", config_path.display()));
            formatter.info("");
            for error in &errors {
                formatter.info(&format!("  {} - {}", error.field, error.message));
            }
        }
    }

    Ok(())
}

fn execute_path(format: OutputFormat, config_path: &Path) -> Result<()> {
    let formatter = get_formatter(format);

    if format.is_json() {
        formatter.print_json(&serde_json::json!({
            "config_path": config_path.display().to_string(),
            "exists": config_path.exists(),
        }));
    } else {
        formatter.info(&config_path.display().to_string());
    }

    Ok(())
}
