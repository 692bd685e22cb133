//! Configuration CLI commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

use crate::cli::output::{output, CommandOutput};
use crate::domain::models::{Config, RunnerKind};
use crate::infrastructure::config::ConfigLoader;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Load and validate the configuration
    Validate {
        /// Config file to check instead of .sluice/
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the effective configuration after all overrides
    Show {
        /// Config file to read instead of .sluice/
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// Load from an explicit file when given, otherwise from the project layers.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

#[derive(Debug, serde::Serialize)]
struct ValidateOutput {
    valid: bool,
    controller_version: String,
    selectors: usize,
    whitelisted_stores: Vec<String>,
    runner: String,
}

impl CommandOutput for ValidateOutput {
    fn to_human(&self) -> String {
        let stores = if self.whitelisted_stores.is_empty() {
            "none (no jobs will be started)".to_string()
        } else {
            self.whitelisted_stores.join(", ")
        };
        [
            "Configuration is valid.".to_string(),
            format!("Controller version: {}", self.controller_version),
            format!("Feature set selectors: {}", self.selectors),
            format!("Whitelisted stores: {stores}"),
            format!("Runner: {}", self.runner),
        ]
        .join("\n")
    }
}

#[derive(Debug, serde::Serialize)]
struct ShowOutput {
    config: Config,
}

impl CommandOutput for ShowOutput {
    fn to_human(&self) -> String {
        serde_yaml::to_string(&self.config).unwrap_or_default()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }
}

pub async fn execute(args: ConfigArgs, json_mode: bool) -> Result<()> {
    match args.command {
        ConfigCommands::Validate { config } => {
            let config = load_config(config.as_deref())?;
            output(
                &ValidateOutput {
                    valid: true,
                    controller_version: config.controller.version.clone(),
                    selectors: config.controller.feature_set_selectors.len(),
                    whitelisted_stores: config.controller.whitelisted_stores.clone(),
                    runner: match config.job_manager.runner {
                        RunnerKind::Process => "process",
                        RunnerKind::InMemory => "in_memory",
                    }
                    .to_string(),
                },
                json_mode,
            );
        }
        ConfigCommands::Show { config } => {
            let config = load_config(config.as_deref())?;
            output(&ShowOutput { config }, json_mode);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_output_flags_empty_allow_list() {
        let out = ValidateOutput {
            valid: true,
            controller_version: "1.0.0".to_string(),
            selectors: 0,
            whitelisted_stores: vec![],
            runner: "in_memory".to_string(),
        };
        assert!(out.to_human().contains("none (no jobs will be started)"));
    }

    #[test]
    fn test_show_output_is_yaml() {
        let out = ShowOutput {
            config: Config::default(),
        };
        let human = out.to_human();
        assert!(human.contains("controller:"));
        assert!(human.contains("polling_interval_ms: 1000"));
        assert_eq!(out.to_json()["catalog"]["url"], "http://localhost:6565");
    }
}
