//! Command-line interface.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

use commands::config::ConfigArgs;
use commands::jobs::JobsArgs;
use commands::serve::ServeArgs;

#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(about = "Sluice - feature ingestion job controller", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller daemon and operator API
    Serve(ServeArgs),
    /// Inspect and restart ingestion jobs through a running controller
    Jobs(JobsArgs),
    /// Configuration commands
    Config(ConfigArgs),
}

/// Print an error and exit non-zero.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let body = serde_json::json!({
            "success": false,
            "error": format!("{err:#}"),
        });
        eprintln!("{body}");
    } else {
        eprintln!("Error: {err:#}");
    }
    std::process::exit(1);
}
