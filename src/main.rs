//! Sluice CLI entry point.

use clap::Parser;

use sluice::cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(args) => sluice::cli::commands::serve::execute(args, cli.json).await,
        Commands::Jobs(args) => sluice::cli::commands::jobs::execute(args, cli.json).await,
        Commands::Config(args) => sluice::cli::commands::config::execute(args, cli.json).await,
    };

    if let Err(err) = result {
        sluice::cli::handle_error(err, cli.json);
    }
}
