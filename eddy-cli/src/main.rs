//! Eddy CLI - Command-line interface
//!
//! Runs the playback server and exposes decision, hashing and cleanup
//! operations for scripting and debugging.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use eddy_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "eddy")]
#[command(about = "A transcoding media playback server")]
struct Cli {
    /// Console log level; RUST_LOG overrides it
    #[arg(long, global = true, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Also trace the whole run to a file in this directory
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level, cli.logs_dir.as_deref())?;

    commands::handle_command(cli.command).await
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_flags_parse() {
        let cli = Cli::try_parse_from([
            "eddy",
            "--log-level",
            "debug",
            "serve",
            "--bind",
            "0.0.0.0:8080",
            "--max-concurrent",
            "4",
        ])
        .unwrap();
        assert_eq!(cli.log_level, CliLogLevel::Debug);
        assert!(matches!(
            cli.command,
            commands::Commands::Serve {
                max_concurrent: Some(4),
                ..
            }
        ));
    }
}
