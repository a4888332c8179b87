//! tubeworks - workers and administration for beanstalkd tubes
//!
//! # Usage
//!
//! ```bash
//! # Process jobs from every tube mapped onto the default server
//! tubeworks --config tubes.toml run --item-limit 100
//!
//! # Delete every job of a tube
//! tubeworks drain emails
//!
//! # Look at the next buried job
//! tubeworks peek buried --tube emails
//!
//! # Check that all servers answer
//! tubeworks status
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{Context, drain, inspect, run, servers};

/// Workers and administration for beanstalkd tubes.
#[derive(Parser)]
#[command(name = "tubeworks", version, about = "Tube workers for beanstalkd")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Settings file (TOML)
    #[arg(short, long, env = "TUBEWORKS_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process jobs from the tubes of a server
    #[command(name = "run")]
    Run(run::RunArgs),

    /// Delete every job of a managed tube
    #[command(name = "drain")]
    Drain(drain::DrainArgs),

    /// Show the next job in a state
    #[command(name = "peek")]
    Peek(inspect::PeekArgs),

    /// Show server, tube or job statistics
    #[command(name = "stats")]
    Stats(inspect::StatsArgs),

    /// Move buried, then delayed, jobs back to ready
    #[command(name = "kick")]
    Kick(inspect::KickArgs),

    /// List the tubes of a server
    #[command(name = "tubes")]
    Tubes(inspect::TubesArgs),

    /// List configured servers
    #[command(name = "servers")]
    Servers,

    /// Check that every server answers
    #[command(name = "status")]
    Status,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let ctx = Context::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => run::run(&ctx, args).await,
        Commands::Drain(args) => drain::run(&ctx, args).await.map(|()| ExitCode::SUCCESS),
        Commands::Peek(args) => inspect::peek(&ctx, args).await.map(|()| ExitCode::SUCCESS),
        Commands::Stats(args) => inspect::stats(&ctx, args).await.map(|()| ExitCode::SUCCESS),
        Commands::Kick(args) => inspect::kick(&ctx, args).await.map(|()| ExitCode::SUCCESS),
        Commands::Tubes(args) => inspect::tubes(&ctx, args).await.map(|()| ExitCode::SUCCESS),
        Commands::Servers => servers::list(&ctx).map(|()| ExitCode::SUCCESS),
        Commands::Status => servers::status(&ctx).await,
    }
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "tubeworks", "-vv", "run", "reports", "--item-limit", "5", "--workers", "2",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Run(_)));

        assert!(Cli::try_parse_from(["tubeworks", "peek", "reserved", "--tube", "x"]).is_err());
        assert!(Cli::try_parse_from(["tubeworks", "peek", "buried", "--tube", "x"]).is_ok());
    }
}
