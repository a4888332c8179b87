//! Commands that look at or nudge jobs: peek, stats, kick, tubes
//!
//! Usage:
//! ```bash
//! tubeworks peek buried --tube emails
//! tubeworks stats server
//! tubeworks stats tube emails
//! tubeworks stats job 42 --server reports
//! tubeworks kick 10 --tube emails
//! tubeworks tubes
//! ```

use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};
use client::{JobQueue, QueueError};
use comfy_table::{Cell, Color};
use tube_core::{DEFAULT_SERVER_ALIAS, JobId, PeekState, StatsScope};

use super::{Context, new_table, stats_table};

/// Arguments for the peek command
#[derive(Args)]
pub struct PeekArgs {
    /// ready, delayed or buried
    state: PeekState,

    /// Queue name, without the tube prefix
    #[arg(long)]
    tube: String,
}

/// Arguments for the stats command
#[derive(Args)]
pub struct StatsArgs {
    #[command(subcommand)]
    scope: StatsCommand,
}

#[derive(Subcommand)]
pub enum StatsCommand {
    /// Statistics of a whole server
    #[command(name = "server")]
    Server {
        #[arg(default_value = DEFAULT_SERVER_ALIAS)]
        alias: String,
    },

    /// Statistics of a tube
    #[command(name = "tube")]
    Tube {
        /// Queue name, without the tube prefix
        queue: String,
    },

    /// Statistics of a job
    #[command(name = "job")]
    Job {
        id: u64,

        #[arg(long, default_value = DEFAULT_SERVER_ALIAS)]
        server: String,
    },
}

/// Arguments for the kick command
#[derive(Args)]
pub struct KickArgs {
    /// Most jobs to kick
    max: u64,

    /// Queue name, without the tube prefix
    #[arg(long)]
    tube: String,
}

/// Arguments for the tubes command
#[derive(Args)]
pub struct TubesArgs {
    #[arg(default_value = DEFAULT_SERVER_ALIAS)]
    alias: String,
}

/// Show the next job of a tube in a state
pub async fn peek(ctx: &Context, args: PeekArgs) -> Result<()> {
    let tube = ctx.tube(&args.tube);
    let mut conn = ctx.connect_for_queue(&args.tube).await?;

    match conn.peek(&tube, args.state).await? {
        Some(job) => {
            let mut table = new_table(&["Job", "Tube", "Payload"]);
            table.add_row(vec![
                Cell::new(job.id).fg(Color::Green),
                Cell::new(&job.tube),
                Cell::new(job.payload_str()),
            ]);
            println!("{table}");
        }
        None => println!("No {} job in '{}'", args.state, tube),
    }
    Ok(())
}

/// Show statistics for a server, tube or job
pub async fn stats(ctx: &Context, args: StatsArgs) -> Result<()> {
    let (mut conn, scope) = match args.scope {
        StatsCommand::Server { alias } => (ctx.connect(&alias).await?, StatsScope::Global),
        StatsCommand::Tube { queue } => {
            let tube = ctx.tube(&queue);
            (ctx.connect_for_queue(&queue).await?, StatsScope::Tube(tube))
        }
        StatsCommand::Job { id, server } => (ctx.connect(&server).await?, StatsScope::Job(JobId(id))),
    };

    let stats = conn
        .stats(&scope)
        .await
        .with_context(|| format!("Failed to read {} statistics", scope))?;
    println!("{}", stats_table(&stats));
    Ok(())
}

/// Kick buried, then delayed, jobs of a tube
pub async fn kick(ctx: &Context, args: KickArgs) -> Result<()> {
    let tube = ctx.tube(&args.tube);
    let mut conn = ctx.connect_for_queue(&args.tube).await?;

    let kicked = conn.kick(&tube, args.max).await?;
    println!("Kicked {} jobs in '{}'", kicked, tube);
    Ok(())
}

/// List the tubes of a server with their job counts
pub async fn tubes(ctx: &Context, args: TubesArgs) -> Result<()> {
    let mut conn = ctx.connect(&args.alias).await?;
    let managed = ctx.factory.tubes_for_server(&args.alias);

    let mut table = new_table(&["Tube", "Managed", "Ready", "Delayed", "Buried", "Reserved"]);
    for tube in conn.list_tubes().await? {
        let stats = match conn.stats(&StatsScope::Tube(tube.clone())).await {
            Ok(stats) => stats,
            // Tubes vanish once nobody watches them and they are empty.
            Err(QueueError::TubeNotFound(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        let count = |key: &str| stats.get_u64(key).unwrap_or_default();
        let managed = if managed.contains(&tube) { "yes" } else { "" };

        table.add_row(vec![
            Cell::new(&tube).fg(Color::Green),
            Cell::new(managed),
            Cell::new(count("current-jobs-ready")),
            Cell::new(count("current-jobs-delayed")),
            Cell::new(count("current-jobs-buried")).fg(Color::Yellow),
            Cell::new(count("current-jobs-reserved")),
        ]);
    }

    println!("{table}");
    Ok(())
}
