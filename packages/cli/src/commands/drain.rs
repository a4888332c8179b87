//! Drain command - delete every job of a managed tube
//!
//! Usage:
//! ```bash
//! tubeworks drain emails
//! tubeworks drain emails --grace 30
//! ```

use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Args;
use worker::{DrainConfig, TubeDrainer};

use super::Context;

/// Arguments for the drain command
#[derive(Args)]
pub struct DrainArgs {
    /// Queue name, without the tube prefix
    queue: String,

    /// Seconds the tube stays paused while it is drained
    #[arg(long, default_value_t = 10)]
    grace: u64,

    /// Passes over all job states before giving up
    #[arg(long, default_value_t = 10)]
    max_passes: u32,
}

/// Run the drain command
pub async fn run(ctx: &Context, args: DrainArgs) -> Result<()> {
    let tube = ctx.tube(&args.queue);
    let conn = ctx.connect_for_queue(&args.queue).await?;

    let config = DrainConfig {
        grace: Duration::from_secs(args.grace),
        max_passes: args.max_passes,
        ..Default::default()
    };
    let mut drainer = TubeDrainer::new(conn, ctx.managed_tubes()).with_config(config);
    let report = drainer
        .drain(&tube)
        .await
        .with_context(|| format!("Failed to drain tube '{}'", tube))?;

    if report.skipped {
        println!("Tube '{}' is not in the settings, left alone", tube);
    } else {
        println!(
            "Deleted {} jobs from '{}' in {} passes",
            report.deleted, tube, report.passes
        );
    }
    Ok(())
}
