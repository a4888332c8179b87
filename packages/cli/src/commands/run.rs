//! Run command - process jobs from the tubes of a server
//!
//! Usage:
//! ```bash
//! tubeworks run
//! tubeworks run reports --item-limit 500 --workers 4
//! tubeworks run --time-limit 300
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Args;
use comfy_table::Cell;
use tube_core::DEFAULT_SERVER_ALIAS;
use worker::{HandlerRegistry, RunLimits, RunReport, Worker, WorkerPool, builtin_handler};

use super::{Context, new_table};

/// Arguments for the run command
#[derive(Args)]
pub struct RunArgs {
    /// Server alias whose tubes are processed
    #[arg(default_value = DEFAULT_SERVER_ALIAS)]
    alias: String,

    /// Stop after this many seconds
    #[arg(long)]
    time_limit: Option<u64>,

    /// Stop after this many jobs per worker
    #[arg(long)]
    item_limit: Option<u64>,

    /// Concurrent workers, each on its own connection
    #[arg(long, default_value_t = 1)]
    workers: usize,
}

impl RunArgs {
    fn limits(&self) -> RunLimits {
        let mut limits = RunLimits::unbounded();
        if let Some(secs) = self.time_limit {
            limits = limits.with_time_limit(Duration::from_secs(secs));
        }
        if let Some(items) = self.item_limit {
            limits = limits.with_item_limit(items);
        }
        limits
    }
}

/// Run the workers. Fails when a tube was suspended or a worker lost its
/// connection.
pub async fn run(ctx: &Context, args: RunArgs) -> Result<ExitCode> {
    if args.workers == 0 {
        bail!("--workers must be at least 1");
    }

    let registry = Arc::new(build_registry(ctx, &args.alias));
    if registry.is_empty() {
        bail!("No tube mapped onto server '{}' has a handler", args.alias);
    }

    let mut workers = Vec::with_capacity(args.workers);
    for _ in 0..args.workers {
        let mut worker = Worker::new(ctx.connect(&args.alias).await?, Arc::clone(&registry));
        for queue in ctx.settings.tubes_for_server(&args.alias) {
            let tube = ctx.tube(&queue);
            if registry.has_handler(&tube) {
                worker = worker.with_tube(tube, ctx.settings.tube_options(&queue))?;
            }
        }
        workers.push(worker);
    }

    let stops: Vec<_> = workers.iter().map(Worker::stop_handle).collect();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping after the current jobs");
            for stop in &stops {
                stop.stop();
            }
        }
    });

    let pool = WorkerPool::spawn(workers).await?;
    let outcomes = pool.run(args.limits()).await;
    pool.shutdown().await;

    let mut total = RunReport::default();
    let mut failures = 0;
    for outcome in outcomes {
        match outcome {
            Ok(report) => total.merge(report),
            Err(e) => {
                failures += 1;
                eprintln!("Worker failed: {}", e);
            }
        }
    }

    print_report(&total);

    if failures > 0 || total.is_partial() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Handlers named in the tube options of every queue on the server.
fn build_registry(ctx: &Context, alias: &str) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for queue in ctx.settings.tubes_for_server(alias) {
        let tube = ctx.tube(&queue);
        match ctx.settings.tube_options(&queue).handler {
            Some(name) => match builtin_handler(&name) {
                Some(handler) => registry.register_arc(tube, handler),
                None => tracing::warn!(tube = %tube, "Unknown handler '{}', not watching", name),
            },
            None => tracing::warn!(tube = %tube, "No handler configured, not watching"),
        }
    }
    registry
}

fn print_report(report: &RunReport) {
    let mut table = new_table(&["Outcome", "Jobs"]);
    let rows = [
        ("processed", report.processed),
        ("succeeded", report.succeeded),
        ("released", report.released),
        ("buried", report.buried),
        ("discarded", report.discarded),
        ("vanished", report.vanished),
    ];
    for (label, count) in rows {
        table.add_row(vec![Cell::new(label), Cell::new(count)]);
    }
    println!("{table}");

    if report.is_partial() {
        let tubes: Vec<&str> = report.suspended_tubes.iter().map(String::as_str).collect();
        println!("Suspended tubes: {}", tubes.join(", "));
    }
    if report.stopped {
        println!("Stopped before the limits were reached");
    }
}
