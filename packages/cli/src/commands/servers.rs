//! Servers and status commands
//!
//! Usage:
//! ```bash
//! tubeworks servers
//! tubeworks status
//! ```

use std::process::ExitCode;

use anyhow::Result;
use comfy_table::{Cell, Color};

use super::{Context, new_table};

/// List configured servers and the tubes mapped onto them
pub fn list(ctx: &Context) -> Result<()> {
    let mut table = new_table(&["Alias", "Address", "Tubes"]);
    for (alias, server) in ctx.factory.servers() {
        let tubes: Vec<String> = ctx.factory.tubes_for_server(&alias).into_iter().collect();
        table.add_row(vec![
            Cell::new(&alias).fg(Color::Green),
            Cell::new(server.address()),
            Cell::new(tubes.join(", ")),
        ]);
    }
    println!("{table}");
    Ok(())
}

/// Check that every server answers `stats` with a version
pub async fn status(ctx: &Context) -> Result<ExitCode> {
    let statuses = ctx.factory.check_servers().await;

    let mut table = new_table(&["Alias", "Address", "Status"]);
    for status in &statuses {
        let cell = match &status.version {
            Ok(version) => Cell::new(format!("ok ({})", version)).fg(Color::Green),
            Err(e) => Cell::new(e).fg(Color::Red),
        };
        table.add_row(vec![Cell::new(&status.alias), Cell::new(&status.address), cell]);
    }
    println!("{table}");

    if statuses.iter().all(|status| status.is_ok()) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
