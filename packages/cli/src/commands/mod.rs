//! Subcommands and what they share.

pub mod drain;
pub mod inspect;
pub mod run;
pub mod servers;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use client::{Beanstalkd, ServerFactory};
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use tube_core::{Settings, Stats};

/// Settings and connections, built once per invocation.
pub struct Context {
    pub settings: Arc<Settings>,
    pub factory: ServerFactory,
}

impl Context {
    /// Load settings from `path`, or use the defaults (one server on
    /// localhost:11300, no tubes).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => Settings::load(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => Settings::default(),
        };
        let settings = Arc::new(settings);
        let factory = ServerFactory::new(Arc::clone(&settings));
        Ok(Self { settings, factory })
    }

    /// Tube name of a queue.
    pub fn tube(&self, queue: &str) -> String {
        self.settings.tube_name(queue)
    }

    /// Every tube named in the settings, prefixed.
    pub fn managed_tubes(&self) -> BTreeSet<String> {
        self.settings
            .known_tubes()
            .iter()
            .map(|queue| self.settings.tube_name(queue))
            .collect()
    }

    /// Connect to the server a queue is mapped onto.
    pub async fn connect_for_queue(&self, queue: &str) -> Result<Beanstalkd> {
        let alias = self.settings.server_alias_for(queue);
        self.factory
            .connect_for_tube(queue)
            .await
            .with_context(|| format!("Failed to connect to server '{}'", alias))
    }

    pub async fn connect(&self, alias: &str) -> Result<Beanstalkd> {
        self.factory
            .connect(alias)
            .await
            .with_context(|| format!("Failed to connect to server '{}'", alias))
    }
}

/// Table with the shared look and a cyan header.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(headers.iter().map(|h| Cell::new(h).fg(Color::Cyan)));
    table
}

/// Two-column rendering of engine statistics.
pub fn stats_table(stats: &Stats) -> Table {
    let mut table = new_table(&["Statistic", "Value"]);
    for (key, value) in stats.iter() {
        table.add_row(vec![Cell::new(key).fg(Color::Green), Cell::new(value)]);
    }
    table
}
