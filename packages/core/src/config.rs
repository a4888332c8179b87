//! Settings: servers, tube to server mappings and per-tube options.
//!
//! Settings are loaded once at startup and shared read-only afterwards.
//!
//! ```toml
//! prefix = "site1_"
//!
//! [servers.default]
//! host = "127.0.0.1"
//! port = 11300
//!
//! [servers.bulk]
//! host = "10.0.0.5"
//!
//! [mappings]
//! thumbnails = "bulk"
//!
//! [defaults]
//! max_retries = 3
//!
//! [tubes.mail]
//! max_retries = 5
//! release_delay_secs = 30
//! handler = "log"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{DEFAULT_DELAY, DEFAULT_PRIORITY, DEFAULT_TTR, PutOptions};

/// Alias of the server used when nothing else is mapped.
pub const DEFAULT_SERVER_ALIAS: &str = "default";

/// Default beanstalkd port.
pub const DEFAULT_PORT: u16 = 11300;

/// Longest tube name beanstalkd accepts, in bytes.
pub const MAX_TUBE_NAME_LEN: usize = 200;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read settings from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid tube name: {0:?}")]
    InvalidTubeName(String),
    #[error("Invalid server {alias}: {reason}")]
    InvalidServer { alias: String, reason: String },
}

/// Check a tube name against beanstalkd's naming rules.
pub fn validate_tube_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_TUBE_NAME_LEN
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-+/;.$_()".contains(c));

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidTubeName(name.to_string()))
    }
}

/// Connection parameters for one beanstalkd server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            connect_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Submission and retry options for a tube.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TubeOptions {
    /// Priority for new jobs.
    pub priority: u32,
    /// Delay for new jobs, in seconds.
    pub delay_secs: u64,
    /// Time-to-run for new jobs, in seconds.
    pub ttr_secs: u64,
    /// Priority given to a job released after a failure.
    pub release_priority: u32,
    /// Delay given to a job released after a failure, in seconds.
    pub release_delay_secs: u64,
    /// Releases allowed before a failing job is buried.
    pub max_retries: u32,
    /// Run the handler in its own task, isolating panics.
    pub fork: bool,
    /// Name of a built-in handler to attach to the tube.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
}

impl Default for TubeOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            delay_secs: DEFAULT_DELAY as u64,
            ttr_secs: DEFAULT_TTR as u64,
            release_priority: DEFAULT_PRIORITY,
            release_delay_secs: DEFAULT_DELAY as u64,
            max_retries: 3,
            fork: false,
            handler: None,
        }
    }
}

impl TubeOptions {
    pub fn release_delay(&self) -> Duration {
        Duration::from_secs(self.release_delay_secs)
    }

    /// Options for putting a new job in this tube.
    pub fn put_options(&self) -> PutOptions {
        PutOptions::default()
            .with_priority(self.priority)
            .with_delay(Duration::from_secs(self.delay_secs))
            .with_ttr(Duration::from_secs(self.ttr_secs))
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_release(mut self, priority: u32, delay_secs: u64) -> Self {
        self.release_priority = priority;
        self.release_delay_secs = delay_secs;
        self
    }

    pub fn with_fork(mut self, fork: bool) -> Self {
        self.fork = fork;
        self
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }
}

/// Per-tube overrides; anything left out falls back to `Settings::defaults`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TubeOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttr_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_priority: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_delay_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
}

impl TubeOverrides {
    /// Resolve against a base set of options.
    pub fn apply(&self, base: &TubeOptions) -> TubeOptions {
        TubeOptions {
            priority: self.priority.unwrap_or(base.priority),
            delay_secs: self.delay_secs.unwrap_or(base.delay_secs),
            ttr_secs: self.ttr_secs.unwrap_or(base.ttr_secs),
            release_priority: self.release_priority.unwrap_or(base.release_priority),
            release_delay_secs: self.release_delay_secs.unwrap_or(base.release_delay_secs),
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            fork: self.fork.unwrap_or(base.fork),
            handler: self.handler.clone().or_else(|| base.handler.clone()),
        }
    }
}

impl From<TubeOptions> for TubeOverrides {
    fn from(options: TubeOptions) -> Self {
        Self {
            priority: Some(options.priority),
            delay_secs: Some(options.delay_secs),
            ttr_secs: Some(options.ttr_secs),
            release_priority: Some(options.release_priority),
            release_delay_secs: Some(options.release_delay_secs),
            max_retries: Some(options.max_retries),
            fork: Some(options.fork),
            handler: options.handler,
        }
    }
}

/// All settings consumed by workers, drainers and the CLI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Prepended to every queue name to form the tube name.
    pub prefix: String,
    /// Server definitions by alias.
    pub servers: BTreeMap<String, ServerConfig>,
    /// Server alias by tube name.
    pub mappings: BTreeMap<String, String>,
    /// Options shared by every tube.
    pub defaults: TubeOptions,
    /// Per-tube overrides.
    pub tubes: BTreeMap<String, TubeOverrides>,
}

impl Settings {
    /// Parse settings from TOML and validate them.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(input)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    /// Check tube names and server definitions.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in self.mappings.keys().chain(self.tubes.keys()) {
            validate_tube_name(&self.tube_name(name))?;
        }
        for (alias, server) in &self.servers {
            if server.host.trim().is_empty() {
                return Err(ConfigError::InvalidServer {
                    alias: alias.clone(),
                    reason: "empty host".into(),
                });
            }
            if server.port == 0 {
                return Err(ConfigError::InvalidServer {
                    alias: alias.clone(),
                    reason: "port 0".into(),
                });
            }
        }
        Ok(())
    }

    /// Add or replace a server definition.
    pub fn with_server(mut self, alias: impl Into<String>, server: ServerConfig) -> Self {
        self.servers.insert(alias.into(), server);
        self
    }

    /// Map a tube onto a server alias.
    pub fn with_mapping(mut self, tube: impl Into<String>, alias: impl Into<String>) -> Self {
        self.mappings.insert(tube.into(), alias.into());
        self
    }

    /// Set the options of a tube.
    pub fn with_tube(mut self, tube: impl Into<String>, options: TubeOptions) -> Self {
        self.tubes.insert(tube.into(), options.into());
        self
    }

    /// Tube name for a queue name, with the configured prefix.
    pub fn tube_name(&self, queue: &str) -> String {
        format!("{}{}", self.prefix, queue)
    }

    /// Resolved options for a tube.
    pub fn tube_options(&self, tube: &str) -> TubeOptions {
        match self.tubes.get(tube) {
            Some(overrides) => overrides.apply(&self.defaults),
            None => self.defaults.clone(),
        }
    }

    /// All server definitions; the default alias is always present.
    pub fn servers(&self) -> BTreeMap<String, ServerConfig> {
        let mut servers = self.servers.clone();
        servers
            .entry(DEFAULT_SERVER_ALIAS.to_string())
            .or_default();
        servers
    }

    /// Definition for an alias. Unknown aliases fall back to the default server.
    pub fn server(&self, alias: &str) -> ServerConfig {
        self.servers
            .get(alias)
            .or_else(|| self.servers.get(DEFAULT_SERVER_ALIAS))
            .cloned()
            .unwrap_or_default()
    }

    /// Alias of the server a tube is mapped to.
    pub fn server_alias_for(&self, tube: &str) -> &str {
        self.mappings
            .get(tube)
            .map(String::as_str)
            .unwrap_or(DEFAULT_SERVER_ALIAS)
    }

    /// Every tube named in the settings.
    pub fn known_tubes(&self) -> BTreeSet<String> {
        self.mappings
            .keys()
            .chain(self.tubes.keys())
            .cloned()
            .collect()
    }

    /// Tubes served by the given server alias.
    pub fn tubes_for_server(&self, alias: &str) -> BTreeSet<String> {
        self.known_tubes()
            .into_iter()
            .filter(|tube| self.server_alias_for(tube) == alias)
            .collect()
    }
}
