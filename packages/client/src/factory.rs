//! Connections by server alias.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tube_core::{ServerConfig, Settings, StatsScope};

use crate::{Beanstalkd, JobQueue, QueueError};

/// Outcome of probing one server.
#[derive(Debug)]
pub struct ServerStatus {
    pub alias: String,
    pub address: String,
    /// Server version, or why it could not be read.
    pub version: Result<String, QueueError>,
}

impl ServerStatus {
    pub fn is_ok(&self) -> bool {
        self.version.is_ok()
    }
}

/// Opens beanstalkd connections for server aliases and tubes.
#[derive(Debug, Clone)]
pub struct ServerFactory {
    settings: Arc<Settings>,
}

impl ServerFactory {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// All server definitions, including the default one.
    pub fn servers(&self) -> BTreeMap<String, ServerConfig> {
        self.settings.servers()
    }

    /// Tubes mapped onto a server alias.
    pub fn tubes_for_server(&self, alias: &str) -> BTreeSet<String> {
        self.settings
            .tubes_for_server(alias)
            .into_iter()
            .map(|tube| self.settings.tube_name(&tube))
            .collect()
    }

    /// Connect to the server behind an alias.
    pub async fn connect(&self, alias: &str) -> Result<Beanstalkd, QueueError> {
        Beanstalkd::connect(&self.settings.server(alias)).await
    }

    /// Connect to the server a tube is mapped onto.
    pub async fn connect_for_tube(&self, tube: &str) -> Result<Beanstalkd, QueueError> {
        self.connect(self.settings.server_alias_for(tube)).await
    }

    /// Check that every server answers `stats` with a version.
    pub async fn check_servers(&self) -> Vec<ServerStatus> {
        let mut statuses = Vec::new();
        for (alias, server) in self.servers() {
            let version = server_version(&server).await;
            if let Err(e) = &version {
                tracing::warn!(alias = %alias, address = %server.address(), "Server check failed: {}", e);
            }
            statuses.push(ServerStatus {
                alias,
                address: server.address(),
                version,
            });
        }
        statuses
    }
}

async fn server_version(server: &ServerConfig) -> Result<String, QueueError> {
    let mut conn = Beanstalkd::connect(server).await?;
    let stats = conn.stats(&StatsScope::Global).await?;
    stats
        .version()
        .ok_or_else(|| QueueError::Protocol("stats without a version".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn checks_every_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut line = String::new();
            BufReader::new(read).read_line(&mut line).await.unwrap();
            write
                .write_all(b"OK 20\r\n---\nversion: \"1.13\"\n\r\n")
                .await
                .unwrap();
        });

        // Bind and drop a listener to get a port nobody answers on.
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);

        let settings = Settings::default()
            .with_server("default", ServerConfig::new("127.0.0.1", port))
            .with_server("down", ServerConfig::new("127.0.0.1", closed_port));
        let factory = ServerFactory::new(Arc::new(settings));

        let statuses = factory.check_servers().await;
        assert_eq!(statuses.len(), 2);

        let default = statuses.iter().find(|s| s.alias == "default").unwrap();
        assert_eq!(default.version.as_ref().unwrap(), "1.13");
        let down = statuses.iter().find(|s| s.alias == "down").unwrap();
        assert!(!down.is_ok());
    }

    #[test]
    fn tube_names_carry_the_prefix() {
        let mut settings = Settings::default().with_mapping("thumbs", "bulk");
        settings.prefix = "site_".into();
        let factory = ServerFactory::new(Arc::new(settings));

        let tubes: Vec<_> = factory.tubes_for_server("bulk").into_iter().collect();
        assert_eq!(tubes, vec!["site_thumbs"]);
        assert!(factory.tubes_for_server("default").is_empty());
        assert!(factory.servers().contains_key("default"));
    }
}
