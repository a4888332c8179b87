//! Beanstalkd client over the text protocol.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tube_core::{Job, JobId, PeekState, PutOptions, ServerConfig, StatValue, Stats, StatsScope};

use crate::{JobQueue, QueueError, ReserveTimeout, check_tube};

const CRLF: &[u8] = b"\r\n";

/// Largest body accepted from the server.
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Replies followed by a body.
const BODY_REPLIES: [&str; 3] = ["RESERVED ", "FOUND ", "OK "];

/// A connection to a beanstalkd server.
///
/// Beanstalkd tracks the used tube and the watch list per connection, so a
/// `Beanstalkd` must not be shared between workers.
#[derive(Debug)]
pub struct Beanstalkd {
    stream: BufStream<TcpStream>,
    address: String,
    using: String,
    /// A command was sent and its reply not fully read, because the call
    /// was dropped midway. The stream is out of step from then on.
    awaiting_reply: bool,
}

impl Beanstalkd {
    /// Connect to the server described by `config`.
    pub async fn connect(config: &ServerConfig) -> Result<Self, QueueError> {
        let address = config.address();
        let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&address))
            .await
            .map_err(|_| QueueError::ConnectTimeout(address.clone()))??;

        tracing::debug!(address = %address, "Connected to beanstalkd");
        Ok(Self::from_stream(stream, address))
    }

    fn from_stream(stream: TcpStream, address: String) -> Self {
        Self {
            stream: BufStream::new(stream),
            address,
            using: "default".to_string(),
            awaiting_reply: false,
        }
    }

    /// Address this connection was opened to.
    pub fn address(&self) -> &str {
        &self.address
    }

    async fn send(&mut self, command: &str, body: Option<&[u8]>) -> Result<(), QueueError> {
        if self.awaiting_reply {
            return Err(QueueError::Protocol(
                "reply to an abandoned command is still pending".into(),
            ));
        }
        self.awaiting_reply = true;
        self.stream.write_all(command.as_bytes()).await?;
        self.stream.write_all(CRLF).await?;
        if let Some(body) = body {
            self.stream.write_all(body).await?;
            self.stream.write_all(CRLF).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, QueueError> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(QueueError::Closed);
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if !BODY_REPLIES.iter().any(|prefix| line.starts_with(prefix)) {
            self.awaiting_reply = false;
        }
        Ok(line)
    }

    async fn read_body(&mut self, len: &str) -> Result<Bytes, QueueError> {
        let bad_length = || QueueError::Protocol(format!("bad body length {:?}", len));
        let len: usize = len.parse().map_err(|_| bad_length())?;
        let framed = len
            .checked_add(CRLF.len())
            .filter(|_| len <= MAX_BODY_LEN)
            .ok_or_else(bad_length)?;

        let mut body = vec![0; framed];
        self.stream.read_exact(&mut body).await?;
        body.truncate(len);
        self.awaiting_reply = false;
        Ok(Bytes::from(body))
    }

    /// Send a command and read its one-line response.
    async fn call(&mut self, command: &str) -> Result<String, QueueError> {
        self.send(command, None).await?;
        self.read_line().await
    }

    async fn use_tube(&mut self, tube: &str) -> Result<(), QueueError> {
        if self.using == tube {
            return Ok(());
        }
        check_tube(tube)?;

        let line = self.call(&format!("use {}", tube)).await?;
        match line.strip_prefix("USING ") {
            Some(_) => {
                self.using = tube.to_string();
                Ok(())
            }
            None => Err(unexpected(line)),
        }
    }

    /// Read a `FOUND <id> <bytes>` or `RESERVED <id> <bytes>` job.
    async fn read_job(&mut self, header: &str, tube: String) -> Result<Job, QueueError> {
        let mut parts = header.split_whitespace();
        let id = parts
            .next()
            .and_then(|id| JobId::parse(id).ok())
            .ok_or_else(|| QueueError::Protocol(header.to_string()))?;
        let len = parts
            .next()
            .ok_or_else(|| QueueError::Protocol(header.to_string()))?;
        let payload = self.read_body(len).await?;
        Ok(Job::new(id, tube, payload))
    }

    /// Read an `OK <bytes>` YAML body.
    async fn read_yaml<T: serde::de::DeserializeOwned>(&mut self, line: String) -> Result<T, QueueError> {
        let Some(len) = line.strip_prefix("OK ") else {
            return Err(unexpected(line));
        };
        let body = self.read_body(len).await?;
        serde_yaml::from_slice(&body).map_err(|e| QueueError::Protocol(format!("bad YAML body: {}", e)))
    }

    async fn job_stats(&mut self, id: JobId) -> Result<Stats, QueueError> {
        let line = self.call(&format!("stats-job {}", id)).await?;
        if line == "NOT_FOUND" {
            return Err(QueueError::NotFound(id));
        }
        let map: BTreeMap<String, StatValue> = self.read_yaml(line).await?;
        Ok(Stats(map))
    }
}

fn unexpected(line: String) -> QueueError {
    match line.as_str() {
        "OUT_OF_MEMORY" | "INTERNAL_ERROR" | "DRAINING" | "JOB_TOO_BIG" | "EXPECTED_CRLF" => {
            QueueError::Server(line)
        }
        _ => QueueError::Protocol(line),
    }
}

impl JobQueue for Beanstalkd {
    async fn put(&mut self, tube: &str, payload: Bytes, options: PutOptions) -> Result<JobId, QueueError> {
        self.use_tube(tube).await?;

        let command = format!(
            "put {} {} {} {}",
            options.priority,
            options.delay.as_secs(),
            options.ttr.as_secs(),
            payload.len()
        );
        self.send(&command, Some(&payload)).await?;

        let line = self.read_line().await?;
        if let Some(id) = line.strip_prefix("INSERTED ") {
            return JobId::parse(id).map_err(|_| QueueError::Protocol(line.clone()));
        }
        Err(unexpected(line))
    }

    async fn reserve(&mut self, timeout: ReserveTimeout) -> Result<Option<Job>, QueueError> {
        let command = match timeout {
            ReserveTimeout::Block => "reserve".to_string(),
            ReserveTimeout::Poll => "reserve-with-timeout 0".to_string(),
            ReserveTimeout::Wait(wait) => format!("reserve-with-timeout {}", wait.as_secs()),
        };

        let line = self.call(&command).await?;
        if line == "TIMED_OUT" || line == "DEADLINE_SOON" {
            return Ok(None);
        }
        let Some(header) = line.strip_prefix("RESERVED ") else {
            return Err(unexpected(line));
        };

        // The reply does not name the tube; ask for it.
        let mut job = self.read_job(header, String::new()).await?;
        let stats = self.job_stats(job.id).await?;
        job.tube = stats
            .tube()
            .ok_or_else(|| QueueError::Protocol(format!("no tube in stats of job {}", job.id)))?
            .to_string();
        Ok(Some(job))
    }

    async fn delete(&mut self, id: JobId) -> Result<(), QueueError> {
        let line = self.call(&format!("delete {}", id)).await?;
        match line.as_str() {
            "DELETED" => Ok(()),
            "NOT_FOUND" => Err(QueueError::NotFound(id)),
            _ => Err(unexpected(line)),
        }
    }

    async fn release(&mut self, id: JobId, priority: u32, delay: Duration) -> Result<(), QueueError> {
        let line = self
            .call(&format!("release {} {} {}", id, priority, delay.as_secs()))
            .await?;
        match line.as_str() {
            "RELEASED" => Ok(()),
            "BURIED" => Err(QueueError::Server(format!("job {} buried on release", id))),
            "NOT_FOUND" => Err(QueueError::NotFound(id)),
            _ => Err(unexpected(line)),
        }
    }

    async fn bury(&mut self, id: JobId, priority: u32) -> Result<(), QueueError> {
        let line = self.call(&format!("bury {} {}", id, priority)).await?;
        match line.as_str() {
            "BURIED" => Ok(()),
            "NOT_FOUND" => Err(QueueError::NotFound(id)),
            _ => Err(unexpected(line)),
        }
    }

    async fn peek(&mut self, tube: &str, state: PeekState) -> Result<Option<Job>, QueueError> {
        self.use_tube(tube).await?;

        let line = self.call(&format!("peek-{}", state)).await?;
        if line == "NOT_FOUND" {
            return Ok(None);
        }
        let Some(header) = line.strip_prefix("FOUND ") else {
            return Err(unexpected(line));
        };
        self.read_job(header, tube.to_string()).await.map(Some)
    }

    async fn kick(&mut self, tube: &str, max: u64) -> Result<u64, QueueError> {
        self.use_tube(tube).await?;

        let line = self.call(&format!("kick {}", max)).await?;
        match line.strip_prefix("KICKED ").map(str::parse) {
            Some(Ok(count)) => Ok(count),
            _ => Err(unexpected(line)),
        }
    }

    async fn stats(&mut self, scope: &StatsScope) -> Result<Stats, QueueError> {
        let line = match scope {
            StatsScope::Global => self.call("stats").await?,
            StatsScope::Tube(tube) => {
                check_tube(tube)?;
                self.call(&format!("stats-tube {}", tube)).await?
            }
            StatsScope::Job(id) => return self.job_stats(*id).await,
        };

        if line == "NOT_FOUND"
            && let StatsScope::Tube(tube) = scope
        {
            return Err(QueueError::TubeNotFound(tube.clone()));
        }
        let map: BTreeMap<String, StatValue> = self.read_yaml(line).await?;
        Ok(Stats(map))
    }

    async fn pause_tube(&mut self, tube: &str, delay: Duration) -> Result<(), QueueError> {
        check_tube(tube)?;
        let line = self
            .call(&format!("pause-tube {} {}", tube, delay.as_secs()))
            .await?;
        match line.as_str() {
            "PAUSED" => Ok(()),
            "NOT_FOUND" => Err(QueueError::TubeNotFound(tube.to_string())),
            _ => Err(unexpected(line)),
        }
    }

    async fn list_tubes(&mut self) -> Result<BTreeSet<String>, QueueError> {
        let line = self.call("list-tubes").await?;
        let tubes: Vec<String> = self.read_yaml(line).await?;
        Ok(tubes.into_iter().collect())
    }

    async fn watch(&mut self, tube: &str) -> Result<usize, QueueError> {
        check_tube(tube)?;
        let line = self.call(&format!("watch {}", tube)).await?;
        match line.strip_prefix("WATCHING ").map(str::parse) {
            Some(Ok(count)) => Ok(count),
            _ => Err(unexpected(line)),
        }
    }

    async fn ignore(&mut self, tube: &str) -> Result<usize, QueueError> {
        check_tube(tube)?;
        let line = self.call(&format!("ignore {}", tube)).await?;
        if line == "NOT_IGNORED" {
            return Err(QueueError::NotIgnored(tube.to_string()));
        }
        match line.strip_prefix("WATCHING ").map(str::parse) {
            Some(Ok(count)) => Ok(count),
            _ => Err(unexpected(line)),
        }
    }
}
