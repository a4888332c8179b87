#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use client::{JobQueue, MemoryQueue, MemoryServer, QueueError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tube_core::{JobId, PutOptions, ServerConfig, StatsScope};
use worker::{FnHandler, HandlerError, HandlerRegistry, Job, TubeHandler};

/// A fresh server and a producer connection on it.
pub fn setup() -> (MemoryServer, MemoryQueue) {
    let server = MemoryServer::new();
    let producer = server.connect();
    (server, producer)
}

pub async fn put_many(
    producer: &mut MemoryQueue,
    tube: &str,
    count: usize,
) -> Result<Vec<JobId>, QueueError> {
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        ids.push(
            producer
                .put(tube, format!("{}-{}", tube, i).into(), PutOptions::default())
                .await?,
        );
    }
    Ok(ids)
}

pub async fn ready_count(queue: &mut MemoryQueue, tube: &str) -> Result<u64, QueueError> {
    match queue.stats(&StatsScope::Tube(tube.to_string())).await {
        Ok(stats) => Ok(stats.ready_jobs().unwrap_or_default()),
        Err(QueueError::TubeNotFound(_)) => Ok(0),
        Err(e) => Err(e),
    }
}

/// Handler that always succeeds and counts its calls.
pub fn counting(calls: &Arc<AtomicUsize>) -> Arc<dyn TubeHandler> {
    let calls = Arc::clone(calls);
    Arc::new(FnHandler::new(move |_job: &Job| {
        calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }))
}

/// Handler that always fails.
pub fn failing() -> Arc<dyn TubeHandler> {
    Arc::new(FnHandler::new(|_job: &Job| {
        Box::pin(async { Err(HandlerError::failed("always fails")) })
    }))
}

pub fn registry(entries: Vec<(&str, Arc<dyn TubeHandler>)>) -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    for (tube, handler) in entries {
        registry.register_arc(tube, handler);
    }
    Arc::new(registry)
}

/// A one-connection beanstalkd stand-in. Each command line read gets the
/// next canned reply; once they run out the connection is dropped. The
/// handle yields the command lines seen.
pub async fn scripted_beanstalkd(replies: Vec<&'static str>) -> (ServerConfig, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        let mut read = BufReader::new(read);
        let mut seen = Vec::new();

        for reply in replies {
            let mut line = String::new();
            if read.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            seen.push(line.trim_end().to_string());
            write.write_all(reply.as_bytes()).await.unwrap();
        }
        seen
    });

    (ServerConfig::new("127.0.0.1", port), server)
}

/// Formatted log output collected in memory.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Route this thread's logs into a `LogCapture` until the guard drops.
pub fn capture_logs() -> (LogCapture, tracing::subscriber::DefaultGuard) {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    (capture, tracing::subscriber::set_default(subscriber))
}
