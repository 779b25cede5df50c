use std::{fmt, sync::Arc, time::Duration};

use crate::{
    utils::hardware_parallelism,
    worker::{OsThreads, ThreadSpawner},
};

/// Backlog handed to `listen`; the kernel clamps it to its own maximum.
pub const DEFAULT_BACKLOG: i32 = i32::MAX;
/// Bound on each shutdown wait.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(1500);
/// How long the listener blocks in one poll before re-checking its stop flag.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Configuration for server sockets.
///
/// Use [`ServerConfig::builder`] for ergonomic construction.
///
/// ## Worker pool
///
/// - workers: number of worker threads; `None` uses the detected hardware
///   parallelism
/// - spawner: how threads are started, replaceable to control thread creation
///
/// ## Shutdown
///
/// - shutdown_timeout: bound on waiting for workers, and separately for the
///   listener, when the socket is closed
/// - poll_timeout: longest time the listener goes without checking whether it
///   was asked to stop
#[derive(Clone)]
pub struct ServerConfig {
    pub workers: Option<usize>,
    pub backlog: i32,
    pub shutdown_timeout: Duration,
    pub poll_timeout: Duration,
    pub spawner: Arc<dyn ThreadSpawner>,
}

impl ServerConfig {
    /// Create a new builder for ServerConfig
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Worker threads a server socket will try to start.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(hardware_parallelism)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            backlog: DEFAULT_BACKLOG,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            spawner: Arc::new(OsThreads),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("workers", &self.workers)
            .field("backlog", &self.backlog)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("poll_timeout", &self.poll_timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for ServerConfig.
///
/// Unset fields fall back to ServerConfig::default().
#[derive(Default)]
pub struct ServerConfigBuilder {
    workers: Option<usize>,
    backlog: Option<i32>,
    shutdown_timeout: Option<Duration>,
    poll_timeout: Option<Duration>,
    spawner: Option<Arc<dyn ThreadSpawner>>,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a fixed worker count instead of the detected parallelism
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = Some(count);
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    /// Set the thread spawner implementation
    pub fn spawner(mut self, spawner: Arc<dyn ThreadSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn build(self) -> ServerConfig {
        let default = ServerConfig::default();
        ServerConfig {
            workers: self.workers.or(default.workers),
            backlog: self.backlog.unwrap_or(default.backlog),
            shutdown_timeout: self.shutdown_timeout.unwrap_or(default.shutdown_timeout),
            poll_timeout: self.poll_timeout.unwrap_or(default.poll_timeout),
            spawner: self.spawner.unwrap_or(default.spawner),
        }
    }
}
