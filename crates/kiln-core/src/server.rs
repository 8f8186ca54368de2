// src/server.rs
use crate::config::ServerConfig;
use crate::error::KilnResult;
use crate::metrics::ServerMetrics;
use crate::reactor::{Reactor, ReactorHandle};
use crate::syscalls;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Start from environment configuration (see [`ServerConfig::from_env`]).
    pub fn from_env(port: u16) -> KilnResult<Self> {
        ServerConfig::from_env(port).map(Self::new)
    }

    pub fn doc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.doc_root = crate::config::absolute(root.into());
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn stats_interval(mut self, secs: u64) -> Self {
        self.config.stats_interval = secs;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind and serve until Ctrl-C. Setup failures are returned before any
    /// connection is accepted.
    pub fn serve(self) -> KilnResult<()> {
        syscalls::ignore_sigpipe()?;

        let metrics = Arc::new(ServerMetrics::new());
        let reactor = Reactor::bind(&self.config, metrics.clone())?;
        let handle = reactor.handle();

        // Setup signal handling - ctrl-c graceful shutdown
        let signal_handle = handle.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("received interrupt, shutting down");
            signal_handle.shutdown();
        }) {
            warn!(error = %e, "could not install the Ctrl-C handler");
        }

        let stats = spawn_stats(self.config.stats_interval, metrics.clone(), handle.clone());

        let result = reactor.run();
        handle.shutdown();
        if let Some(stats) = stats {
            let _ = stats.join();
        }

        info!(
            requests = metrics.requests(),
            bytes_sent = metrics.bytes_sent(),
            "kiln server shut down"
        );
        result
    }
}

/// Log the counters every `interval` seconds until shutdown. `0` disables.
fn spawn_stats(
    interval: u64,
    metrics: Arc<ServerMetrics>,
    handle: ReactorHandle,
) -> Option<JoinHandle<()>> {
    if interval == 0 {
        return None;
    }
    let period = Duration::from_secs(interval);
    thread::Builder::new()
        .name("kiln-metrics".to_string())
        .spawn(move || {
            let mut last = Instant::now();
            while !handle.is_shutdown() {
                thread::sleep(Duration::from_millis(100));
                if last.elapsed() < period {
                    continue;
                }
                last = Instant::now();
                info!(
                    active = metrics.active(),
                    requests = metrics.requests(),
                    bytes_sent = metrics.bytes_sent(),
                    refused = metrics.refused(),
                    "metrics"
                );
            }
        })
        .map_err(|e| warn!(error = %e, "metrics thread not started"))
        .ok()
}
