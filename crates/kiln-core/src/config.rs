use crate::conn::READ_BUF_SIZE;
use crate::error::{KilnError, KilnResult};
use crate::syscalls;
use std::path::PathBuf;
use std::str::FromStr;

/// Upper bound on descriptor numbers the connection table can hold.
pub const MAX_FD: usize = 65535;
/// Readiness events collected per `epoll_wait`.
pub const MAX_EVENT_NUMBER: usize = 10000;
/// Pending tasks the worker queue accepts before refusing.
pub const MAX_QUEUED_TASKS: usize = 10000;
/// Listen backlog.
pub const LISTEN_BACKLOG: i32 = 5;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port on 0.0.0.0. `0` picks an ephemeral port.
    pub port: u16,

    /// Absolute directory request paths are appended to
    /// (default: ./resources, made absolute).
    pub doc_root: PathBuf,

    /// Worker threads (default: number of CPUs).
    pub workers: usize,

    /// Task queue capacity (default: 10000).
    pub queue_capacity: usize,

    /// Connection table size; descriptors at or above it are refused
    /// (default: the process descriptor limit, at most 65535).
    pub max_fds: usize,

    /// Live connection limit for admission control (default: 65535).
    pub max_connections: usize,

    /// Per-connection read buffer in bytes (default: 2048).
    pub read_buffer_size: usize,

    /// Events per epoll_wait (default: 10000).
    pub max_events: usize,

    /// Seconds between metrics log lines; 0 disables them.
    pub stats_interval: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            doc_root: absolute(PathBuf::from("./resources")),
            workers: num_cpus::get(),
            queue_capacity: MAX_QUEUED_TASKS,
            max_fds: syscalls::descriptor_limit().clamp(1, MAX_FD),
            max_connections: MAX_FD,
            read_buffer_size: READ_BUF_SIZE,
            max_events: MAX_EVENT_NUMBER,
            stats_interval: 0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env(port: u16) -> KilnResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        Self::from_lookup(port, |key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(port: u16, lookup: impl Fn(&str) -> Option<String>) -> KilnResult<Self> {
        let defaults = Self::default();
        let config = Self {
            port,
            doc_root: lookup("KILN_DOC_ROOT")
                .map(|v| absolute(PathBuf::from(v)))
                .unwrap_or(defaults.doc_root),
            workers: parse_var(&lookup, "KILN_WORKERS", defaults.workers)?,
            queue_capacity: parse_var(&lookup, "KILN_QUEUE_CAPACITY", defaults.queue_capacity)?,
            max_fds: parse_var(&lookup, "KILN_MAX_FDS", defaults.max_fds)?,
            max_connections: parse_var(&lookup, "KILN_MAX_CONNECTIONS", defaults.max_connections)?,
            read_buffer_size: parse_var(&lookup, "KILN_READ_BUFFER", defaults.read_buffer_size)?,
            max_events: parse_var(&lookup, "KILN_MAX_EVENTS", defaults.max_events)?,
            stats_interval: parse_var(&lookup, "KILN_STATS_INTERVAL", defaults.stats_interval)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> KilnResult<()> {
        let positive = [
            ("workers", self.workers),
            ("queue_capacity", self.queue_capacity),
            ("max_fds", self.max_fds),
            ("max_connections", self.max_connections),
            ("read_buffer_size", self.read_buffer_size),
            ("max_events", self.max_events),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(KilnError::Config(format!("{name} must be greater than zero")));
        }
        if !self.doc_root.is_absolute() {
            return Err(KilnError::Config(format!(
                "document root {} is not absolute",
                self.doc_root.display()
            )));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> KilnResult<T> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| KilnError::Config(format!("{key}={raw} is not a valid value"))),
    }
}

/// Anchor a relative path at the current directory without touching the
/// filesystem.
pub fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path.strip_prefix("./").unwrap_or(&path)),
        Err(_) => path,
    }
}
