// src/reactor.rs
use crate::config::{LISTEN_BACKLOG, ServerConfig};
use crate::engine::Engine;
use crate::error::KilnResult;
use crate::metrics::ServerMetrics;
use crate::pool::{TaskHandler, ThreadPool};
use crate::syscalls::{self, Readiness};
use libc::c_int;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Token the listening socket is registered under. Connection tokens are
/// their descriptor numbers.
pub const LISTENER_TOKEN: u64 = u64::MAX;

/// Upper bound on one `epoll_wait`, so a shutdown request is noticed
/// without any traffic.
const WAIT_TIMEOUT_MS: i32 = 100;

/// Asks a running reactor to stop.
#[derive(Clone)]
pub struct ReactorHandle {
    shutdown: Arc<AtomicBool>,
}

impl ReactorHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// The single event-loop thread: accepts, reads and dispatches to the pool.
pub struct Reactor {
    listen_fd: c_int,
    port: u16,
    engine: Arc<Engine>,
    pool: ThreadPool,
    max_events: usize,
    shutdown: Arc<AtomicBool>,
}

impl Reactor {
    /// Open the listener, the epoll instance and the worker pool.
    pub fn bind(config: &ServerConfig, metrics: Arc<ServerMetrics>) -> KilnResult<Self> {
        config.validate()?;
        let engine = Arc::new(Engine::new(config, metrics)?);

        let listen_fd = syscalls::create_listen_socket(config.port, LISTEN_BACKLOG)?;
        let setup = syscalls::local_port(listen_fd).and_then(|port| {
            engine.epoll().add_listener(listen_fd, LISTENER_TOKEN)?;
            let handler: Arc<dyn TaskHandler> = engine.clone();
            let pool = ThreadPool::new(config.workers, config.queue_capacity, handler)?;
            Ok((port, pool))
        });
        let (port, pool) = match setup {
            Ok(parts) => parts,
            Err(e) => {
                syscalls::close_fd(listen_fd);
                return Err(e);
            }
        };

        info!(
            port,
            root = %engine.docs().path().display(),
            workers = config.workers,
            "kiln listening"
        );

        Ok(Self {
            listen_fd,
            port,
            engine,
            pool,
            max_events: config.max_events,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The bound port; useful when binding port 0.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Run until [`ReactorHandle::shutdown`] is called or `epoll_wait`
    /// fails. Workers are drained and every connection is closed before
    /// returning.
    pub fn run(mut self) -> KilnResult<()> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];
        let mut ready: Vec<Readiness> = Vec::with_capacity(self.max_events);

        let result = loop {
            if self.shutdown.load(Ordering::Acquire) {
                break Ok(());
            }
            if let Err(e) = self.engine.epoll().wait(&mut events, &mut ready, WAIT_TIMEOUT_MS) {
                error!(error = %e, "epoll_wait failed");
                break Err(e);
            }
            for &event in &ready {
                self.dispatch(event);
            }
        };

        self.stop();
        result
    }

    fn dispatch(&self, event: Readiness) {
        if event.token == LISTENER_TOKEN {
            self.accept_all();
            return;
        }

        let fd = event.token as c_int;
        if event.is_hangup() {
            self.engine.on_hangup(fd);
        } else if event.is_readable() {
            self.engine.on_readable(fd, &self.pool);
        } else if event.is_writable() {
            self.engine.on_writable(fd, &self.pool);
        }
    }

    fn accept_all(&self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => {
                    if let Err(e) = self.engine.open(fd, Some(peer)) {
                        warn!(%peer, error = %e, "connection refused");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn stop(&mut self) {
        info!("shutting down");
        self.pool.shutdown();
        let closed = self.engine.close_all();
        debug!(closed, "connections closed");
        syscalls::close_fd(self.listen_fd);
        self.listen_fd = -1;
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        syscalls::close_fd(self.listen_fd);
    }
}
