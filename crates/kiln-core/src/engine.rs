// src/engine.rs
//! Connection lifecycle shared by the reactor thread and the workers.

use crate::config::ServerConfig;
use crate::conn::{Fill, Next};
use crate::error::{KilnError, KilnResult};
use crate::metrics::ServerMetrics;
use crate::pool::{Task, TaskHandler, ThreadPool};
use crate::resource::DocRoot;
use crate::slab::ConnectionSlab;
use crate::syscalls::{self, Epoll, Interest};
use libc::c_int;
use std::net::SocketAddrV4;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What happened to a connection after a readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A task was queued for a worker.
    Queued,
    /// A task is already outstanding; nothing was read.
    AlreadyScheduled,
    /// Re-armed without involving a worker.
    Rearmed,
    /// The connection was torn down.
    Closed,
    /// No open connection on this descriptor.
    Unknown,
}

enum ReadStep {
    Busy,
    Schedule,
    Close(&'static str),
}

pub struct Engine {
    epoll: Epoll,
    slab: ConnectionSlab,
    metrics: Arc<ServerMetrics>,
    docs: DocRoot,
    max_connections: usize,
}

impl Engine {
    pub fn new(config: &ServerConfig, metrics: Arc<ServerMetrics>) -> KilnResult<Self> {
        Ok(Self {
            epoll: Epoll::new()?,
            slab: ConnectionSlab::new(config.max_fds, config.read_buffer_size),
            metrics,
            docs: DocRoot::new(config.doc_root.clone()),
            max_connections: config.max_connections,
        })
    }

    pub fn epoll(&self) -> &Epoll {
        &self.epoll
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn docs(&self) -> &DocRoot {
        &self.docs
    }

    /// Admit an accepted socket: table slot, non-blocking mode and a
    /// one-shot read registration. On error the socket is already closed.
    pub fn open(&self, fd: c_int, peer: Option<SocketAddrV4>) -> KilnResult<()> {
        if !self.metrics.try_admit(self.max_connections) {
            syscalls::close_fd(fd);
            return Err(KilnError::TableFull);
        }
        if let Err(e) = self.slab.attach(fd, peer) {
            syscalls::close_fd(fd);
            self.metrics.dec_conn();
            return Err(e);
        }
        let registered = syscalls::prepare_stream(fd)
            .and_then(|()| self.epoll.add_oneshot(fd, fd as u64, Interest::Read));
        if let Err(e) = registered {
            self.close(fd);
            return Err(e);
        }
        debug!(fd, ?peer, "connection opened");
        Ok(())
    }

    /// Deregister, close and forget `fd`. A no-op if it is not open.
    pub fn close(&self, fd: c_int) {
        let Some(Some(fd)) = self.slab.with(fd, |conn| conn.release()) else {
            return;
        };
        if let Err(e) = self.epoll.delete(fd) {
            debug!(fd, error = %e, "epoll delete failed");
        }
        syscalls::close_fd(fd);
        self.metrics.dec_conn();
        debug!(fd, "connection closed");
    }

    /// Peer hung up or the socket reported an error.
    pub fn on_hangup(&self, fd: c_int) -> Dispatch {
        self.close(fd);
        Dispatch::Closed
    }

    /// Drain the socket into the read buffer and hand the connection to a
    /// worker.
    pub fn on_readable(&self, fd: c_int, pool: &ThreadPool) -> Dispatch {
        let step = self.slab.with(fd, |conn| {
            if conn.is_scheduled() {
                return ReadStep::Busy;
            }
            match conn.fill_from_socket() {
                Ok(Fill::Data(_)) => {
                    conn.try_schedule();
                    ReadStep::Schedule
                }
                Ok(Fill::Closed) => ReadStep::Close("peer closed"),
                Ok(Fill::Full) => ReadStep::Close("read buffer full"),
                Err(_) => ReadStep::Close("read failed"),
            }
        });

        match step {
            None => Dispatch::Unknown,
            Some(ReadStep::Busy) => Dispatch::AlreadyScheduled,
            Some(ReadStep::Close(reason)) => {
                debug!(fd, reason, "closing after read");
                self.on_hangup(fd)
            }
            Some(ReadStep::Schedule) => self.submit(fd, pool),
        }
    }

    /// Continue a response that blocked on a full socket buffer.
    pub fn on_writable(&self, fd: c_int, pool: &ThreadPool) -> Dispatch {
        let next = self.slab.with(fd, |conn| {
            if conn.is_scheduled() {
                return None;
            }
            let next = conn.resume_write(&self.metrics);
            if next == Next::Process {
                conn.try_schedule();
            }
            Some(next)
        });

        match next {
            None => Dispatch::Unknown,
            Some(None) => Dispatch::AlreadyScheduled,
            Some(Some(Next::Process)) => self.submit(fd, pool),
            Some(Some(next)) => self.apply(fd, next),
        }
    }

    /// Worker entry point. The slot lock is released before re-arming so
    /// the reactor never waits on a worker. A panic while processing closes
    /// the connection.
    pub fn process(&self, fd: c_int) -> Dispatch {
        let next = self.slab.with(fd, |conn| {
            let next = catch_unwind(AssertUnwindSafe(|| conn.process(&self.docs, &self.metrics)))
                .unwrap_or_else(|_| {
                    error!(fd, "request processing panicked, closing connection");
                    Next::Close
                });
            conn.clear_scheduled();
            next
        });
        match next {
            None => Dispatch::Unknown,
            Some(next) => self.apply(fd, next),
        }
    }

    fn submit(&self, fd: c_int, pool: &ThreadPool) -> Dispatch {
        match pool.submit(Task::Process(fd)) {
            Ok(()) => Dispatch::Queued,
            Err(e) => {
                warn!(fd, error = %e, "dropping connection, task not queued");
                self.close(fd);
                Dispatch::Closed
            }
        }
    }

    fn apply(&self, fd: c_int, next: Next) -> Dispatch {
        let interest = match next {
            Next::Read => Interest::Read,
            Next::Write => Interest::Write,
            Next::Close => {
                self.close(fd);
                return Dispatch::Closed;
            }
            // Workers loop over pipelined requests themselves; only the
            // reactor path produces this, and it submits instead.
            Next::Process => Interest::Read,
        };
        match self.epoll.rearm(fd, fd as u64, interest) {
            Ok(()) => Dispatch::Rearmed,
            Err(e) => {
                debug!(fd, error = %e, "re-arm failed");
                self.close(fd);
                Dispatch::Closed
            }
        }
    }

    /// Close every open connection. Used once the workers have stopped.
    pub fn close_all(&self) -> usize {
        let fds = self.slab.drain_open();
        for &fd in &fds {
            if let Err(e) = self.epoll.delete(fd) {
                debug!(fd, error = %e, "epoll delete failed");
            }
            syscalls::close_fd(fd);
            self.metrics.dec_conn();
        }
        fds.len()
    }
}

impl TaskHandler for Engine {
    fn handle(&self, task: Task) {
        match task {
            Task::Process(fd) => {
                self.process(fd);
            }
        }
    }
}
