// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide counters shared by the reactor and the workers.
///
/// `active_conns` doubles as the admission counter: it only grows through
/// [`ServerMetrics::try_admit`], which refuses once the limit is reached.
#[repr(C, align(64))]
pub struct ServerMetrics {
    req_count: AtomicUsize,
    active_conns: AtomicUsize,
    bytes_sent: AtomicUsize,
    refused: AtomicUsize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            req_count: AtomicUsize::new(0),
            active_conns: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            refused: AtomicUsize::new(0),
        }
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a new connection unless `limit` live connections already exist.
    pub fn try_admit(&self, limit: usize) -> bool {
        let admitted = self
            .active_conns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok();
        if !admitted {
            self.refused.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn requests(&self) -> usize {
        self.req_count.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> usize {
        self.active_conns.load(Ordering::Acquire)
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn refused(&self) -> usize {
        self.refused.load(Ordering::Relaxed)
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
