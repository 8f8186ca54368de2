// src/slab.rs
use crate::conn::Connection;
use crate::error::{KilnError, KilnResult};
use libc::c_int;
use std::net::SocketAddrV4;
use std::sync::{Mutex, MutexGuard, PoisonError};

type Slot = Mutex<Option<Box<Connection>>>;

/// Connection table indexed by socket descriptor.
///
/// A slot is empty until its descriptor number is first accepted. After a
/// close the `Connection` stays in the slot with no socket attached and is
/// re-initialized, buffers and all, the next time the kernel hands out the
/// same descriptor number.
///
/// Only the reactor attaches sockets. Workers lock a single slot for the
/// duration of one task; the one-shot epoll registration keeps that lock
/// uncontended.
pub struct ConnectionSlab {
    slots: Box<[Slot]>,
    read_capacity: usize,
}

impl ConnectionSlab {
    /// Allocate the slot array once; connections themselves are boxed
    /// lazily.
    pub fn new(capacity: usize, read_capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Mutex::new(None)).collect();
        Self {
            slots,
            read_capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, fd: c_int) -> Option<MutexGuard<'_, Option<Box<Connection>>>> {
        let slot = self.slots.get(usize::try_from(fd).ok()?)?;
        // A worker panic is caught by the pool; the connection data itself
        // stays consistent enough to be torn down.
        Some(slot.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Attach an accepted socket to the slot matching its descriptor.
    pub fn attach(&self, fd: c_int, peer: Option<SocketAddrV4>) -> KilnResult<()> {
        let mut slot = self.slot(fd).ok_or(KilnError::TableFull)?;
        let conn = slot.get_or_insert_with(|| Box::new(Connection::new(self.read_capacity)));
        debug_assert!(!conn.is_open(), "descriptor {fd} attached twice");
        conn.init(fd, peer);
        Ok(())
    }

    /// Run `f` against the open connection on `fd`, if any.
    pub fn with<R>(&self, fd: c_int, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        let mut slot = self.slot(fd)?;
        match slot.as_deref_mut() {
            Some(conn) if conn.is_open() && conn.fd() == fd => Some(f(conn)),
            _ => None,
        }
    }

    /// Detach every open connection, returning their descriptors.
    pub fn drain_open(&self) -> Vec<c_int> {
        let mut fds = Vec::new();
        for slot in self.slots.iter() {
            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(fd) = slot.as_deref_mut().and_then(Connection::release) {
                fds.push(fd);
            }
        }
        fds
    }
}
