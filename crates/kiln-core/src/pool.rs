// src/pool.rs
//! Bounded task queue drained by a fixed set of worker threads.

use crate::error::{KilnError, KilnResult};
use libc::c_int;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Work the pool knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Parse and answer whatever is buffered on this connection.
    Process(c_int),
}

/// Runs tasks on worker threads.
pub trait TaskHandler: Send + Sync + 'static {
    fn handle(&self, task: Task);
}

struct Queue {
    tasks: Mutex<VecDeque<Task>>,
    ready: Condvar,
    capacity: usize,
    shutdown: AtomicBool,
}

impl Queue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ThreadPool {
    queue: Arc<Queue>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(workers: usize, capacity: usize, handler: Arc<dyn TaskHandler>) -> KilnResult<Self> {
        if workers == 0 || capacity == 0 {
            return Err(KilnError::Config(
                "thread pool needs at least one worker and one queue slot".into(),
            ));
        }

        let queue = Arc::new(Queue {
            tasks: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            capacity,
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let worker_queue = Arc::clone(&queue);
            let worker_handler = Arc::clone(&handler);
            let spawned = thread::Builder::new()
                .name(format!("kiln-worker-{}", i))
                .spawn(move || worker_loop(i, &worker_queue, worker_handler.as_ref()));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Let the workers that did start exit before bailing out.
                    let mut partial = Self {
                        queue,
                        workers: handles,
                    };
                    partial.shutdown();
                    return Err(e.into());
                }
            }
        }

        Ok(Self {
            queue,
            workers: handles,
        })
    }

    /// Enqueue a task and wake one worker. Never blocks on a full queue.
    pub fn submit(&self, task: Task) -> KilnResult<()> {
        {
            let mut tasks = self.queue.lock();
            if self.queue.shutdown.load(Ordering::Acquire) {
                return Err(KilnError::PoolShutdown);
            }
            if tasks.len() >= self.queue.capacity {
                return Err(KilnError::QueueFull);
            }
            tasks.push_back(task);
        }
        self.queue.ready.notify_one();
        Ok(())
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting tasks, let the workers drain the queue and join them.
    pub fn shutdown(&mut self) {
        {
            let _tasks = self.queue.lock();
            self.queue.shutdown.store(true, Ordering::Release);
        }
        self.queue.ready.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, queue: &Queue, handler: &dyn TaskHandler) {
    debug!("worker {} started", id);
    loop {
        let task = {
            let mut tasks = queue.lock();
            loop {
                if let Some(task) = tasks.pop_front() {
                    break task;
                }
                if queue.shutdown.load(Ordering::Acquire) {
                    debug!("worker {} exiting", id);
                    return;
                }
                tasks = queue.ready.wait(tasks).unwrap_or_else(PoisonError::into_inner);
            }
        };

        if catch_unwind(AssertUnwindSafe(|| handler.handle(task))).is_err() {
            error!(?task, "worker {} caught a panic while running a task", id);
        }
    }
}
