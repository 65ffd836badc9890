//! Fixed-size pool of worker threads serving queued connections
//!
//! Each worker loops: wait for a queued connection (or shutdown), serve it to
//! completion, account for it, repeat. Workers never pick up new work once
//! the running flag is false, but a connection already dequeued is always
//! served to the end.

use anyhow::{bail, Context, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

use crate::state::{ConnectionHandle, ServerState};

/// Runs one connection to completion. Blocking is expected.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, conn: ConnectionHandle);
}

/// Observable worker state. The wait itself happens inside
/// `ServerState::wait_for_work` under the shared lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    /// Holding a dequeued connection, not yet handed to the handler
    Dispatching,
    Serving,
    Terminated,
}

impl WorkerPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerPhase::Idle,
            1 => WorkerPhase::Dispatching,
            2 => WorkerPhase::Serving,
            _ => WorkerPhase::Terminated,
        }
    }
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

pub struct WorkerPool {
    state: Arc<ServerState>,
    workers: Vec<Worker>,
    phases: Arc<Vec<AtomicU8>>,
}

impl WorkerPool {
    /// Spawn `size` workers. They start idle and wait on the shared state.
    pub fn start(
        size: usize,
        state: Arc<ServerState>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Self> {
        if size == 0 {
            bail!("worker pool needs at least one thread");
        }
        let phases: Arc<Vec<AtomicU8>> =
            Arc::new((0..size).map(|_| AtomicU8::new(WorkerPhase::Idle as u8)).collect());
        let mut pool = WorkerPool {
            state,
            workers: Vec::with_capacity(size),
            phases,
        };

        for id in 0..size {
            let state = Arc::clone(&pool.state);
            let handler = Arc::clone(&handler);
            let phases = Arc::clone(&pool.phases);
            let spawned = thread::Builder::new()
                .name(format!("fsrv-worker-{}", id))
                .spawn(move || worker_loop(id, &state, handler.as_ref(), &phases));
            match spawned {
                Ok(thread) => pool.workers.push(Worker {
                    id,
                    thread: Some(thread),
                }),
                Err(e) => {
                    // Bring down whatever already started before reporting
                    pool.shutdown();
                    return Err(e).with_context(|| format!("spawn worker {}", id));
                }
            }
        }
        debug!(workers = size, "worker pool started");
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn phases(&self) -> Vec<WorkerPhase> {
        self.phases
            .iter()
            .map(|p| WorkerPhase::from_u8(p.load(Ordering::Acquire)))
            .collect()
    }

    /// Stop the pool: clear the running flag, wake everyone, join every
    /// worker, then close whatever is still queued.
    ///
    /// Safe to call more than once. Returns the number of queued
    /// connections that were closed without being served.
    pub fn shutdown(&mut self) -> usize {
        if self.state.shutdown() {
            info!(workers = self.workers.len(), "shutting down worker pool");
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    error!(worker = worker.id, "worker thread panicked");
                }
            }
        }
        let dropped = self.state.clear_queue();
        if dropped > 0 {
            info!(dropped, "closed queued connections");
        }
        dropped
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, state: &ServerState, handler: &dyn ConnectionHandler, phases: &[AtomicU8]) {
    let set_phase = |p: WorkerPhase| phases[id].store(p as u8, Ordering::Release);
    loop {
        set_phase(WorkerPhase::Idle);
        let conn = match state.wait_for_work() {
            Some(conn) => conn,
            None => break,
        };
        set_phase(WorkerPhase::Dispatching);
        let conn_id = conn.id();
        debug!(worker = id, conn = conn_id, "dispatching connection");
        set_phase(WorkerPhase::Serving);

        // A panicking session must not take the worker or the counters with it
        if panic::catch_unwind(AssertUnwindSafe(|| handler.handle(conn))).is_err() {
            error!(worker = id, conn = conn_id, "session handler panicked");
        }
        let connected = state.finish_session();
        debug!(worker = id, conn = conn_id, connected, "session finished");
    }
    set_phase(WorkerPhase::Terminated);
    debug!(worker = id, "worker terminated");
}
