//! Process-wide server state shared by admission, workers and the signal handler
//!
//! The admission queue, the connected/active counters and the running flag
//! live behind one mutex, paired with one condvar. Every mutation of them
//! happens inside that lock.

use parking_lot::{Condvar, Mutex};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::queue::BoundedQueue;

/// One accepted connection, owned by exactly one place at a time.
///
/// Dropping the handle closes the socket.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    peer: SocketAddr,
    stream: TcpStream,
}

impl ConnectionHandle {
    pub fn new(id: u64, peer: SocketAddr, stream: TcpStream) -> Self {
        ConnectionHandle { id, peer, stream }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Shut down both directions so the peer sees EOF, then drop the socket.
    pub fn close(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Why admission refused a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    QueueFull,
    ShuttingDown,
}

/// Point-in-time copy of the shared counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub running: bool,
    pub connected: usize,
    pub active: usize,
    pub queued: usize,
    pub queue_capacity: usize,
}

struct Shared {
    running: bool,
    // Admitted and not yet finished: queued + active
    connected: usize,
    // Sessions currently being served by a worker
    active: usize,
    queue: BoundedQueue<ConnectionHandle>,
}

pub struct ServerState {
    shared: Mutex<Shared>,
    work: Condvar,
    max_clients: usize,
    next_id: AtomicU64,
}

impl ServerState {
    pub fn new(max_clients: usize, queue_capacity: usize) -> Self {
        ServerState {
            shared: Mutex::new(Shared {
                running: true,
                connected: 0,
                active: 0,
                queue: BoundedQueue::new(queue_capacity),
            }),
            work: Condvar::new(),
            max_clients,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Flip the running flag to false and wake every waiter.
    ///
    /// Returns true only for the call that performed the transition.
    pub fn shutdown(&self) -> bool {
        let mut shared = self.shared.lock();
        let was_running = shared.running;
        shared.running = false;
        drop(shared);
        self.work.notify_all();
        was_running
    }

    /// Queue an accepted connection for the workers.
    ///
    /// A refused connection is handed back to the caller untouched.
    pub fn admit(&self, conn: ConnectionHandle) -> Result<usize, (ConnectionHandle, Refusal)> {
        let mut shared = self.shared.lock();
        if !shared.running {
            return Err((conn, Refusal::ShuttingDown));
        }
        if let Err(conn) = shared.queue.enqueue(conn) {
            return Err((conn, Refusal::QueueFull));
        }
        shared.connected += 1;
        let connected = shared.connected;
        drop(shared);
        self.work.notify_all();
        Ok(connected)
    }

    /// Block until there is a connection to serve or the server stops.
    ///
    /// `None` means shutdown was observed; the worker must terminate. Any
    /// handles still queued at that point are left for `clear_queue`.
    pub fn wait_for_work(&self) -> Option<ConnectionHandle> {
        let mut shared = self.shared.lock();
        // Both predicates are re-checked after every wake
        while shared.running && shared.queue.is_empty() {
            self.work.wait(&mut shared);
        }
        if !shared.running {
            return None;
        }
        let conn = shared.queue.dequeue()?;
        shared.active += 1;
        drop(shared);
        // Let other idle workers re-evaluate the queue
        self.work.notify_all();
        Some(conn)
    }

    /// Account for a session that has ended. Returns the remaining connected count.
    pub fn finish_session(&self) -> usize {
        let mut shared = self.shared.lock();
        shared.active = shared.active.saturating_sub(1);
        shared.connected = shared.connected.saturating_sub(1);
        let connected = shared.connected;
        drop(shared);
        self.work.notify_all();
        connected
    }

    /// Close every connection still waiting in the queue. Shutdown only.
    pub fn clear_queue(&self) -> usize {
        let mut shared = self.shared.lock();
        let dropped = shared.queue.clear();
        shared.connected = shared.connected.saturating_sub(dropped);
        dropped
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let shared = self.shared.lock();
        StateSnapshot {
            running: shared.running,
            connected: shared.connected,
            active: shared.active,
            queued: shared.queue.len(),
            queue_capacity: shared.queue.capacity(),
        }
    }

    /// Wait until no connection is queued or being served, up to `timeout`.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut shared = self.shared.lock();
        while shared.connected > 0 {
            if self.work.wait_until(&mut shared, deadline).timed_out() {
                return shared.connected == 0;
            }
        }
        true
    }
}
