//! Connection admission: the accept loop in front of the worker pool
//!
//! The listener is non-blocking and polled, so the loop notices the running
//! flag going false within `ACCEPT_POLL_MS` even when nobody connects.

use anyhow::{Context, Result};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::logger::Logger;
use crate::pool::WorkerPool;
use crate::protocol::ACCEPT_POLL_MS;
use crate::session::ProtocolEngine;
use crate::state::{ConnectionHandle, Refusal, ServerState};
use crate::transfer::FileStore;

pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    pool: WorkerPool,
}

impl Server {
    /// Open the root, bind the listener and start the workers.
    ///
    /// Any failure here is fatal setup: nothing has been accepted yet.
    pub fn bind(config: &ServerConfig, logger: Arc<dyn Logger>) -> Result<Server> {
        let store = FileStore::open(&config.root)?;
        let addr = config.socket_addr();
        let listener = TcpListener::bind(addr).with_context(|| format!("bind {}", addr))?;
        listener
            .set_nonblocking(true)
            .context("set listener non-blocking")?;
        let local_addr = listener.local_addr()?;

        info!(root = %store.root().display(), "serving directory");
        let state = Arc::new(ServerState::new(config.threads, config.queue_capacity));
        let engine = Arc::new(ProtocolEngine::new(
            store,
            logger,
            Arc::clone(&state),
            config.idle_timeout,
        ));
        let pool = WorkerPool::start(config.threads, Arc::clone(&state), engine)?;

        Ok(Server {
            listener,
            local_addr,
            state,
            pool,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared state; call `shutdown()` on it to stop `run`.
    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Accept until shutdown, then stop the pool.
    pub fn run(mut self) -> Result<()> {
        info!(
            addr = %self.local_addr,
            workers = self.pool.size(),
            queue = self.state.snapshot().queue_capacity,
            "server listening"
        );
        let poll = Duration::from_millis(ACCEPT_POLL_MS);
        while self.state.is_running() {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(poll),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept error");
                    thread::sleep(poll);
                }
            }
        }

        info!("cleaning up resources");
        let dropped = self.pool.shutdown();
        let snap = self.state.snapshot();
        info!(dropped, connected = snap.connected, "server stopped");
        Ok(())
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        // Accepted sockets may inherit the listener's non-blocking mode
        if let Err(e) = stream.set_nonblocking(false) {
            warn!(%peer, error = %e, "could not configure accepted socket");
            return;
        }
        let _ = stream.set_nodelay(true);

        let conn = ConnectionHandle::new(self.state.next_connection_id(), peer, stream);
        match self.state.admit(conn) {
            Ok(connected) => info!(
                %peer,
                connected,
                allowed = self.state.max_clients(),
                "connection queued"
            ),
            Err((conn, Refusal::QueueFull)) => {
                warn!(%peer, "admission queue full, dropping connection");
                conn.close();
            }
            Err((conn, Refusal::ShuttingDown)) => {
                debug!(%peer, "shutting down, dropping connection");
                conn.close();
            }
        }
    }
}
