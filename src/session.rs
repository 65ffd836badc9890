//! Per-connection command loop
//!
//! A session reads a 4-byte command code, then the command's sub-command or
//! arguments, hands the work to the `FileStore`, and loops until the client
//! exits, disconnects, or breaks the protocol.

use anyhow::Result;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::logger::Logger;
use crate::pool::ConnectionHandler;
use crate::protocol::{subcommand, Command};
use crate::protocol_core::{read_i32, read_string, read_u32, trim_literal};
use crate::state::{ConnectionHandle, ServerState};
use crate::transfer::{DownloadOutcome, FileStore, UploadOutcome, UploadSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitCommand,
    AwaitSubcommand,
    Transferring,
    Closing,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client sent EXIT with the matching sub-command
    Exited,
    PeerClosed,
    InvalidCommand(u32),
    ProtocolViolation(String),
    TransferFailed(String),
    IdleTimeout,
    /// Server stopped between commands
    Shutdown,
    Io(String),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Exited => write!(f, "client exit"),
            SessionEnd::PeerClosed => write!(f, "peer closed"),
            SessionEnd::InvalidCommand(code) => write!(f, "invalid command {}", code),
            SessionEnd::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            SessionEnd::TransferFailed(msg) => write!(f, "transfer failed: {}", msg),
            SessionEnd::IdleTimeout => write!(f, "idle timeout"),
            SessionEnd::Shutdown => write!(f, "server shutdown"),
            SessionEnd::Io(msg) => write!(f, "i/o error: {}", msg),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub commands: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

enum Step {
    Continue,
    Close(SessionEnd),
}

pub struct Session<'a, S> {
    id: u64,
    stream: S,
    store: &'a FileStore,
    logger: &'a dyn Logger,
    phase: SessionPhase,
    command: Option<Command>,
    exiting: bool,
    stats: SessionStats,
}

impl<'a, S: Read + Write> Session<'a, S> {
    pub fn new(id: u64, stream: S, store: &'a FileStore, logger: &'a dyn Logger) -> Self {
        Session {
            id,
            stream,
            store,
            logger,
            phase: SessionPhase::AwaitCommand,
            command: None,
            exiting: false,
            stats: SessionStats::default(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Most recent valid command code received, if any.
    pub fn last_command(&self) -> Option<Command> {
        self.command
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting
    }

    pub fn into_stream(self) -> S {
        self.stream
    }

    /// Serve commands until the session ends.
    ///
    /// `keep_running` is consulted before each command; an in-flight command
    /// is never interrupted.
    pub fn run(&mut self, keep_running: impl Fn() -> bool) -> SessionEnd {
        let end = loop {
            if !keep_running() {
                break SessionEnd::Shutdown;
            }
            match self.step() {
                Ok(Step::Continue) => {}
                Ok(Step::Close(end)) => break end,
                Err(e) => break classify(&e),
            }
        };
        self.phase = SessionPhase::Closing;
        end
    }

    fn step(&mut self) -> Result<Step> {
        self.phase = SessionPhase::AwaitCommand;

        let code = match read_u32(&mut self.stream)? {
            Some(code) => code,
            None => return Ok(Step::Close(SessionEnd::PeerClosed)),
        };
        let command = match Command::from_code(code) {
            Some(c) => c,
            None => {
                warn!(conn = self.id, code, "invalid command received, closing");
                return Ok(Step::Close(SessionEnd::InvalidCommand(code)));
            }
        };
        self.command = Some(command);
        self.stats.commands += 1;
        debug!(conn = self.id, %command, "command received");

        self.phase = SessionPhase::AwaitSubcommand;
        match command {
            Command::List => self.list(),
            Command::Download => self.download(),
            Command::Upload => self.upload(),
            Command::Exit => self.exit(),
        }
    }

    fn list(&mut self) -> Result<Step> {
        let sub = match read_string(&mut self.stream)? {
            Some(s) => s,
            None => return Ok(Step::Close(SessionEnd::PeerClosed)),
        };
        // A typo here is not worth dropping the client over
        if trim_literal(&sub) != subcommand::LIST {
            warn!(conn = self.id, received = %sub, "invalid list sub-command ignored");
            return Ok(Step::Continue);
        }

        self.phase = SessionPhase::Transferring;
        let entries = self.store.list(&mut self.stream)?;
        self.logger.listed(self.id, entries);
        info!(conn = self.id, entries, "directory list sent");
        Ok(Step::Continue)
    }

    fn download(&mut self) -> Result<Step> {
        let name = match read_string(&mut self.stream)? {
            Some(s) => s,
            None => return Ok(Step::Close(SessionEnd::PeerClosed)),
        };

        self.phase = SessionPhase::Transferring;
        match self.store.download(&name, &mut self.stream)? {
            DownloadOutcome::Sent(bytes) => {
                self.stats.bytes_sent += bytes;
                self.logger.download_done(self.id, &name, bytes);
                info!(conn = self.id, file = %name, bytes, "download complete");
                Ok(Step::Continue)
            }
            DownloadOutcome::NotFound(reason) => {
                self.logger.error(self.id, "download", &name, &reason);
                info!(conn = self.id, file = %name, %reason, "download refused");
                Ok(Step::Continue)
            }
            DownloadOutcome::Aborted { sent, reason } => {
                self.stats.bytes_sent += sent;
                self.logger.error(self.id, "download", &name, &reason);
                warn!(conn = self.id, file = %name, sent, %reason, "download aborted");
                Ok(Step::Close(SessionEnd::TransferFailed(reason)))
            }
        }
    }

    fn upload(&mut self) -> Result<Step> {
        let sub = match read_string(&mut self.stream)? {
            Some(s) => s,
            None => return Ok(Step::Close(SessionEnd::PeerClosed)),
        };
        // The body that follows cannot be skipped reliably, so a bad
        // sub-command ends the session
        if trim_literal(&sub) != subcommand::UPLOAD {
            warn!(conn = self.id, received = %sub, "invalid upload sub-command");
            return Ok(Step::Close(SessionEnd::ProtocolViolation(format!(
                "expected {:?}, got {:?}",
                subcommand::UPLOAD,
                sub
            ))));
        }

        // A missing or cut-off size is treated like the client's own abort
        // sentinel, so the failure is still logged and NACKed
        let size = match read_i32(&mut self.stream) {
            Ok(Some(v)) => UploadSize::from_wire(v),
            Ok(None) => UploadSize::Failed,
            Err(e) => {
                debug!(conn = self.id, error = %e, "upload size read failed");
                UploadSize::Failed
            }
        };
        let name = match size {
            UploadSize::Failed => String::new(),
            UploadSize::Bytes(_) => match read_string(&mut self.stream)? {
                Some(s) => s,
                None => return Ok(Step::Close(SessionEnd::PeerClosed)),
            },
        };

        self.phase = SessionPhase::Transferring;
        let outcome = self.store.upload(&name, size, &mut self.stream);
        match outcome {
            Ok(UploadOutcome::Stored { bytes, replaced }) => {
                self.stats.bytes_received += bytes;
                self.logger.upload_done(self.id, &name, bytes);
                info!(conn = self.id, file = %name, bytes, replaced, "upload complete");
                Ok(Step::Continue)
            }
            Ok(UploadOutcome::Rejected(reason)) => {
                self.logger.error(self.id, "upload", &name, &reason);
                warn!(conn = self.id, file = %name, %reason, "upload failed");
                Ok(Step::Close(SessionEnd::TransferFailed(reason)))
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                self.logger.error(self.id, "upload", &name, &reason);
                warn!(conn = self.id, file = %name, %reason, "upload failed");
                Ok(Step::Close(SessionEnd::TransferFailed(reason)))
            }
        }
    }

    fn exit(&mut self) -> Result<Step> {
        let sub = match read_string(&mut self.stream)? {
            Some(s) => s,
            None => return Ok(Step::Close(SessionEnd::PeerClosed)),
        };
        if trim_literal(&sub) == subcommand::EXIT {
            self.exiting = true;
            info!(conn = self.id, "client has ended the connection");
            return Ok(Step::Close(SessionEnd::Exited));
        }
        warn!(conn = self.id, received = %sub, "invalid exit sub-command ignored");
        Ok(Step::Continue)
    }
}

fn classify(e: &anyhow::Error) -> SessionEnd {
    // Directory enumeration failures are on our side, not the client's
    if e.downcast_ref::<walkdir::Error>().is_some() {
        return SessionEnd::Io(format!("{:#}", e));
    }
    match e.downcast_ref::<io::Error>() {
        Some(io_err) => match io_err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => SessionEnd::PeerClosed,
            // Read timeouts surface as WouldBlock on unix and TimedOut on windows
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => SessionEnd::IdleTimeout,
            _ => SessionEnd::Io(format!("{:#}", e)),
        },
        None => SessionEnd::ProtocolViolation(format!("{:#}", e)),
    }
}

/// Production connection handler: runs a `Session` over the accepted socket.
pub struct ProtocolEngine {
    store: FileStore,
    logger: Arc<dyn Logger>,
    state: Arc<ServerState>,
    idle_timeout: Option<Duration>,
}

impl ProtocolEngine {
    pub fn new(
        store: FileStore,
        logger: Arc<dyn Logger>,
        state: Arc<ServerState>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        ProtocolEngine {
            store,
            logger,
            state,
            idle_timeout,
        }
    }
}

impl ConnectionHandler for ProtocolEngine {
    fn handle(&self, mut conn: ConnectionHandle) {
        let id = conn.id();
        let peer = conn.peer();
        if let Some(timeout) = self.idle_timeout {
            if let Err(e) = conn.stream().set_read_timeout(Some(timeout)) {
                warn!(conn = id, error = %e, "could not set idle timeout");
            }
        }
        self.logger.connected(id, peer);
        info!(conn = id, %peer, "serving connection");

        let mut session = Session::new(id, conn.stream(), &self.store, self.logger.as_ref());
        let end = session.run(|| self.state.is_running());
        let stats = session.stats();
        let last_command = session.last_command().map(|c| c.to_string());

        info!(
            conn = id,
            %peer,
            reason = %end,
            last_command = last_command.as_deref().unwrap_or("-"),
            commands = stats.commands,
            bytes_sent = stats.bytes_sent,
            bytes_received = stats.bytes_received,
            "session closed"
        );
        self.logger.disconnected(id, &end.to_string());
        conn.close();
    }
}
