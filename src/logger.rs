//! Transfer audit log
//!
//! Console diagnostics go through `tracing`; this is the optional
//! per-event record of what each session did, written to a file.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;

use crate::log::{TransferEvent, TransferLogEntry};

pub trait Logger: Send + Sync {
    fn connected(&self, _conn: u64, _peer: SocketAddr) {}
    fn listed(&self, _conn: u64, _entries: usize) {}
    fn download_done(&self, _conn: u64, _name: &str, _bytes: u64) {}
    fn upload_done(&self, _conn: u64, _name: &str, _bytes: u64) {}
    fn error(&self, _conn: u64, _context: &str, _name: &str, _msg: &str) {}
    fn disconnected(&self, _conn: u64, _reason: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn connected(&self, conn: u64, peer: SocketAddr) {
        self.line(&format!("CONNECT conn={conn} peer={peer}"));
    }
    fn listed(&self, conn: u64, entries: usize) {
        self.line(&format!("LIST conn={conn} entries={entries}"));
    }
    fn download_done(&self, conn: u64, name: &str, bytes: u64) {
        self.line(&format!("DOWNLOAD conn={conn} file={name} bytes={bytes}"));
    }
    fn upload_done(&self, conn: u64, name: &str, bytes: u64) {
        self.line(&format!("UPLOAD conn={conn} file={name} bytes={bytes}"));
    }
    fn error(&self, conn: u64, context: &str, name: &str, msg: &str) {
        self.line(&format!("ERROR conn={conn} ctx={context} file={name} msg={msg}"));
    }
    fn disconnected(&self, conn: u64, reason: &str) {
        self.line(&format!("DISCONNECT conn={conn} reason={reason}"));
    }
}

/// JSON lines variant of the audit log.
pub struct JsonLogger {
    file: Mutex<File>,
}

impl JsonLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .with_context(|| format!("open audit log {}", path.as_ref().display()))?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn record(&self, conn: u64, event: TransferEvent, file: Option<&str>, bytes: u64, detail: Option<String>) {
        let mut entry = TransferLogEntry::now(conn, event);
        entry.file = file.map(str::to_string);
        entry.bytes = bytes;
        entry.detail = detail;
        let mut f = self.file.lock();
        if let Err(e) = entry.write_line(&mut *f) {
            tracing::warn!(error = %e, "audit log write failed");
        }
    }
}

impl Logger for JsonLogger {
    fn connected(&self, conn: u64, peer: SocketAddr) {
        self.record(conn, TransferEvent::Connected, None, 0, Some(peer.to_string()));
    }
    fn listed(&self, conn: u64, entries: usize) {
        self.record(conn, TransferEvent::List, None, entries as u64, None);
    }
    fn download_done(&self, conn: u64, name: &str, bytes: u64) {
        self.record(conn, TransferEvent::Download, Some(name), bytes, None);
    }
    fn upload_done(&self, conn: u64, name: &str, bytes: u64) {
        self.record(conn, TransferEvent::Upload, Some(name), bytes, None);
    }
    fn error(&self, conn: u64, context: &str, name: &str, msg: &str) {
        self.record(conn, TransferEvent::Error, Some(name), 0, Some(format!("{context}: {msg}")));
    }
    fn disconnected(&self, conn: u64, reason: &str) {
        self.record(conn, TransferEvent::Disconnected, None, 0, Some(reason.to_string()));
    }
}
