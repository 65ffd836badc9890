//! JSON lines record format for the transfer audit log

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Write;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferEvent {
    Connected,
    List,
    Download,
    Upload,
    Error,
    Disconnected,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransferLogEntry {
    /// RFC 3339, UTC
    pub timestamp: String,
    pub connection: u64,
    pub event: TransferEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TransferLogEntry {
    pub fn now(connection: u64, event: TransferEvent) -> Self {
        TransferLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            connection,
            event,
            file: None,
            bytes: 0,
            detail: None,
        }
    }

    /// Serialize as one line. The caller serialises concurrent writers.
    pub fn write_line<W: Write>(&self, w: &mut W) -> Result<()> {
        let mut line = serde_json::to_vec(self).context("encode audit entry")?;
        line.push(b'\n');
        w.write_all(&line)?;
        w.flush()?;
        Ok(())
    }
}
