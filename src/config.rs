//! Validated server configuration
//!
//! Built from the command line (`cli::DaemonOpts`) or directly in tests.

use anyhow::Result;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::logger::{JsonLogger, Logger, NoopLogger, TextLogger};
use crate::protocol::{DEFAULT_ROOT, MAX_CLIENTS, MAX_QUEUE};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: IpAddr,
    /// 0 picks an ephemeral port
    pub port: u16,
    pub root: PathBuf,
    /// Worker threads, also the advertised client capacity
    pub threads: usize,
    pub queue_capacity: usize,
    /// Read timeout for sessions; `None` waits forever
    pub idle_timeout: Option<Duration>,
    pub log_file: Option<PathBuf>,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            root: PathBuf::from(DEFAULT_ROOT),
            threads: MAX_CLIENTS,
            queue_capacity: MAX_QUEUE,
            idle_timeout: None,
            log_file: None,
            log_format: LogFormat::Text,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Audit logger selected by `log_file`/`log_format`.
    pub fn open_logger(&self) -> Result<Arc<dyn Logger>> {
        let logger: Arc<dyn Logger> = match (&self.log_file, self.log_format) {
            (None, _) => Arc::new(NoopLogger),
            (Some(p), LogFormat::Text) => Arc::new(TextLogger::new(p)?),
            (Some(p), LogFormat::Json) => Arc::new(JsonLogger::new(p)?),
        };
        Ok(logger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{TransferEvent, TransferLogEntry};

    #[test]
    fn test_socket_addr_uses_bind_and_port() {
        let cfg = ServerConfig {
            port: 9031,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.socket_addr().to_string(), "127.0.0.1:9031");
    }

    #[test]
    fn test_open_logger_follows_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let cfg = ServerConfig {
            log_file: Some(path.clone()),
            log_format: LogFormat::Json,
            ..ServerConfig::default()
        };
        let logger = cfg.open_logger().unwrap();
        logger.upload_done(3, "a.txt", 5);

        let text = std::fs::read_to_string(&path).unwrap();
        let entries: Vec<TransferLogEntry> =
            text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, TransferEvent::Upload);
        assert_eq!(entries[0].bytes, 5);
    }
}
