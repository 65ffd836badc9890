//! Shared CLI helpers and small reusable Clap fragments

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{LogFormat, ServerConfig};
use crate::protocol::{DEFAULT_BIND, DEFAULT_ROOT, MAX_CLIENTS, MAX_QUEUE, MAX_PORT, MIN_PORT};

/// Daemon options for fsrvd
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "fsrvd - thread-pooled TCP file server")]
pub struct DaemonOpts {
    /// Port to listen on (1025-65535)
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(MIN_PORT as i64..=MAX_PORT as i64))]
    pub port: u16,

    /// Worker threads / concurrent clients (default and max: 50)
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Bind address
    #[arg(long, default_value = DEFAULT_BIND)]
    pub bind: IpAddr,

    /// Root directory to serve
    #[arg(long, default_value = DEFAULT_ROOT)]
    pub root: PathBuf,

    /// Connections allowed to wait for a free worker
    #[arg(long, default_value_t = MAX_QUEUE)]
    pub queue: usize,

    /// Close sessions idle for this many seconds (default: never)
    #[arg(long = "idle-timeout")]
    pub idle_timeout: Option<u64>,

    /// Write a transfer audit log to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Audit log format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Debug-level console logging (RUST_LOG overrides)
    #[arg(short, long)]
    pub verbose: bool,
}

impl DaemonOpts {
    /// Validate and convert into a `ServerConfig`.
    pub fn into_config(self) -> Result<ServerConfig> {
        let threads = match self.threads {
            None => MAX_CLIENTS,
            Some(0) => bail!("invalid thread count 0, must be >= 1"),
            Some(n) if n > MAX_CLIENTS => {
                tracing::warn!(
                    requested = n,
                    max = MAX_CLIENTS,
                    "server cannot hold more than {} clients, using {}",
                    MAX_CLIENTS,
                    MAX_CLIENTS
                );
                MAX_CLIENTS
            }
            Some(n) => n,
        };
        if self.queue == 0 {
            bail!("queue capacity must be >= 1");
        }
        let idle_timeout = match self.idle_timeout {
            Some(0) => bail!("idle timeout must be >= 1 second"),
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };
        Ok(ServerConfig {
            bind: self.bind,
            port: self.port,
            root: self.root,
            threads,
            queue_capacity: self.queue,
            idle_timeout,
            log_file: self.log_file,
            log_format: self.log_format,
        })
    }
}

/// Client options for fsrv
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "fsrv - client for an fsrvd file server")]
pub struct ClientOpts {
    /// Server host
    #[arg(long, default_value = DEFAULT_BIND)]
    pub host: String,

    /// Server port
    #[arg(short, long)]
    pub port: u16,

    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// List files on the server
    Ls,
    /// Download a file
    Get {
        remote: String,
        /// Local path (defaults to the remote name)
        local: Option<PathBuf>,
    },
    /// Upload a file
    Put {
        local: PathBuf,
        /// Name on the server (defaults to the local file name)
        remote: Option<String>,
    },
}
