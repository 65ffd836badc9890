//! Shared protocol constants for the fsrv wire format
//!
//! Every fixed-width integer on the wire is big-endian (network order).

// Default and hard cap for the worker pool size
pub const MAX_CLIENTS: usize = 50;

// Default capacity of the admission queue
pub const MAX_QUEUE: usize = 50;

// Longest sub-command or filename accepted from a client
pub const MAX_STR_LEN: usize = 255;

// Download payload is streamed in chunks of this size (last may be shorter)
pub const CHUNK_SIZE: usize = 1024;

// Receive buffer for uploads
pub const UPLOAD_BUF_SIZE: usize = 64 * 1024;

// Negative size/ack value signalling failure
pub const SENTINEL: i32 = -1;

// Port range accepted by the daemon
pub const MIN_PORT: u16 = 1025;
pub const MAX_PORT: u16 = 65535;

pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_ROOT: &str = "FileServer";

// How long the accept loop sleeps before re-checking the running flag (ms)
pub const ACCEPT_POLL_MS: u64 = 50;

// Literal sub-commands that must follow their command code
pub mod subcommand {
    pub const LIST: &str = "ls";
    pub const UPLOAD: &str = "upload";
    pub const EXIT: &str = "exit";
}

/// Command codes (keep numeric stable for existing clients)
pub mod code {
    pub const LIST: u32 = 100;
    pub const DOWNLOAD: u32 = 200;
    pub const UPLOAD: u32 = 300;
    pub const EXIT: u32 = 500;
}

/// Operation selected by the 4-byte command code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    List,
    Download,
    Upload,
    Exit,
}

impl Command {
    pub fn from_code(value: u32) -> Option<Self> {
        match value {
            code::LIST => Some(Command::List),
            code::DOWNLOAD => Some(Command::Download),
            code::UPLOAD => Some(Command::Upload),
            code::EXIT => Some(Command::Exit),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Command::List => code::LIST,
            Command::Download => code::DOWNLOAD,
            Command::Upload => code::UPLOAD,
            Command::Exit => code::EXIT,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::List => "LIST",
            Command::Download => "DOWNLOAD",
            Command::Upload => "UPLOAD",
            Command::Exit => "EXIT",
        };
        f.write_str(name)
    }
}
