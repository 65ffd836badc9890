//! fsrv library
//!
//! Thread-pooled TCP file server: bounded admission queue, fixed worker pool
//! and a small length-prefixed list/download/upload protocol rooted at one
//! directory.

pub mod cli;
pub mod client;
pub mod config;
pub mod log;
pub mod logger;
pub mod net;
pub mod pool;
pub mod protocol;
pub mod protocol_core;
pub mod queue;
pub mod session;
pub mod state;
pub mod transfer;

#[cfg(test)]
mod test_util;
