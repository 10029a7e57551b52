//! Narrow remote-file interface used by the transfer client.
//!
//! ASP exposes two directories: uploads go to the deposit directory and
//! feedback files show up in the withdrawal directory.
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

pub mod memory;
pub mod sftp;

pub use memory::MemoryTransport;
pub use sftp::SftpTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RemoteDir {
    Deposit,
    Withdrawal,
}

impl fmt::Display for RemoteDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteDir::Deposit => f.write_str("deposit"),
            RemoteDir::Withdrawal => f.write_str("withdrawal"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("remote {op} failed for {path}: {reason}")]
    Remote {
        op: &'static str,
        path: String,
        reason: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Writes `bytes` under `name` in the deposit directory. There is no way to
    /// confirm the file afterwards; returning `Ok` is the only success signal.
    async fn upload(&self, name: &str, bytes: &[u8]) -> Result<(), TransportError>;

    async fn list(&self, dir: RemoteDir) -> Result<Vec<String>, TransportError>;

    async fn download(&self, dir: RemoteDir, name: &str) -> Result<Vec<u8>, TransportError>;

    async fn delete(&self, dir: RemoteDir, name: &str) -> Result<(), TransportError>;
}
