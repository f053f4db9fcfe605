//! Core session traits and types.

use async_trait::async_trait;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::error::ErrorKind;

/// One reply record: attribute name to value.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Errors raised while talking to a device.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Network I/O error.
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout elapsed.
    #[error("timeout elapsed")]
    Timeout,

    /// Device rejected the credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Device refused a command.
    #[error("command '{command}' failed: {message}")]
    Trap { command: String, message: String },

    /// Device closed the session.
    #[error("session terminated by device: {0}")]
    Fatal(String),

    /// Malformed or unexpected reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Command returned no records where one was required.
    #[error("command '{0}' returned no data")]
    EmptyReply(String),
}

impl DeviceError {
    /// Failure category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout => ErrorKind::Timeout,
            _ => ErrorKind::Connection,
        }
    }
}

/// Decrypted login material for one connection attempt. Wiped on drop.
pub struct Credentials {
    pub address: String,
    pub username: String,
    pub password: Zeroizing<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A live, authenticated management channel to one device.
///
/// Commands issued on one session complete in the order they are issued.
#[async_trait]
pub trait DeviceSession: Send {
    /// Run one command and collect its reply records.
    async fn run_command(
        &mut self,
        command: &str,
        args: &[(&str, &str)],
    ) -> Result<Vec<Record>, DeviceError>;

    /// Tear the session down. Errors are swallowed; the transport is gone either way.
    async fn close(&mut self);
}

/// Transport capable of opening sessions.
///
/// Implement this trait to support a new management protocol.
#[async_trait]
pub trait DeviceConnector: Send + Sync + 'static {
    /// Short transport label used in logs.
    fn transport(&self) -> &str;

    /// Whether the transport allows only one live session per device.
    fn exclusive_sessions(&self) -> bool {
        false
    }

    /// Perform the handshake and return an authenticated session.
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn DeviceSession>, DeviceError>;
}
