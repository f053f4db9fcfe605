//! Error classification shared by logs, events and API responses.

use serde::Serialize;
use strum_macros::{AsRefStr, Display};

/// Coarse failure category attached to every reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Caller supplied invalid input.
    Validation,
    /// Unknown device id.
    NotFound,
    /// Stored secret could not be decrypted (key drift or corruption).
    Decryption,
    /// Device unreachable, refused the login or failed a command.
    Connection,
    /// Metrics sink rejected the sample.
    Sink,
    /// Local database failure.
    Storage,
    /// Deadline elapsed.
    Timeout,
    /// Device task panicked.
    Panic,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(ErrorKind::NotFound.as_ref(), "not_found");
        assert_eq!(ErrorKind::Decryption.to_string(), "decryption");
        assert_eq!(ErrorKind::Panic.as_ref(), "panic");
        assert_eq!(
            serde_json::to_value(ErrorKind::Connection).unwrap(),
            serde_json::json!("connection")
        );
    }
}
