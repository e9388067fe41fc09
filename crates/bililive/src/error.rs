//! Danmaku error types.

use thiserror::Error;

use crate::RoomId;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, DanmakuError>;

/// Errors that can occur while talking to the danmaku relay.
#[derive(Error, Debug)]
pub enum DanmakuError {
    /// The room-init endpoint rejected the room id.
    #[error("Room {0} not found")]
    RoomNotFound(RoomId),

    /// Malformed or failed discovery response.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Dialing or writing to a relay endpoint failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Frame header or auth handshake violated the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A payload could not be decoded into an event.
    #[error("Decode error: {0}")]
    Decode(String),

    /// `join` was called for a room that is already registered.
    #[error("Room {0} already exists")]
    RoomExists(RoomId),

    /// The engine must be started first.
    #[error("Engine has not been started")]
    NotStarted,

    /// `start` was called twice.
    #[error("Engine already started")]
    AlreadyStarted,

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP errors from the discovery collaborator
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl DanmakuError {
    /// Create a discovery error.
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// The platform refused the room or answered discovery with an unusable
    /// document. Fatal while a session is still resolving its first route,
    /// an ordinary reconnect failure afterwards.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::RoomNotFound(_) | Self::Discovery(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections() {
        assert!(DanmakuError::RoomNotFound(1).is_rejection());
        assert!(DanmakuError::discovery("bad json").is_rejection());
        assert!(!DanmakuError::connection("refused").is_rejection());
        assert!(!DanmakuError::protocol("short header").is_rejection());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            DanmakuError::RoomExists(100).to_string(),
            "Room 100 already exists"
        );
        assert_eq!(
            DanmakuError::protocol("length 3 < 16").to_string(),
            "Protocol error: length 3 < 16"
        );
    }
}
