use std::fmt;

use thiserror::Error;

/// WebSocket close code and reason as observed on (or synthesized for) a
/// closing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    pub code: u16,
    pub reason: String,
}

impl CloseStatus {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Local marker for a connection that ended without a close frame.
    pub fn abnormal() -> Self {
        Self::new(1006, "abnormal closure")
    }

    /// Local marker for a close we initiated ourselves.
    pub fn local(reason: impl Into<String>) -> Self {
        Self::new(1000, reason)
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

/// Everything that can go wrong while driving a voice session.
#[derive(Debug, Error)]
pub enum VoiceGatewayError {
    /// Malformed or out-of-order payload. Never retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The control WebSocket closed; classified by the reconnect policy.
    #[error("voice gateway closed with {0}")]
    Close(CloseStatus),

    /// UDP bind, connect or IP discovery failure. Retryable through the
    /// injected discovery retry spec, then escalates to an abrupt retry.
    #[error("UDP socket setup error: {0}")]
    SocketSetup(String),

    /// A bounded wait elapsed; carries retryable semantics.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Internal sentinel: the upstream re-homed the session, rebuild it
    /// against the new endpoint.
    #[error("voice server update requires a reconnect")]
    ServerMigration,

    /// Internal sentinel: the caller asked for a reconnect of a live session.
    #[error("reconnect requested")]
    Reconnect,

    /// WebSocket transport failure below the payload layer.
    #[error("websocket transport error: {0}")]
    Transport(String),

    #[error("gateway client is not active")]
    NotActive,

    #[error("gateway client was already started")]
    AlreadyActive,
}
