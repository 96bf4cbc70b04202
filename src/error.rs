//! Error taxonomy for the gateway client.
//!
//! Each subsystem gets its own variant set rather than a single stringly
//! typed error, so callers can match on what actually went wrong instead of
//! grepping a message.

use thiserror::Error;

/// Top-level error returned from the public client surface.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("client is already running")]
    AlreadyStarted,

    #[error("client is not running")]
    NotStarted,
}

/// Errors surfaced on the transport's error channel.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("failed to dial {url}: {source}")]
    Dial { url: String, source: String },

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("not connected")]
    NotConnected,
}

impl TransportError {
    /// Whether the session core should treat this as grounds for a
    /// reconnect attempt, per the reconnectable-error substring list.
    pub fn is_reconnectable(&self) -> bool {
        let msg = self.to_string();
        msg.contains("use of closed network connection")
            || msg.contains("connection reset by peer")
            || msg.contains("EOF")
            || matches!(self, TransportError::NotConnected)
    }
}

/// Errors from the REST requester.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("http {status} on {route}: {body}")]
    Api {
        status: u16,
        route: String,
        body: String,
    },

    #[error("rate limited on {route}, retry after {retry_after:?}")]
    RateLimited {
        route: String,
        retry_after: std::time::Duration,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to (de)serialize body: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Terminal failure of the session core: both `Reconnect` and a fresh
/// `Connect` were exhausted. Delivered on the client's fatal-error channel
/// rather than aborting the process.
#[derive(Debug, Error, Clone)]
#[error("session core exhausted reconnect attempts: {0}")]
pub struct FatalSessionError(pub String);
