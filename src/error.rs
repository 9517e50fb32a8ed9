//! Error types for the Twitch toolkit

use thiserror::Error;

/// Result type alias for toolkit operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when using the PubSub or Webhook channels
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The hub answered an outbound request with a non-success status
    #[error("API error: {0}")]
    Api(String),

    /// Invalid or missing parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Topic kind not known to the resolver
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// Malformed inbound frame or request
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No subscription with the given id
    #[error("Not found: {0}")]
    NotFound(String),

    /// The server answered a request with an error
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The hub denied a subscription
    #[error("Hub subscription denied. Reason: {0}")]
    Denied(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The connection dropped while the request was pending
    #[error("Connection lost before a response was received")]
    ConnectionLost,

    /// The channel was closed by the caller
    #[error("Channel closed")]
    Closed,

    /// A pending request outlived its time-to-live
    #[error("Pending request expired")]
    Expired,

    /// No confirmation arrived within the configured bound
    #[error("Timed out waiting for confirmation")]
    Timeout,

    /// A pending request was superseded
    #[error("Cancelled: {0}")]
    Cancelled(String),
}
