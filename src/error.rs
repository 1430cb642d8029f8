//! Error types for the image proxy.
//!
//! Errors fall into three classes that decide how the server reacts:
//!
//! - **transport** errors corrupt the control channel and end the connection
//! - **sequencing** errors (bad method, bad arguments, unknown ids) become a
//!   `success=false` reply and the connection stays usable
//! - **backend** errors come from the image backend and are also replied,
//!   possibly deferred until `FinishPipe` when they happen mid-stream

use thiserror::Error;

/// Main error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    // ─────────────────────────────────────────────────────────────────────
    // Transport Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("message of {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("received message was truncated (limit {max} bytes)")]
    MessageTruncated { max: usize },

    #[error("expected at most one file descriptor, received {0}")]
    TooManyFds(usize),

    #[error("short write: sent {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("malformed reply: {0}")]
    MalformedReply(String),

    // ─────────────────────────────────────────────────────────────────────
    // Sequencing Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("must call Initialize before {0}")]
    NotInitialized(String),

    #[error("Initialize has already been called")]
    AlreadyInitialized,

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid arguments for {method}: {reason}")]
    InvalidArgs { method: String, reason: String },

    #[error("no such image: {0}")]
    NoSuchImage(u32),

    #[error("no such pipe: {0}")]
    NoSuchPipe(u32),

    #[error("unexpected file descriptor attached to {0}")]
    UnexpectedFd(String),

    // ─────────────────────────────────────────────────────────────────────
    // Backend Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("invalid image reference {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("backend error: {0}")]
    Backend(String),

    // ─────────────────────────────────────────────────────────────────────
    // Client Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("remote error in {method}: {message}")]
    Remote { method: String, message: String },

    #[error("incompatible proxy version {actual}, expected {expected}.x")]
    IncompatibleVersion { expected: String, actual: String },

    #[error("proxy process failed: {0}")]
    ProcessFailed(String),

    // ─────────────────────────────────────────────────────────────────────
    // Wrapped Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    Nix(#[from] nix::errno::Errno),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Whether this error leaves the control channel unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProxyError::MessageTooLarge { .. }
                | ProxyError::MessageTruncated { .. }
                | ProxyError::TooManyFds(_)
                | ProxyError::ShortWrite { .. }
                | ProxyError::ConnectionClosed
                | ProxyError::MalformedReply(_)
                | ProxyError::Io(_)
                | ProxyError::Nix(_)
        )
    }

    pub(crate) fn invalid_args(method: impl Into<String>, reason: impl Into<String>) -> Self {
        ProxyError::InvalidArgs {
            method: method.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
