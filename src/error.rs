//! Error taxonomy and the reporting seam.
//!
//! Nothing in the streaming path returns these to its caller. Failures are
//! absorbed where they happen and handed to an [`ErrorReporter`], so the
//! user-visible effect of any of them is just "no prediction appears".

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failures absorbed by the connection manager and the capture loop.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("WebSocket transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("malformed inbound message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("inbound message is missing field `{0}`")]
    MissingField(&'static str),
    #[error("unexpected binary frame of {0} bytes from server")]
    UnexpectedBinary(usize),
    #[error("class index {index} has no probability ({len} probabilities)")]
    InconsistentIndices { index: u32, len: usize },
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),
}

/// Failures of a capture collaborator.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no capture source available: {0}")]
    Unavailable(String),
    #[error("capture device error: {0}")]
    Device(String),
    #[error("frame encoding failed: {0}")]
    Encode(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("capture source has stopped")]
    Stopped,
}

/// Invalid runtime configuration, rejected before anything connects.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid endpoint `{endpoint}`: {reason}")]
    Endpoint { endpoint: String, reason: String },
    #[error("capture interval must be non-zero")]
    ZeroInterval,
    #[error("write timeout must be non-zero")]
    ZeroWriteTimeout,
    #[error("{name} must be in (0, 1], got {value}")]
    Ratio { name: &'static str, value: f32 },
}

/// Coarse classification of a [`StreamError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    MalformedMessage,
    Capture,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::MalformedMessage => "malformed_message",
            ErrorKind::Capture => "capture",
        }
    }
}

impl StreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamError::Transport(_) | StreamError::Tls(_) => ErrorKind::Transport,
            StreamError::Malformed(_)
            | StreamError::MissingField(_)
            | StreamError::UnexpectedBinary(_)
            | StreamError::InconsistentIndices { .. } => ErrorKind::MalformedMessage,
            StreamError::Capture(_) => ErrorKind::Capture,
        }
    }
}

/// Destination for absorbed failures.
///
/// Implementations must not block: they are called from inside the link task
/// and capture cycles.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &StreamError);
}

/// Default reporter: one structured `warn` event per failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, error: &StreamError) {
        tracing::warn!(kind = error.kind().as_str(), "{}", error);
    }
}
