//! Error types for Parley

use thiserror::Error;

/// Result type alias for Parley operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Parley
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Microphone capture error
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Chat endpoint error
    #[error(transparent)]
    Chat(#[from] ChatError),

    /// Action dispatch error
    #[error(transparent)]
    Action(#[from] ActionError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Terminal failure of a capture session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The OS refused microphone access
    #[error("microphone permission denied")]
    PermissionDenied,

    /// Another consumer owns the microphone
    #[error("microphone is busy")]
    DeviceBusy,

    /// The audio route failed (device unplugged, stream error)
    #[error("audio route error: {0}")]
    Route(String),

    /// The speech recognizer failed without producing a transcript
    #[error("recognizer error: {0}")]
    Recognizer(String),
}

/// Failure class of a chat request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Unreachable,
    NoNetwork,
    ServerStatus,
    DecodeError,
    Cancelled,
    InvalidRequest,
}

impl FailureKind {
    /// Stable label used in logs and user notices
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Unreachable => "unreachable",
            Self::NoNetwork => "no-network",
            Self::ServerStatus => "server-status",
            Self::DecodeError => "decode-error",
            Self::Cancelled => "cancelled",
            Self::InvalidRequest => "invalid-request",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the chat client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Request or stream read timed out
    #[error("request timed out")]
    Timeout,

    /// Endpoint refused or dropped the connection
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// Name resolution failed or no route to the network
    #[error("no network: {0}")]
    NoNetwork(String),

    /// Endpoint answered with a non-2xx status
    #[error("server returned {code}: {body}")]
    Status { code: u16, body: String },

    /// Response body could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Request was cancelled by the caller
    #[error("request cancelled")]
    Cancelled,

    /// Request could not be built (bad URL, missing settings)
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ChatError {
    /// Failure class of this error
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout => FailureKind::Timeout,
            Self::Unreachable(_) => FailureKind::Unreachable,
            Self::NoNetwork(_) => FailureKind::NoNetwork,
            Self::Status { .. } => FailureKind::ServerStatus,
            Self::Decode(_) => FailureKind::DecodeError,
            Self::Cancelled => FailureKind::Cancelled,
            Self::InvalidRequest(_) => FailureKind::InvalidRequest,
        }
    }

    /// Whether the whole request is worth retrying
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unreachable(_) | Self::NoNetwork(_))
    }

    /// Classify a transport-level `reqwest` failure
    #[must_use]
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        if err.is_decode() {
            return Self::Decode(err.to_string());
        }
        if err.is_builder() {
            return Self::InvalidRequest(err.to_string());
        }
        if let Some(status) = err.status() {
            return Self::Status {
                code: status.as_u16(),
                body: String::new(),
            };
        }

        let chain = error_chain(err);
        let lower = chain.to_lowercase();
        if lower.contains("dns error")
            || lower.contains("failed to lookup address")
            || lower.contains("name or service not known")
            || lower.contains("network is unreachable")
        {
            return Self::NoNetwork(chain);
        }

        if let Some(kind) = io_error_kind(err) {
            use std::io::ErrorKind;
            match kind {
                ErrorKind::TimedOut => return Self::Timeout,
                ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof => return Self::Unreachable(chain),
                _ => {}
            }
        }

        if err.is_connect() || err.is_request() || err.is_body() {
            return Self::Unreachable(chain);
        }

        Self::Decode(chain)
    }
}

/// Errors from resolving or dispatching an action directive
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// The directive had no action name
    #[error("directive has no action name")]
    MissingName,

    /// No executor handles this action
    #[error("unsupported action: {0}")]
    Unsupported(String),

    /// A parameter was missing or malformed
    #[error("invalid parameter {key}: {reason}")]
    InvalidParameter { key: String, reason: String },

    /// The executor ran but failed
    #[error("action failed: {0}")]
    Failed(String),
}

/// Flatten an error and its sources into one line
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out
}

/// Find the first `std::io::Error` in the source chain
fn io_error_kind(err: &(dyn std::error::Error + 'static)) -> Option<std::io::ErrorKind> {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = inner.source();
    }
    None
}
