//! Error taxonomy for the client core.
//!
//! Retryability is decided on the structured kind, never by matching
//! message text: transport failures are transient, protocol errors are
//! transient only for 5xx responses.

use hyper::StatusCode;
use thiserror::Error;

/// Errors produced by the client core.
#[derive(Error, Debug)]
pub enum Error {
    /// Input rejected before any I/O (empty bucket/key, bad part size,
    /// too many parts, empty parts list).
    #[error("validation error: {0}")]
    Validation(String),

    /// Credential acquisition or refresh failed (IMDSv2 token fetch,
    /// role fetch, malformed credential JSON).
    #[error("auth error: {0}")]
    Auth(String),

    /// Network-level failure: connect, TLS, timeout, reset, EOF.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx HTTP response from the service.
    #[error("S3 error: {status} - {message}")]
    Protocol { status: StatusCode, message: String },

    /// XML or JSON (de)serialization failure.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Missing credentials, malformed endpoint, bad client setup.
    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the multipart retry policy may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Protocol { status, .. } => status.is_server_error(),
            _ => false,
        }
    }

    /// Builds a protocol error from a response, keeping a bounded excerpt
    /// of the body so server diagnostics survive into the message.
    pub(crate) fn protocol(status: StatusCode, body: &[u8]) -> Self {
        const EXCERPT: usize = 512;
        let text = String::from_utf8_lossy(&body[..body.len().min(EXCERPT)]).into_owned();
        Error::Protocol { status, message: text }
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::Encoding(format!("XML parse error: {}", err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Encoding(format!("JSON error: {}", err))
    }
}
