//! Error types for the secure memory engine and the chat client.
//!
//! No variant carries secret bytes. Messages are limited to lengths, field
//! names, status codes and positions.

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Failures of the secure allocator.
///
/// These are not retryable unless the caller reduces the number of
/// outstanding secure allocations first.
#[derive(Debug, Error)]
pub enum AllocError {
    /// The rounded request does not fit in `isize::MAX` bytes.
    #[error("secure allocation of {len} bytes is too large")]
    TooLarge { len: usize },

    /// The OS refused to map fresh pages.
    #[error("failed to map {len} bytes of secure memory: {source}")]
    Map {
        len: usize,
        #[source]
        source: io::Error,
    },

    /// The OS refused to lock the pages (lockable-memory limit reached).
    #[error("failed to lock {len} bytes of secure memory: {source}")]
    Lock {
        len: usize,
        #[source]
        source: io::Error,
    },
}

/// Input rejected before any network I/O.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A content part carried a `type` tag outside the known set.
    #[error("unknown content type `{0}`")]
    UnknownContentType(String),

    /// A required field was absent.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A field was present with the wrong shape (bytes vs. object).
    #[error("field `{0}` has an invalid shape")]
    InvalidField(&'static str),

    /// A message field is not valid UTF-8 and cannot be put on the wire.
    #[error("field `{0}` is not valid UTF-8")]
    InvalidUtf8(&'static str),

    /// A message was built without any content part.
    #[error("message content must not be empty")]
    EmptyContent,

    /// A completion was requested without any message.
    #[error("at least one message is required")]
    EmptyMessages,

    /// A completion was requested with an empty model name.
    #[error("model name must not be empty")]
    EmptyModel,

    /// A client was built with an empty base URL or API key.
    #[error("credential `{0}` must not be empty")]
    EmptyCredential(&'static str),
}

/// Failure reported by a transport collaborator.
///
/// Implementors must keep these free of request or response content.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection, DNS or TLS level failure.
    #[error("network failure: {0}")]
    Network(String),

    /// The remote answered with a non-success HTTP status.
    #[error("remote answered with HTTP status {0}")]
    Status(u16),

    /// The transport gave up waiting.
    #[error("request timed out")]
    Timeout,
}

/// Top-level error returned by every fallible public operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Allocation(#[from] AllocError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("network error: {0}")]
    Network(String),

    /// The remote rejected the credentials.
    #[error("authentication rejected with HTTP status {status}")]
    Auth { status: u16 },

    #[error("HTTP status error: {code}")]
    HttpStatus { code: u16 },

    /// The response body was not the expected JSON document.
    #[error("malformed response body ({category} error at line {line}, column {column})")]
    Parse {
        category: &'static str,
        line: usize,
        column: usize,
    },

    /// The response parsed but held no choice to extract.
    #[error("response contained no choices")]
    EmptyResponse,

    #[error("request timed out")]
    Timeout,

    /// The client was closed before or during the call.
    #[error("secure client used after close")]
    UseAfterClose,

    /// A non-blocking close found calls still running.
    #[error("secure client busy with {in_flight} in-flight call(s)")]
    Busy { in_flight: usize },
}

impl Error {
    /// Whether another attempt with a freshly built request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::HttpStatus { code } => *code == 429 || (500..600).contains(code),
            _ => false,
        }
    }

    pub(crate) fn from_json(err: &serde_json::Error) -> Self {
        use serde_json::error::Category;

        let category = match err.classify() {
            Category::Io => "io",
            Category::Syntax => "syntax",
            Category::Data => "data",
            Category::Eof => "eof",
        };

        Self::Parse {
            category,
            line: err.line(),
            column: err.column(),
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Network(reason) => Self::Network(reason),
            TransportError::Status(status @ (401 | 403)) => Self::Auth { status },
            TransportError::Status(code) => Self::HttpStatus { code },
            TransportError::Timeout => Self::Timeout,
        }
    }
}
