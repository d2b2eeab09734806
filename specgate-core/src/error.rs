//! Request error taxonomy.
//!
//! Every fallible operation on the request path returns one of these
//! variants so the dispatch boundary can translate failures into HTTP
//! responses without inspecting message strings.

use thiserror::Error;

/// Typed errors produced on the request path.
///
/// Each variant maps to exactly one HTTP status; see [`Error::status_code`].
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input on the wire or in a document
    #[error("parse error: {0}")]
    Parse(String),

    /// Input was well formed but failed validation
    #[error("{0}")]
    Validation(String),

    /// A named entity does not exist
    #[error("{0}")]
    Key(String),

    /// The requester is not allowed access
    #[error("access denied")]
    AccessDenied,

    /// The operation conflicts with existing state
    #[error("{0}")]
    Conflict(String),

    /// Request body exceeded the configured limit
    #[error("request body too large")]
    BodyTooLarge,

    /// The endpoint exists but not for this HTTP method
    #[error("method not allowed")]
    UnsupportedMethod,

    /// A dependent service (DB connect, OAuth2 provider) failed
    #[error("upstream error: {0}")]
    Upstream(String),

    /// A deadline elapsed
    #[error("timed out: {0}")]
    Timeout(String),

    /// Declared but not implemented
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Anything else
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// The HTTP status this error surfaces as.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Parse(_) | Error::Validation(_) => 400,
            Error::AccessDenied => 401,
            Error::Key(_) => 404,
            Error::UnsupportedMethod => 405,
            Error::Conflict(_) => 409,
            Error::BodyTooLarge => 413,
            Error::NotImplemented(_) => 501,
            Error::Upstream(_) => 502,
            Error::Timeout(_) => 504,
            Error::Internal(_) => 500,
        }
    }

    /// The message exposed to clients.
    ///
    /// Internal errors are logged in full but only a generic body goes out.
    pub fn public_message(&self) -> String {
        match self {
            Error::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Result alias used throughout the request path.
pub type Result<T> = std::result::Result<T, Error>;
