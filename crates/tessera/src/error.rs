//! Error types for the tessera crate.

use std::fmt;

/// Result type for tessera operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tessera operations.
///
/// Network and decode failures never leave the resource scheduler; they turn
/// the affected resource `Invalid` and are logged. The public configuration
/// API only returns [`Error::Config`], [`Error::Json`] and [`Error::NotReady`].
#[derive(Debug)]
pub enum Error {
    /// HTTP request failed.
    Http {
        /// The URL that failed.
        url: String,
        /// The error message.
        message: String,
    },
    /// HTTP response had a non-success status code.
    HttpStatus {
        /// The URL that returned the error.
        url: String,
        /// The HTTP status code.
        status: u16,
    },
    /// Decoding downloaded bytes failed.
    Decode(tessera_decode::DecodeError),
    /// JSON parsing failed.
    Json {
        /// Context for where the error occurred.
        context: &'static str,
        /// The error message.
        message: String,
    },
    /// Invalid data in a response.
    InvalidData {
        /// Context for where the error occurred.
        context: &'static str,
        /// Description of what was invalid.
        detail: String,
    },
    /// The caller misused the configuration API.
    Config {
        /// Description of the misuse.
        detail: String,
    },
    /// The map configuration has not been loaded yet.
    NotReady,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http { url, message } => {
                write!(f, "http request to {url} failed: {message}")
            }
            Error::HttpStatus { url, status } => {
                write!(f, "http request to {url} returned status {status}")
            }
            Error::Decode(e) => write!(f, "decode error: {e}"),
            Error::Json { context, message } => {
                write!(f, "failed to parse {context}: {message}")
            }
            Error::InvalidData { context, detail } => {
                write!(f, "invalid {context}: {detail}")
            }
            Error::Config { detail } => write!(f, "configuration error: {detail}"),
            Error::NotReady => write!(f, "map configuration is not ready"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<tessera_decode::DecodeError> for Error {
    fn from(e: tessera_decode::DecodeError) -> Self {
        Error::Decode(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json {
            context: "json",
            message: e.to_string(),
        }
    }
}

impl Error {
    pub(crate) fn config(detail: impl Into<String>) -> Self {
        Error::Config {
            detail: detail.into(),
        }
    }

    /// Whether this error is caller misuse rather than a data/network fault.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config { .. } | Error::Json { .. })
    }
}
