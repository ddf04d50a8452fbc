//! Error types for the tilestream crate.

use std::fmt;

use crate::TileId;

/// Result type for tilestream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tilestream operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The tileset manifest could not be turned into a tree.
    ManifestInvalid {
        /// Description of what was invalid.
        detail: String,
    },
    /// A tile id does not name a node of the tree.
    InvalidTileId {
        /// The offending id.
        id: TileId,
    },
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
    /// Reading from the filesystem failed.
    Io {
        /// The path that failed.
        path: String,
        /// The error message.
        message: String,
    },
    /// An in-memory source has no entry for the URI.
    NotFound {
        /// The URI that was requested.
        uri: String,
    },
    /// A content payload could not be parsed.
    ContentInvalid {
        /// Context for where the error occurred.
        context: &'static str,
        /// Description of what was invalid.
        detail: String,
    },
    /// A background job panicked before reporting a result.
    TaskFailed {
        /// The runtime's description of the failure.
        detail: String,
    },
    /// A configuration file could not be read.
    Config {
        /// Description of what was invalid.
        detail: String,
    },
}

impl Error {
    pub(crate) fn manifest(detail: impl Into<String>) -> Self {
        Error::ManifestInvalid {
            detail: detail.into(),
        }
    }

    pub(crate) fn content(context: &'static str, detail: impl Into<String>) -> Self {
        Error::ContentInvalid {
            context,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ManifestInvalid { detail } => write!(f, "invalid tileset manifest: {detail}"),
            Error::InvalidTileId { id } => write!(f, "tile {id} is not part of the tree"),
            Error::Http { url, message } => {
                write!(f, "http request to {url} failed: {message}")
            }
            Error::HttpStatus { url, status } => {
                write!(f, "http request to {url} returned status {status}")
            }
            Error::Io { path, message } => write!(f, "reading {path} failed: {message}"),
            Error::NotFound { uri } => write!(f, "no content for {uri}"),
            Error::ContentInvalid { context, detail } => {
                write!(f, "invalid {context}: {detail}")
            }
            Error::TaskFailed { detail } => write!(f, "background job failed: {detail}"),
            Error::Config { detail } => write!(f, "invalid configuration: {detail}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ManifestInvalid {
            detail: e.to_string(),
        }
    }
}
