//! Contains the `Error` and `Result` types that `replset_client` uses.

use std::{fmt, io, sync::Arc};

use thiserror::Error;

use crate::options::ServerAddress;

/// Server error codes that indicate a duplicate-key violation.
const DUPLICATE_KEY_CODES: [i32; 3] = [11000, 11001, 12582];

/// The result type for all methods that can return an error in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while talking to a replica set. The inner
/// [`ErrorKind`] is boxed to keep `Result` payloads small, and the whole error
/// is cloneable so it can be recorded in topology snapshots.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
        }
    }

    /// A transient error; the caller should retry once the monitor has
    /// refreshed the client's view of the set.
    pub(crate) fn auto_reconnect(message: impl Into<String>) -> Self {
        ErrorKind::AutoReconnect {
            message: message.into(),
            errors: Vec::new(),
        }
        .into()
    }

    pub(crate) fn auto_reconnect_with(message: impl Into<String>, errors: Vec<String>) -> Self {
        ErrorKind::AutoReconnect {
            message: message.into(),
            errors,
        }
        .into()
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        ErrorKind::Configuration {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn connection(message: impl Into<String>) -> Self {
        ErrorKind::Connection {
            message: message.into(),
        }
        .into()
    }

    /// Construct a generic network timeout error.
    pub(crate) fn network_timeout() -> Self {
        ErrorKind::Io(Arc::new(io::ErrorKind::TimedOut.into())).into()
    }

    /// Construct an error from a server error document's code and message,
    /// surfacing duplicate-key violations as their own kind.
    pub(crate) fn from_server_error(code: Option<i32>, message: impl Into<String>) -> Self {
        let err = CommandError {
            code: code.unwrap_or(0),
            message: message.into(),
        };
        match code {
            Some(code) if DUPLICATE_KEY_CODES.contains(&code) => {
                ErrorKind::DuplicateKey(err).into()
            }
            _ => ErrorKind::Command(err).into(),
        }
    }

    /// Whether this error indicates the peer could not be reached or the
    /// connection broke underneath us.
    pub(crate) fn is_connection_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..)
                | ErrorKind::Connection { .. }
                | ErrorKind::Tls { .. }
                | ErrorKind::WaitQueueTimeout { .. }
                | ErrorKind::WaitQueueFull { .. }
        )
    }

    pub(crate) fn is_network_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() == io::ErrorKind::TimedOut)
    }

    /// An outgoing document is larger than the connected server accepts.
    pub(crate) fn document_too_large(size: i32, max_size: i32) -> Self {
        ErrorKind::InvalidDocument {
            message: format!(
                "document too large ({} bytes) - the connected server supports documents up to \
                 {} bytes",
                size, max_size
            ),
        }
        .into()
    }

    /// Whether the caller is expected to retry after the next refresh.
    pub fn is_auto_reconnect(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::AutoReconnect { .. })
    }

    /// Whether this error represents a static misconfiguration. Never retried.
    pub fn is_configuration_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Configuration { .. })
    }

    /// Whether the server rejected a write with a duplicate-key code.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::DuplicateKey(..))
    }

    /// Whether the server returned an error document for an operation.
    pub fn is_command_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Command(..) | ErrorKind::DuplicateKey(..)
        )
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::new(ErrorKind::Io(Arc::new(err)))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::network_timeout()
    }
}

impl From<bson::ser::Error> for Error {
    fn from(err: bson::ser::Error) -> Self {
        Self::new(ErrorKind::InvalidDocument {
            message: err.to_string(),
        })
    }
}

impl From<bson::de::Error> for Error {
    fn from(err: bson::de::Error) -> Self {
        Self::new(ErrorKind::InvalidResponse {
            message: err.to_string(),
        })
    }
}

/// An error document returned by the server in a command or write
/// acknowledgement response.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct CommandError {
    /// The numeric error code, or 0 if the server supplied none.
    pub code: i32,

    /// The server's error message.
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code != 0 {
            write!(f, "{} (code {})", self.message, self.code)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Static misuse of the client: missing or wrong set name, conflicting
    /// TLS options, an empty seed list. Fatal; never retried.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// An I/O error occurred on a socket.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// A transport-level failure that is not a raw I/O error, such as a
    /// refused connection wrapped with context.
    #[error("connection failure: {message}")]
    Connection { message: String },

    /// The TLS handshake with a server failed. Always fatal for the attempt.
    #[error("TLS handshake failed: {message}")]
    Tls { message: String },

    /// A transient failure; the operation may succeed if retried after the
    /// monitor refreshes the topology.
    #[error("auto-reconnect: {message}{}", format_attempt_errors(.errors))]
    AutoReconnect {
        message: String,
        errors: Vec<String>,
    },

    /// The server returned an error document in a command response.
    #[error("operation failure: {0}")]
    Command(CommandError),

    /// The server rejected a write because it would violate a unique index.
    #[error("duplicate key error: {0}")]
    DuplicateKey(CommandError),

    /// An outgoing document failed a local check, e.g. it exceeds the
    /// primary's maximum document size.
    #[error("invalid document: {message}")]
    InvalidDocument { message: String },

    /// Waiting for a pool permit timed out.
    #[error("timed out waiting for a connection to {address} to become available")]
    WaitQueueTimeout { address: ServerAddress },

    /// The pool's waiter budget is exhausted.
    #[error("too many operations already waiting for a connection to {address}")]
    WaitQueueFull { address: ServerAddress },

    /// A response from the server could not be interpreted.
    #[error("invalid server response: {message}")]
    InvalidResponse { message: String },
}

fn format_attempt_errors(errors: &[String]) -> String {
    if errors.is_empty() {
        String::new()
    } else {
        format!(": [{}]", errors.join(", "))
    }
}
