//! Contains the `Error` and `Result` types that `mongodb_connectivity` uses.

use std::{collections::HashSet, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    options::ServerAddress,
    sdam::{TopologyDescription, TopologyVersion},
};

const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const NOTWRITABLEPRIMARY_CODES: [i32; 3] = [10107, 13435, 10058];
const SHUTTING_DOWN_CODES: [i32; 2] = [11600, 91];

/// Indicates that an error is retryable.
pub const RETRYABLE_ERROR: &str = "RetryableError";

/// The result type for all methods that can return an error in the `mongodb_connectivity` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `mongodb_connectivity` crate. The inner
/// [`ErrorKind`](enum.ErrorKind.html) is wrapped in a `Box` to allow the errors to be
/// cloned cheaply.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}, source: {source:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,

    labels: HashSet<String>,

    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let labels: HashSet<String> = labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        Self {
            kind: Box::new(kind),
            labels,
            source: None,
        }
    }

    /// The error returned to operations that were waiting on (or checking out from) a pool that
    /// has since been cleared. Always carries the retryable label.
    pub(crate) fn pool_cleared_error(address: &ServerAddress, cause: &Error) -> Self {
        let kind = ErrorKind::ConnectionPoolCleared {
            message: format!(
                "Connection pool for {address} cleared because another operation failed with: \
                 {cause}"
            ),
            network_error: cause.is_network_error(),
        };
        Error::new(kind, Some(vec![RETRYABLE_ERROR.to_string()])).with_source(cause.clone())
    }

    pub(crate) fn pool_closed_error(address: &ServerAddress) -> Self {
        ErrorKind::ConnectionPoolClosed {
            message: format!("Connection pool for {address} has been closed"),
        }
        .into()
    }

    pub(crate) fn wait_queue_timeout(address: &ServerAddress) -> Self {
        ErrorKind::WaitQueueTimeout {
            address: address.clone(),
        }
        .into()
    }

    pub(crate) fn server_selection(
        message: impl Into<String>,
        topology: Option<TopologyDescription>,
    ) -> Self {
        ErrorKind::ServerSelection {
            message: message.into(),
            topology: topology.map(Box::new),
        }
        .into()
    }

    /// The uniform error kind raised whenever an operation's overall deadline is exceeded,
    /// regardless of which phase observed the expiry.
    pub(crate) fn operation_timeout(message: impl Into<String>) -> Self {
        ErrorKind::OperationTimeout {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn operation_cancelled() -> Self {
        ErrorKind::OperationCancelled.into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    /// Construct a generic network timeout error.
    pub(crate) fn network_timeout() -> Error {
        ErrorKind::Io(Arc::new(std::io::ErrorKind::TimedOut.into())).into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn is_state_change_error(&self) -> bool {
        self.is_recovering() || self.is_notwritableprimary()
    }

    pub(crate) fn is_network_timeout(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::TimedOut
        )
    }

    pub(crate) fn is_non_timeout_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(ref io_err) if io_err.kind() != std::io::ErrorKind::TimedOut
        )
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    /// Whether this error was raised because the operation's deadline was exhausted.
    pub fn is_operation_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::OperationTimeout { .. })
    }

    #[cfg(test)]
    pub(crate) fn is_server_selection_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ServerSelection { .. })
    }

    pub(crate) fn is_pool_cleared(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ConnectionPoolCleared { .. })
    }

    #[cfg(test)]
    pub(crate) fn is_pool_closed(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ConnectionPoolClosed { .. })
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::OperationCancelled)
    }

    #[cfg(test)]
    pub(crate) fn is_incompatible_server(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::IncompatibleServer { .. })
    }

    /// Gets the code from this error for performing SDAM updates, if applicable.
    pub(crate) fn sdam_code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.code),
            _ => None,
        }
        .or_else(|| self.source.as_ref().and_then(|s| s.sdam_code()))
    }

    /// If this error corresponds to a "not writable primary" error according to its error code.
    pub(crate) fn is_notwritableprimary(&self) -> bool {
        self.sdam_code()
            .map(|code| NOTWRITABLEPRIMARY_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// If this error corresponds to a "node is recovering" error according to its error code.
    pub(crate) fn is_recovering(&self) -> bool {
        self.sdam_code()
            .map(|code| RECOVERING_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// If this error corresponds to a "node is shutting down" error according to its error code.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.sdam_code()
            .map(|code| SHUTTING_DOWN_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// The labels attached to this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels().contains(label.as_ref())
    }

    pub(crate) fn with_source<E: Into<Option<Error>>>(mut self, source: E) -> Self {
        self.source = source.into().map(Box::new);
        self
    }

    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match self.kind.as_ref() {
            ErrorKind::Command(c) => c.topology_version,
            _ => None,
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

impl From<crate::bson::de::Error> for ErrorKind {
    fn from(err: crate::bson::de::Error) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// The server returned an error to an attempted operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// Wrapper around [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The connection pool for a server was cleared during operation execution due to
    /// a concurrent error, causing the operation to fail. `network_error` is set when the
    /// clear was caused by a network error, in which case the failure is safe to retry.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionPoolCleared { message: String, network_error: bool },

    /// A connection was requested from a pool that has been closed.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionPoolClosed { message: String },

    /// Timed out while waiting in a pool's wait queue for a connection.
    #[error("Timed out while checking out a connection from the connection pool for {address}")]
    #[non_exhaustive]
    WaitQueueTimeout { address: ServerAddress },

    /// The server returned an invalid reply to a database operation.
    #[error("The server returned an invalid reply to a database operation: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// No server could be selected for the operation. The topology observed at the time of
    /// the failure is attached when available.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection {
        message: String,
        topology: Option<Box<TopologyDescription>>,
    },

    /// The operation's overall deadline was exceeded.
    #[error("Operation timed out: {message}")]
    #[non_exhaustive]
    OperationTimeout { message: String },

    /// The operation was abandoned because its cancellation token fired.
    #[error("Operation was cancelled")]
    OperationCancelled,

    /// The deployment does not support sessions.
    #[error("Attempted to start a session on a deployment that does not support sessions")]
    SessionsNotSupported,

    /// The server does not support the operation.
    #[error("The server does not support a database operation: {message}")]
    #[non_exhaustive]
    IncompatibleServer { message: String },

    /// A method was called on a topology that was shut down.
    #[error("Topology has been shut down")]
    Shutdown,
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// The topology version reported by the server in the error response.
    #[serde(rename = "topologyVersion")]
    pub topology_version: Option<TopologyVersion>,
}

impl CommandError {
    /// Creates a new command error.
    pub fn new(code: i32, code_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            code_name: code_name.into(),
            message: message.into(),
            topology_version: None,
        }
    }

    /// Attaches the topology version the server reported alongside the error.
    pub fn with_topology_version(mut self, topology_version: TopologyVersion) -> Self {
        self.topology_version = Some(topology_version);
        self
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Error code {} ({}): {}",
            self.code, self.code_name, self.message
        )
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn pool_cleared_error_is_retryable() {
        let address = ServerAddress::parse("a:27017").unwrap();
        let cause: Error = std::io::ErrorKind::ConnectionReset.into();
        let error = Error::pool_cleared_error(&address, &cause);

        assert!(error.contains_label(RETRYABLE_ERROR));
        assert!(error.is_pool_cleared());
        assert!(error.is_network_error());
        match error.kind.as_ref() {
            ErrorKind::ConnectionPoolCleared { network_error, .. } => assert!(network_error),
            other => panic!("expected pool cleared, got {other:?}"),
        }
    }

    #[test]
    fn pool_cleared_by_command_error_is_not_network_error() {
        let address = ServerAddress::parse("a").unwrap();
        let cause: Error =
            ErrorKind::Command(CommandError::new(91, "ShutdownInProgress", "bye")).into();
        let error = Error::pool_cleared_error(&address, &cause);

        match error.kind.as_ref() {
            ErrorKind::ConnectionPoolCleared { network_error, .. } => assert!(!network_error),
            other => panic!("expected pool cleared, got {other:?}"),
        }
        assert_eq!(error.sdam_code(), Some(91));
    }

    #[test]
    fn state_change_classification() {
        let recovering: Error = ErrorKind::Command(CommandError::new(11602, "", "")).into();
        assert!(recovering.is_recovering());
        assert!(recovering.is_state_change_error());
        assert!(!recovering.is_shutting_down());

        let not_primary: Error = ErrorKind::Command(CommandError::new(10107, "", "")).into();
        assert!(not_primary.is_notwritableprimary());
        assert!(not_primary.is_state_change_error());

        let other: Error = ErrorKind::Command(CommandError::new(2, "", "")).into();
        assert!(!other.is_state_change_error());
    }

    #[test]
    fn network_timeout_classification() {
        let timeout = Error::network_timeout();
        assert!(timeout.is_network_timeout());
        assert!(timeout.is_network_error());
        assert!(!timeout.is_non_timeout_network_error());
    }
}
