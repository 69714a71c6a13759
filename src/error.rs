//! The possible error types when using `shard_ml`.
use std::io;
use thiserror::Error;

/// An enumeration of `shard_ml` errors.
///
/// Errors that can be detected before a collective operation starts are
/// always raised from globally known values (configuration, gathered shapes,
/// reduced counts), so every rank raises the same error at the same step and
/// the group aborts together instead of deadlocking.
#[derive(Debug, Error)]
pub enum MlError {
    /// A chunk of a dataset could not be read from its `RowSource`
    #[error("data access error: {0}")]
    DataAccess(#[from] DataAccessError),
    /// A label was looked up that was not part of the most recently indexed
    /// global label set
    #[error("class {0} not found")]
    UnknownLabel(i64),
    /// A dense class index that is out of range for the indexed label set
    #[error("dense class index {0} out of range")]
    UnknownIndex(usize),
    /// Invalid configuration, validated identically on every rank
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A peer sent something for a different collective step than the one
    /// this rank is executing. Fatal for the whole group.
    #[error("collective protocol violation: {0}")]
    CollectiveProtocol(String),
    /// A model was used for prediction before it was trained
    #[error("model has not been fitted")]
    NotFitted,
    /// A thread of a local parallel kernel panicked
    #[error("a local worker thread panicked")]
    WorkerPanicked,
    /// Error with the underlying socket or file
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Error serializing or deserializing a message
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    /// The connection to a peer or the registration server was closed
    #[error("stream closed")]
    StreamClosed,
    /// Received a message that was not valid at this point of the protocol
    #[error("unexpected message")]
    UnexpectedMessage,
    /// Tried to send a message to a rank that is not in the directory
    #[error("unknown id")]
    UnknownId,
    /// Tried to connect to a rank that we already have a connection with
    #[error("reconnection error")]
    ReconnectionError,
}

/// Reasons a `RowSource` may fail to provide a row range.
#[derive(Debug, Error)]
pub enum DataAccessError {
    /// The named dataset does not exist in the source
    #[error("dataset `{0}` not found")]
    NotFound(String),
    /// The source ended before the requested row range was complete
    #[error("short read: expected {expected} rows starting at {offset}, got {got}")]
    ShortRead {
        offset: u64,
        expected: u64,
        got: u64,
    },
    /// A value in the source could not be interpreted as a number
    #[error("malformed data: {0}")]
    Malformed(String),
    /// Underlying I/O failure while reading
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<csv::Error> for DataAccessError {
    fn from(e: csv::Error) -> Self {
        if e.is_io_error() {
            match e.into_kind() {
                csv::ErrorKind::Io(io_err) => DataAccessError::Io(io_err),
                other => DataAccessError::Malformed(format!("{:?}", other)),
            }
        } else {
            DataAccessError::Malformed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_label_display() {
        let err = MlError::UnknownLabel(7);
        assert_eq!(err.to_string(), "class 7 not found");
    }

    #[test]
    fn test_data_access_conversion() {
        let err: MlError = DataAccessError::NotFound("iris".to_string()).into();
        assert!(matches!(
            err,
            MlError::DataAccess(DataAccessError::NotFound(_))
        ));
        assert!(err.to_string().contains("iris"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: MlError = io_err.into();
        assert!(matches!(err, MlError::Io(_)));
    }
}
