use crate::sync::SyncError;
use std::io;
use thiserror::Error;

/// Errors raised by sockets, caches, stream guards and controllers.
#[derive(Debug, Error)]
pub enum Error {
    /// The entry does not exist in the backing store.
    #[error("entry not found: {0}")]
    NotFound(String),

    /// The backing store cannot serve the request right now; retry later.
    #[error("resource busy: {0}")]
    Busy(String),

    /// The stream was force-closed while synchronizing its filesystem.
    #[error("stream closed by synchronization")]
    StreamClosedBySync,

    /// The stream has already been closed by its owner.
    #[error("stream closed")]
    StreamClosed,

    /// Reading the backing store to populate a cache failed.
    #[error("cache population failed: {0}")]
    Population(#[source] Box<Error>),

    /// Relaying cached data to the backing store failed.
    #[error("cache flush failed: {0}")]
    Flush(#[source] Box<Error>),

    /// An object was used outside of its lifecycle.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// An argument was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The endpoint does not support the requested kind of access.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// One or more filesystems failed to synchronize.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(io::Error),
}

impl Error {
    /// Create a NotFound error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound(name.into())
    }

    /// Create a Busy error.
    pub fn busy(reason: impl Into<String>) -> Self {
        Self::Busy(reason.into())
    }

    /// Create an IllegalState error.
    pub fn illegal_state(reason: impl Into<String>) -> Self {
        Self::IllegalState(reason.into())
    }

    /// Returns `true` if retrying after the contending operation completes may succeed.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Busy(_) => true,
            Self::Population(inner) | Self::Flush(inner) => inner.is_busy(),
            Self::Io(err) => err.kind() == io::ErrorKind::WouldBlock,
            _ => false,
        }
    }

    /// Returns `true` if the queried entry does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Population(inner) | Self::Flush(inner) => inner.is_not_found(),
            Self::Io(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Returns `true` if `err` reports a stream force-closed by synchronization.
    pub fn is_closed_by_sync(err: &io::Error) -> bool {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<Error>())
            .is_some_and(|inner| matches!(inner, Error::StreamClosedBySync))
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::NotFound(_) => io::ErrorKind::NotFound,
            Self::Busy(_) => io::ErrorKind::WouldBlock,
            Self::StreamClosedBySync | Self::StreamClosed => io::ErrorKind::BrokenPipe,
            Self::InvalidArgument(_) => io::ErrorKind::InvalidInput,
            Self::Unsupported(_) => io::ErrorKind::Unsupported,
            Self::Population(inner) | Self::Flush(inner) => inner.io_kind(),
            Self::Io(err) => err.kind(),
            Self::IllegalState(_) | Self::Sync(_) => io::ErrorKind::Other,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let wraps_error = err
            .get_ref()
            .is_some_and(|inner| inner.is::<Error>());
        if !wraps_error {
            return Error::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(inner)) => *inner,
            _ => Error::Io(io::Error::from(kind)),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

/// Result type for nestfs-core operations.
pub type Result<T> = std::result::Result<T, Error>;
