use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// An error returned when acquiring a connection from the cache.
///
/// Errors are cached on the entry they belong to and handed out to every caller
/// acquiring that entry, which is why this type is cheaply clonable.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The cache was shut down via [`ConnectionCache::close`](crate::ConnectionCache::close).
    #[error("connection cache closed")]
    Closed,
    /// The connection was closed before it could be handed out.
    #[error("connection closed")]
    ConnectionClosed,
    /// Opening the connection took longer than the configured `open_timeout`.
    #[error("opening connection timed out after {0:?}")]
    Timeout(Duration),
    /// Opening was cancelled because the cache is shutting down.
    #[error("opening connection was cancelled")]
    Cancelled,
    /// The driver failed to open or close the connection.
    #[error("{0:#}")]
    Connection(Arc<anyhow::Error>),
    /// A deduplicated operation went away without producing a result.
    ///
    /// This usually means the runtime is shutting down.
    #[error("internal error")]
    InternalError,
}

impl From<anyhow::Error> for CacheError {
    fn from(err: anyhow::Error) -> Self {
        Self::Connection(Arc::new(err))
    }
}

impl CacheError {
    /// A short, static name of the error kind, suitable for metric tags.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::ConnectionClosed => "connection_closed",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Connection(_) => "connection",
            Self::InternalError => "internal",
        }
    }
}
