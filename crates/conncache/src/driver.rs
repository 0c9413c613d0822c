use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// A stateful handle to some external resource, as managed by the [`ConnectionCache`].
///
/// The cache only manages the lifecycle of connections. Once handed out, a connection is shared
/// among all current holders of its key, so any methods used concurrently by these holders need to
/// do their own synchronization.
///
/// [`ConnectionCache`]: crate::ConnectionCache
pub trait Connection: Send + Sync + 'static {
    /// Closes the connection.
    ///
    /// The cache calls this exactly once per opened connection, even if holders still reference it.
    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// The Connection Driver
///
/// The driver is responsible for opening the actual connections that are supposed to be cached,
/// as well as determining their cache key.
pub trait ConnectionDriver: Send + Sync + 'static {
    /// Configuration that describes a connection.
    type Config: Clone + Send + Sync + 'static;
    /// The connection opened from a [`Config`](Self::Config).
    type Connection: Connection;

    /// Returns the cache key corresponding to the `config`.
    ///
    /// Equal configurations must map to equal keys, as there is at most one connection per key.
    fn cache_key(&self, config: &Self::Config) -> String;

    /// Opens a new connection.
    ///
    /// The `token` is cancelled when the configured open timeout elapses or the cache is closed.
    /// Implementations should give up promptly once that happens. It is not tied to any caller
    /// waiting for the connection.
    fn open(
        &self,
        config: &Self::Config,
        token: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<Self::Connection>>;

    /// Called periodically for connections that take longer to open or close than configured.
    ///
    /// `opening` tells whether the connection is stuck opening (`true`) or closing (`false`). This
    /// is purely informational, the operation keeps running.
    fn on_hanging(&self, config: &Self::Config, opening: bool) {
        let key = self.cache_key(config);
        if opening {
            tracing::warn!(key = %key, "connection cache: opening connection takes longer than expected");
        } else {
            tracing::warn!(key = %key, "connection cache: closing connection takes longer than expected");
        }
    }
}
