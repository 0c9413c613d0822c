//! The connection cache itself.
//!
//! Every cache key maps to at most one [`Entry`]. Callers [`acquire`](ConnectionCache::acquire)
//! a [`Lease`] on an entry, which keeps it alive until the lease is dropped. Unreferenced open
//! entries are parked in the [`IdleList`], and are closed once they fall out of it.
//!
//! All opening and closing runs through a [`Group`] keyed by the cache key, which guarantees that
//! at most one of these operations is in flight per key, and that concurrent acquirers share a
//! single open. The actual work is spawned, so callers that give up waiting never leave an entry
//! half-opened.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::CacheConfig;
use crate::driver::{Connection, ConnectionDriver};
use crate::entry::{Entry, EntryStatus};
use crate::error::CacheError;
use crate::idle::IdleList;
use crate::singleflight::Group;
use crate::utils::CallOnDrop;
use crate::watchdog;

/// How often open and close are attempted when racing with other operations on the same key.
const MAX_ATTEMPTS: usize = 2;

/// How long [`ConnectionCache::close`] waits for leased entries before checking again.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

type CacheEntry<D> =
    Entry<<D as ConnectionDriver>::Config, <D as ConnectionDriver>::Connection>;

pub(crate) struct State<D: ConnectionDriver> {
    /// Set once [`ConnectionCache::close`] was called.
    pub closed: bool,
    pub entries: HashMap<String, CacheEntry<D>>,
    pub idle: IdleList,
    next_id: u64,
}

impl<D: ConnectionDriver> State<D> {
    /// Returns the entry for `key`, unless it was replaced since entry `id` was handed out.
    fn entry_mut(&mut self, key: &str, id: u64) -> Option<&mut CacheEntry<D>> {
        self.entries.get_mut(key).filter(|entry| entry.id == id)
    }

    fn entry(&self, key: &str, id: u64) -> Option<&CacheEntry<D>> {
        self.entries.get(key).filter(|entry| entry.id == id)
    }

    /// Returns the entry for `key`, creating it if necessary.
    fn entry_or_insert(&mut self, key: &str, config: D::Config) -> &mut CacheEntry<D> {
        let next_id = &mut self.next_id;
        self.entries.entry(key.to_owned()).or_insert_with(|| {
            let id = *next_id;
            *next_id += 1;
            Entry::new(id, config)
        })
    }

    /// Takes a reference on the entry, which also takes it off the idle list.
    fn retain(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.refs += 1;
            self.idle.remove(key);
        }
    }

    fn keys_where(&self, mut predicate: impl FnMut(&CacheEntry<D>) -> bool) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

pub(crate) struct Inner<D: ConnectionDriver> {
    pub driver: D,
    pub config: CacheConfig,
    pub state: Mutex<State<D>>,
    group: Group<String, ()>,
    /// Parent of all open tokens, cancelled once the cache is closed.
    root: CancellationToken,
    /// The runtime the cache was created on.
    ///
    /// Leases may be released on any thread, which can start closing a connection.
    runtime: Handle,
}

impl<D: ConnectionDriver> Inner<D> {
    /// Drops a reference on entry `id`, if it still exists.
    fn release_entry(self: &Arc<Self>, key: &str, id: u64) {
        let mut state = self.state.lock().unwrap();
        if state.entry(key, id).is_some() {
            self.release(&mut state, key);
        }
    }

    /// Drops a reference on the entry for `key`.
    ///
    /// Once nobody references an open entry anymore, it becomes idle, or is closed if the cache
    /// is shutting down. Entries that are neither open nor busy are forgotten.
    fn release(self: &Arc<Self>, state: &mut State<D>, key: &str) {
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }

        let status = entry.status;
        match status {
            EntryStatus::Open if state.closed => self.begin_close(state, key),
            EntryStatus::Open => {
                if let Some(evicted) = state.idle.insert(key.to_owned()) {
                    metric!(counter("conncache.evict") += 1, "reason" => "lru");
                    self.begin_close(state, &evicted);
                }
            }
            EntryStatus::Opening => {}
            EntryStatus::Unspecified | EntryStatus::Closing | EntryStatus::Closed => {
                state.entries.remove(key);
            }
        }
    }

    /// Starts closing the entry for `key` in the background, if it is opening or open.
    ///
    /// The entry is marked `Closing` right away and kept alive until the close finished.
    fn begin_close(self: &Arc<Self>, state: &mut State<D>, key: &str) {
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        if !matches!(entry.status, EntryStatus::Opening | EntryStatus::Open) {
            return;
        }
        entry.set_status(EntryStatus::Closing);
        let id = entry.id;
        state.retain(key);

        let span = tracing::debug_span!("close_connection", key = %key);
        let task = Arc::clone(self)
            .close_entry(key.to_owned(), id)
            .instrument(span)
            .bind_hub(Hub::new_from_top(Hub::current()));
        self.runtime.spawn(task);
    }

    /// Drives the close of entry `id`, and releases the reference taken by [`Self::begin_close`].
    async fn close_entry(self: Arc<Self>, key: String, id: u64) {
        let _release_token = {
            let inner = Arc::clone(&self);
            let key = key.clone();
            CallOnDrop::new(move || inner.release_entry(&key, id))
        };

        for _ in 0..MAX_ATTEMPTS {
            let work = {
                let inner = Arc::clone(&self);
                let key = key.clone();
                move |_| inner.close_work(key, id)
            };
            if self.group.work(key.clone(), work).await.is_err() {
                break;
            }

            let closed = {
                let state = self.state.lock().unwrap();
                state
                    .entry(&key, id)
                    .is_none_or(|entry| entry.status == EntryStatus::Closed)
            };
            if closed {
                break;
            }
        }
    }

    /// The deduplicated unit of work closing entry `id`.
    fn close_work(self: Arc<Self>, key: String, id: u64) -> impl Future<Output = ()> + Send {
        async move {
            let handle = {
                let mut state = self.state.lock().unwrap();
                let Some(entry) = state.entry_mut(&key, id) else {
                    return;
                };
                if entry.status == EntryStatus::Closed {
                    return;
                }
                entry.set_status(EntryStatus::Closing);
                entry.handle.take()
            };

            // The entry must not get stuck in `Closing` if the driver panics.
            let unwind_guard = {
                let inner = Arc::clone(&self);
                let key = key.clone();
                CallOnDrop::new(move || {
                    inner.finish_close(&key, id, Err(CacheError::InternalError))
                })
            };

            tracing::debug!(key = %key, "closing connection");
            let result = match handle {
                Some(handle) => handle.close().await.map_err(|err| {
                    let error = format!("{err:#}");
                    tracing::error!(key = %key, error, "failed to close connection");
                    CacheError::from(err)
                }),
                None => Ok(()),
            };

            unwind_guard.disarm();
            metric!(
                counter("conncache.close") += 1,
                "status" => if result.is_ok() { "ok" } else { "error" },
            );
            self.finish_close(&key, id, result);
        }
    }

    fn finish_close(&self, key: &str, id: u64, result: Result<(), CacheError>) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entry_mut(key, id) {
            entry.set_status(EntryStatus::Closed);
            entry.error = Some(result.err().unwrap_or(CacheError::ConnectionClosed));
        }
    }

    /// The deduplicated unit of work opening entry `id`.
    fn open_work(self: Arc<Self>, key: String, id: u64) -> impl Future<Output = ()> + Send {
        async move {
            let (config, stale) = {
                let mut state = self.state.lock().unwrap();
                let closed = state.closed;
                let Some(entry) = state.entry_mut(&key, id) else {
                    return;
                };
                if entry.status == EntryStatus::Open {
                    return;
                }

                entry.set_status(EntryStatus::Opening);
                entry.error = None;
                let config = entry.config.clone();
                // On shutdown, a leftover handle stays on the entry for the final close.
                let stale = if closed { None } else { entry.handle.take() };
                state.retain(&key);

                if closed {
                    drop(state);
                    self.finish_open(&key, id, Err(CacheError::Closed));
                    return;
                }
                (config, stale)
            };

            let unwind_guard = {
                let inner = Arc::clone(&self);
                let key = key.clone();
                CallOnDrop::new(move || {
                    inner.finish_open(&key, id, Err(CacheError::InternalError))
                })
            };

            // A previous close did not get to this connection, so do it before replacing it.
            if let Some(stale) = stale {
                if let Err(err) = stale.close().await {
                    let error = format!("{err:#}");
                    tracing::error!(key = %key, error, "failed to close stale connection");
                }
            }

            tracing::debug!(key = %key, "opening connection");
            let start = Instant::now();
            let result = self.open_connection(&key, &config).await;

            unwind_guard.disarm();
            metric!(timer("conncache.open.duration") = start.elapsed());
            metric!(
                counter("conncache.open") += 1,
                "status" => match &result {
                    Ok(_) => "ok",
                    Err(err) => err.kind(),
                },
            );
            self.finish_open(&key, id, result);
        }
    }

    /// Opens a connection through the driver, bounded by the open timeout and the cache lifetime.
    async fn open_connection(
        &self,
        key: &str,
        config: &D::Config,
    ) -> Result<Arc<D::Connection>, CacheError> {
        let timeout = self.config.open_timeout;
        let token = self.root.child_token();
        let _cancel_token = token.clone().drop_guard();

        let mut open = self.driver.open(config, token.clone());
        let result = tokio::select! {
            result = &mut open => result,
            _ = tokio::time::sleep(timeout) => {
                token.cancel();
                // The driver is expected to wind down on cancellation, but may still succeed.
                open.await
            }
        };

        if !token.is_cancelled() {
            return Ok(Arc::new(result?));
        }

        let error = if self.root.is_cancelled() {
            CacheError::Cancelled
        } else {
            CacheError::Timeout(timeout)
        };
        match result {
            Ok(connection) => {
                tracing::debug!(key = %key, "closing connection that finished opening too late");
                if let Err(err) = connection.close().await {
                    let error = format!("{err:#}");
                    tracing::error!(key = %key, error, "failed to close connection");
                }
            }
            Err(err) => {
                let error = format!("{err:#}");
                tracing::debug!(key = %key, error, "opening connection was aborted");
            }
        }
        Err(error)
    }

    fn finish_open(
        self: &Arc<Self>,
        key: &str,
        id: u64,
        result: Result<Arc<D::Connection>, CacheError>,
    ) {
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.entry_mut(key, id) else {
            return;
        };
        entry.set_status(EntryStatus::Open);
        match result {
            Ok(handle) => entry.handle = Some(handle),
            Err(error) => entry.error = Some(error),
        }
        self.release(&mut state, key);
    }

    pub(crate) fn is_drained(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.closed && state.entries.is_empty()
    }
}

/// A concurrency-safe cache of open connections, shared by cache key.
///
/// Concurrent acquires for the same key share a single connection, which is opened at most once
/// at a time. Connections that are no longer leased by anybody stay open until they fall out of a
/// bounded LRU list of idle connections.
///
/// The cache is cheap to clone, all clones refer to the same connections.
pub struct ConnectionCache<D: ConnectionDriver> {
    inner: Arc<Inner<D>>,
}

impl<D: ConnectionDriver> Clone for ConnectionCache<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: ConnectionDriver> fmt::Debug for ConnectionCache<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("ConnectionCache")
            .field("config", &self.inner.config)
            .field("closed", &state.closed)
            .field("entries", &state.entries)
            .field("idle", &state.idle.len())
            .finish()
    }
}

impl<D: ConnectionDriver> ConnectionCache<D> {
    /// Creates a new cache opening connections through `driver`.
    ///
    /// This also spawns the watchdog reporting hanging operations, so it must be called from
    /// within a tokio runtime. All background work of the cache runs on that runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn new(config: CacheConfig, driver: D) -> Self {
        let runtime = Handle::current();
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                closed: false,
                entries: HashMap::new(),
                idle: IdleList::new(config.idle_capacity),
                next_id: 0,
            }),
            driver,
            config,
            group: Group::with_runtime(runtime.clone()),
            root: CancellationToken::new(),
            runtime,
        });

        let watchdog = watchdog::check_hanging_periodically(
            Arc::downgrade(&inner),
            inner.config.hanging_check_interval,
        );
        inner
            .runtime
            .spawn(watchdog.bind_hub(Hub::new_from_top(Hub::current())));

        Self { inner }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    /// Returns a lease on the connection for `config`, opening it if necessary.
    ///
    /// If another caller is already opening the same connection, this waits for and shares the
    /// result of that open. Dropping the returned future stops waiting, but leaves the open
    /// running in the background.
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::Closed`] after [`close`](Self::close) was called. Otherwise this
    /// returns the error of opening the connection. Such errors are cached for the key until the
    /// entry is evicted.
    #[tracing::instrument(skip_all, fields(key = tracing::field::Empty))]
    pub async fn acquire(&self, config: D::Config) -> Result<Lease<D>, CacheError> {
        let inner = &self.inner;
        let key = inner.driver.cache_key(&config);
        tracing::Span::current().record("key", key.as_str());
        metric!(counter("conncache.acquire") += 1);

        let (id, cached) = {
            let mut state = inner.state.lock().unwrap();
            if state.closed {
                return Err(CacheError::Closed);
            }

            let created = !state.entries.contains_key(&key);
            let entry = state.entry_or_insert(&key, config);
            let id = entry.id;
            let cached = (entry.status == EntryStatus::Open).then(|| entry.result());
            state.retain(&key);

            let size = state.entries.len();
            if created && size > inner.config.idle_capacity.saturating_mul(2) {
                tracing::warn!(
                    size,
                    idle_capacity = inner.config.idle_capacity,
                    "connection cache is much larger than its idle capacity"
                );
            }
            (id, cached)
        };

        let entry_ref = EntryRef {
            inner: Arc::clone(inner),
            key: key.clone(),
            id,
        };

        if let Some(result) = cached {
            metric!(counter("conncache.acquire.hit") += 1);
            return result.map(|connection| Lease {
                connection,
                entry: entry_ref,
            });
        }

        for _ in 0..MAX_ATTEMPTS {
            let work = {
                let inner = Arc::clone(inner);
                let key = key.clone();
                move |_| inner.open_work(key, id)
            };
            inner.group.work(key.clone(), work).await?;

            let open = {
                let state = inner.state.lock().unwrap();
                state
                    .entry(&key, id)
                    .is_some_and(|entry| entry.status == EntryStatus::Open)
            };
            if open {
                break;
            }
        }

        let result = {
            let state = inner.state.lock().unwrap();
            match state.entry(&key, id) {
                Some(entry) if entry.status == EntryStatus::Open => entry.result(),
                Some(entry) => Err(entry.error.clone().unwrap_or(CacheError::ConnectionClosed)),
                None => Err(CacheError::ConnectionClosed),
            }
        };
        result.map(|connection| Lease {
            connection,
            entry: entry_ref,
        })
    }

    /// Closes the connection for `config`, if there is one.
    ///
    /// See [`evict_where`](Self::evict_where).
    pub fn evict(&self, config: &D::Config) {
        let key = self.inner.driver.cache_key(config);
        let mut state = self.inner.state.lock().unwrap();
        let closable = state.entries.get(&key).is_some_and(|entry| {
            matches!(entry.status, EntryStatus::Opening | EntryStatus::Open)
        });
        if closable {
            metric!(counter("conncache.evict") += 1, "reason" => "explicit");
            self.inner.begin_close(&mut state, &key);
        }
    }

    /// Closes all connections whose config matches `predicate`.
    ///
    /// This returns right away, the connections are closed in the background. Current holders
    /// keep their lease, but the underlying connection is closed regardless. The next acquire for
    /// an evicted key opens a fresh connection.
    ///
    /// `predicate` runs without any lock held, so it may use the cache itself.
    pub fn evict_where(&self, predicate: impl Fn(&D::Config) -> bool) {
        let candidates: Vec<_> = {
            let state = self.inner.state.lock().unwrap();
            state
                .entries
                .iter()
                .filter(|(_, entry)| {
                    matches!(entry.status, EntryStatus::Opening | EntryStatus::Open)
                })
                .map(|(key, entry)| (key.clone(), entry.id, entry.config.clone()))
                .collect()
        };

        let matching: Vec<_> = candidates
            .into_iter()
            .filter(|(_, _, config)| predicate(config))
            .collect();
        if matching.is_empty() {
            return;
        }

        let mut state = self.inner.state.lock().unwrap();
        for (key, id, _) in matching {
            // Skip entries that were replaced or closed in the meantime.
            let closable = state.entry(&key, id).is_some_and(|entry| {
                matches!(entry.status, EntryStatus::Opening | EntryStatus::Open)
            });
            if !closable {
                continue;
            }
            metric!(counter("conncache.evict") += 1, "reason" => "explicit");
            self.inner.begin_close(&mut state, &key);
        }
    }

    /// Closes all connections and waits until every one of them is closed.
    ///
    /// Opens that are in flight are cancelled. Connections that are still leased are closed right
    /// away, but the cache only finishes draining once all leases are dropped. Afterwards, all
    /// acquires fail with [`CacheError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Closed`] if the cache was closed before.
    pub async fn close(&self) -> Result<(), CacheError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().unwrap();
            if state.closed {
                return Err(CacheError::Closed);
            }
            state.closed = true;
            inner.root.cancel();

            let keys = state.keys_where(|entry| {
                matches!(entry.status, EntryStatus::Opening | EntryStatus::Open)
            });
            for key in keys {
                inner.begin_close(&mut state, &key);
            }
            state.idle.clear();
        }
        tracing::debug!("connection cache closed, draining connections");

        loop {
            let key = {
                let state = inner.state.lock().unwrap();
                state.entries.keys().next().cloned()
            };
            let Some(key) = key else {
                break;
            };

            // Wait for whatever operation is currently in flight for this key.
            inner.group.work(key.clone(), |_| async {}).await?;

            let waiting_for_lease = {
                let state = inner.state.lock().unwrap();
                state
                    .entries
                    .get(&key)
                    .is_some_and(|entry| !entry.status.is_working())
            };
            if waiting_for_lease {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        }

        tracing::debug!("connection cache drained");
        Ok(())
    }

    /// Returns the status of the connection for `config`, if the cache knows about it.
    pub fn status(&self, config: &D::Config) -> Option<EntryStatus> {
        let key = self.inner.driver.cache_key(config);
        let state = self.inner.state.lock().unwrap();
        state.entries.get(&key).map(|entry| entry.status)
    }

    /// The number of connections the cache tracks, including those being opened or closed.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of open connections which are currently not leased.
    pub fn idle_len(&self) -> usize {
        self.inner.state.lock().unwrap().idle.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }
}

/// A reference on a cache entry, released on drop.
struct EntryRef<D: ConnectionDriver> {
    inner: Arc<Inner<D>>,
    key: String,
    id: u64,
}

impl<D: ConnectionDriver> Drop for EntryRef<D> {
    fn drop(&mut self) {
        self.inner.release_entry(&self.key, self.id);
    }
}

/// A connection handed out by the [`ConnectionCache`].
///
/// The lease keeps the connection from being closed as idle. Dropping it hands the connection
/// back to the cache. Explicit evictions and [`ConnectionCache::close`] may still close the
/// connection while it is leased.
pub struct Lease<D: ConnectionDriver> {
    connection: Arc<D::Connection>,
    entry: EntryRef<D>,
}

impl<D: ConnectionDriver> Lease<D> {
    /// The cache key of the leased connection.
    pub fn key(&self) -> &str {
        &self.entry.key
    }

    /// The shared connection, which may outlive the lease.
    pub fn connection(&self) -> &Arc<D::Connection> {
        &self.connection
    }

    /// Hands the connection back to the cache. Same as dropping the lease.
    pub fn release(self) {}
}

impl<D: ConnectionDriver> Deref for Lease<D> {
    type Target = D::Connection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl<D: ConnectionDriver> fmt::Debug for Lease<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.entry.key)
            .field("id", &self.entry.id)
            .finish()
    }
}
