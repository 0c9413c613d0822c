//! Deduplication of concurrent work per key.
//!
//! A [`Group`] makes sure that only one unit of work runs at a time for a given key. Concurrent
//! callers for the same key wait for and share the outcome of that single execution.
//!
//! Unlike a plain memoizing future, a caller that stops waiting (by dropping its future, for
//! example through [`tokio::time::timeout`]) only detaches *itself*. The work keeps running for
//! everybody else. Once the last waiter is gone, the [`CancellationToken`] handed to the work is
//! cancelled. This is merely a signal, the work is never aborted forcibly.
//!
//! Such abandoned work still counts as in flight. The next caller for its key does not join it,
//! but starts a fresh execution that waits for the abandoned one to finish first.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::CacheError;
use crate::utils::{CallOnDrop, panic_message};

/// The outcome of a unit of work, or the message of the panic it raised.
type Outcome<V> = Result<V, Arc<str>>;
type OutcomeChannel<V> = Shared<oneshot::Receiver<Outcome<V>>>;
type CallMap<K, V> = Arc<Mutex<HashMap<K, PendingCall<V>>>>;

/// A unit of work that is currently in flight, along with the number of callers waiting on it.
struct PendingCall<V> {
    /// Distinguishes this call from later calls for the same key.
    id: u64,
    /// The lifetime of the work, cancelled once nobody waits for it anymore.
    ///
    /// A cancelled token marks the call as abandoned.
    token: CancellationToken,
    waiters: usize,
    outcome: OutcomeChannel<V>,
}

/// Runs at most one unit of work per key at a time, sharing its outcome among all callers.
pub struct Group<K, V> {
    calls: CallMap<K, V>,
    next_id: AtomicU64,
    /// Where work is spawned, the ambient runtime if `None`.
    runtime: Option<Handle>,
}

impl<K, V> std::fmt::Debug for Group<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let in_flight = self.calls.try_lock().map(|c| c.len()).unwrap_or_default();
        f.debug_struct("Group")
            .field("in_flight", &in_flight)
            .finish()
    }
}

impl<K, V> Default for Group<K, V> {
    fn default() -> Self {
        Self {
            calls: Default::default(),
            next_id: AtomicU64::new(0),
            runtime: None,
        }
    }
}

impl<K, V> Group<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a group which spawns all work onto `runtime`.
    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            runtime: Some(runtime),
            ..Self::default()
        }
    }

    /// The number of keys with work currently in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Runs `work` for `key`, or joins the execution already in flight for that key.
    ///
    /// `work` is only invoked if no other execution for `key` is in flight. It is spawned onto the
    /// group's runtime and receives a [`CancellationToken`] which is not tied to this or any other
    /// caller, but is cancelled once every caller has stopped waiting.
    ///
    /// Dropping the returned future detaches this caller without affecting the work or any other
    /// caller.
    ///
    /// # Panics
    ///
    /// If `work` panics, the panic is re-raised in every caller waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InternalError`] if the work was dropped before completing, which
    /// happens when the runtime shuts down.
    pub async fn work<F, Fut>(&self, key: K, work: F) -> Result<V, CacheError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (id, outcome) = {
            let mut calls = self.calls.lock().unwrap();
            let call = match calls.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    if entry.get().token.is_cancelled() {
                        metric!(counter("conncache.singleflight.spawn") += 1);
                        let previous = entry.get().outcome.clone();
                        entry.insert(self.spawn_call(key.clone(), work, Some(previous)));
                    } else {
                        metric!(counter("conncache.singleflight.join") += 1);
                    }
                    entry.into_mut()
                }
                Entry::Vacant(entry) => {
                    metric!(counter("conncache.singleflight.spawn") += 1);
                    entry.insert(self.spawn_call(key.clone(), work, None))
                }
            };
            call.waiters += 1;
            (call.id, call.outcome.clone())
        };

        let _detach_token = {
            let calls = Arc::clone(&self.calls);
            CallOnDrop::new(move || detach(&calls, &key, id))
        };

        match outcome.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => std::panic::resume_unwind(Box::new(message.to_string())),
            Err(oneshot::Canceled) => {
                tracing::error!("deduplicated work was dropped before completing");
                Err(CacheError::InternalError)
            }
        }
    }

    /// Spawns `work` and creates the [`PendingCall`] tracking it.
    ///
    /// If given, `work` only starts after the `previous` call completed.
    ///
    /// This must be called with the lock on `self.calls` held, and the returned call has to be
    /// inserted right away, as the spawned task removes it again once it finishes.
    fn spawn_call<F, Fut>(
        &self,
        key: K,
        work: F,
        previous: Option<OutcomeChannel<V>>,
    ) -> PendingCall<V>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let (sender, receiver) = oneshot::channel();

        let remove_call_token = {
            let calls = Arc::clone(&self.calls);
            CallOnDrop::new(move || {
                let mut calls = calls.lock().unwrap();
                if calls.get(&key).is_some_and(|call| call.id == id) {
                    calls.remove(&key);
                }
            })
        };

        let future = AssertUnwindSafe(work(token.clone())).catch_unwind();
        let task = async move {
            if let Some(previous) = previous {
                previous.await.ok();
            }
            let outcome = future.await.map_err(panic_message);
            // Drop the token first to evict from the map. This ensures that callers either
            // get a channel that will receive data, or they create a new call.
            drop(remove_call_token);
            sender.send(outcome).ok();
        }
        .instrument(tracing::Span::current())
        .bind_hub(Hub::new_from_top(Hub::current()));

        match &self.runtime {
            Some(runtime) => runtime.spawn(task),
            None => tokio::spawn(task),
        };

        PendingCall {
            id,
            token,
            waiters: 0,
            outcome: receiver.shared(),
        }
    }
}

/// Removes one waiter from the call `id`, cancelling the call if it was the last.
fn detach<K: Eq + Hash, V>(calls: &Mutex<HashMap<K, PendingCall<V>>>, key: &K, id: u64) {
    let mut calls = calls.lock().unwrap();
    let Some(call) = calls.get_mut(key) else {
        return;
    };
    // The call already completed and a new one took its place.
    if call.id != id {
        return;
    }
    call.waiters -= 1;
    if call.waiters == 0 {
        call.token.cancel();
    }
}
