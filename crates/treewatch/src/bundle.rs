//! Subscription bundling.
//!
//! Many logical watches can want the same physical registration: two watches on one
//! directory, or a recursive tree whose nodes overlap with a plain directory watch. The
//! [`Multiplexer`] deduplicates them so every distinct key is registered with the source at
//! most once, and fans every received batch out to all current subscribers.
//!
//! # Lifecycle of a key
//!
//! 1. The first `subscribe` for a key creates an empty entry, locks it and opens the physical
//!    registration. Concurrent subscribers for the same key wait on the entry's lock and then
//!    join the live registration.
//! 2. Removing the last subscriber does not tear the registration down immediately. A close is
//!    scheduled after a grace period, so a watch that is quickly re-opened (very common when a
//!    tree re-syncs its children) keeps its registration. With a zero grace period the close
//!    happens inline and its error is returned to the unsubscribing caller.
//! 3. When the scheduled close fires it re-checks, under the entry's lock, that the entry is
//!    still empty. Only then is the entry marked closed, removed from the map and the
//!    registration closed.
//!
//! A subscriber that finds a closed entry (it fetched the entry from the map just before step 3
//! removed it) retries with a fresh entry, so nobody ever joins a torn-down registration.
//! One that finds a registration the source no longer serves (see [`Registration::is_valid`])
//! closes it and registers again on behalf of every subscriber of the entry.

use std::fmt;
use std::hash::Hash;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::timer::DelayedExecutor;

/// Grace period between the last unsubscribe and closing the physical registration.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Callback receiving every batch dispatched for a key.
pub type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A live registration with a [`Subscribable`] source.
pub trait Registration: Send {
    /// Stops delivery for this registration. Consumes the handle, so it runs at most once.
    fn close(self: Box<Self>) -> io::Result<()>;

    /// Whether the source still delivers for this registration. A registration whose target
    /// vanished underneath it (a watched directory deleted and recreated) reports `false`, and
    /// the next subscriber for its key registers again.
    fn is_valid(&self) -> bool {
        true
    }
}

/// A source that can deliver batches of `E` for keys of type `K`.
pub trait Subscribable<K, E>: Send + Sync {
    fn subscribe(&self, key: &K, sink: Callback<E>) -> io::Result<Box<dyn Registration>>;
}

struct Subscriber<E> {
    id: u64,
    callback: Callback<E>,
}

impl<E> Clone for Subscriber<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: Arc::clone(&self.callback),
        }
    }
}

#[derive(Default)]
struct EntryState {
    closed: bool,
    registration: Option<Box<dyn Registration>>,
}

struct Entry<E> {
    /// Serializes every lifecycle transition for this key.
    state: Mutex<EntryState>,
    /// Copy-on-write so dispatch can iterate a snapshot without holding a lock.
    subscribers: RwLock<Arc<Vec<Subscriber<E>>>>,
}

impl<E> Entry<E> {
    fn new() -> Self {
        Self {
            state: Mutex::new(EntryState::default()),
            subscribers: RwLock::new(Arc::new(Vec::new())),
        }
    }

    fn add(&self, subscriber: Subscriber<E>) {
        let mut subscribers = self.subscribers.write();
        let mut next = Vec::with_capacity(subscribers.len() + 1);
        next.extend(subscribers.iter().cloned());
        next.push(subscriber);
        *subscribers = Arc::new(next);
    }

    fn remove(&self, id: u64) {
        let mut subscribers = self.subscribers.write();
        if subscribers.iter().any(|s| s.id == id) {
            let next = subscribers.iter().filter(|s| s.id != id).cloned().collect();
            *subscribers = Arc::new(next);
        }
    }

    fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    fn snapshot(&self) -> Arc<Vec<Subscriber<E>>> {
        Arc::clone(&self.subscribers.read())
    }
}

struct Shared<K, E> {
    source: Arc<dyn Subscribable<K, E>>,
    entries: DashMap<K, Arc<Entry<E>>>,
    next_id: AtomicU64,
    grace: Duration,
    reaper: DelayedExecutor,
}

/// Deduplicates subscriptions onto one physical registration per key.
pub struct Multiplexer<K, E> {
    shared: Arc<Shared<K, E>>,
}

impl<K, E> Clone for Multiplexer<K, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, E> Multiplexer<K, E>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    E: 'static,
{
    pub fn new(source: Arc<dyn Subscribable<K, E>>, grace: Duration) -> io::Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                source,
                entries: DashMap::new(),
                next_id: AtomicU64::new(1),
                grace,
                reaper: DelayedExecutor::new("treewatch-reaper")?,
            }),
        })
    }

    /// Adds `callback` as a subscriber for `key`, registering with the source if this is the
    /// first live subscriber.
    ///
    /// A registration failure is returned to this caller and leaves no entry behind.
    pub fn subscribe(&self, key: &K, callback: Callback<E>) -> io::Result<SubscriptionGuard> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        loop {
            // Clone the entry out so the map shard is not locked while we wait on the entry.
            let entry = Arc::clone(
                self.shared
                    .entries
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Entry::new()))
                    .value(),
            );

            let mut state = entry.state.lock();
            if state.closed {
                // Lost the race with a scheduled close; that entry is leaving the map.
                drop(state);
                std::thread::yield_now();
                continue;
            }

            entry.add(Subscriber {
                id,
                callback: Arc::clone(&callback),
            });

            if state.registration.as_ref().is_some_and(|r| !r.is_valid()) {
                if let Some(stale) = state.registration.take() {
                    tracing::debug!(
                        target: "treewatch.bundle",
                        key = %key,
                        "replacing stale registration"
                    );
                    if let Err(err) = stale.close() {
                        tracing::debug!(
                            target: "treewatch.bundle",
                            key = %key,
                            error = %err,
                            "closing stale registration failed"
                        );
                    }
                }
            }

            if state.registration.is_none() {
                let sink = dispatcher(Arc::downgrade(&entry));
                match self.shared.source.subscribe(key, sink) {
                    Ok(registration) => {
                        tracing::debug!(target: "treewatch.bundle", key = %key, "registered");
                        state.registration = Some(registration);
                    }
                    Err(err) => {
                        entry.remove(id);
                        if entry.is_empty() {
                            state.closed = true;
                            self.shared
                                .entries
                                .remove_if(key, |_, current| Arc::ptr_eq(current, &entry));
                        }
                        tracing::debug!(
                            target: "treewatch.bundle",
                            key = %key,
                            error = %err,
                            "registration failed"
                        );
                        return Err(err);
                    }
                }
            }
            drop(state);

            let unsubscribe = {
                let shared = Arc::clone(&self.shared);
                let key = key.clone();
                move || Shared::unsubscribe(&shared, key, entry, id)
            };
            return Ok(SubscriptionGuard {
                closed: AtomicBool::new(false),
                unsubscribe: Mutex::new(Some(Box::new(unsubscribe))),
            });
        }
    }

    /// Number of keys currently holding an entry (live or waiting for their grace period).
    pub fn active_keys(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn subscriber_count(&self, key: &K) -> usize {
        self.shared
            .entries
            .get(key)
            .map(|entry| entry.snapshot().len())
            .unwrap_or(0)
    }
}

impl<K, E> Shared<K, E>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    E: 'static,
{
    fn unsubscribe(shared: &Arc<Self>, key: K, entry: Arc<Entry<E>>, id: u64) -> io::Result<()> {
        let idle = {
            let state = entry.state.lock();
            entry.remove(id);
            entry.is_empty() && !state.closed
        };
        if !idle {
            return Ok(());
        }
        if shared.grace.is_zero() {
            return shared.close_if_unused(&key, &entry);
        }

        let reap = {
            let shared = Arc::clone(shared);
            move || {
                if let Err(err) = shared.close_if_unused(&key, &entry) {
                    tracing::error!(
                        target: "treewatch.bundle",
                        key = %key,
                        error = %err,
                        "failed to close registration"
                    );
                }
            }
        };
        shared.reaper.schedule(shared.grace, Box::new(reap));
        Ok(())
    }

    fn close_if_unused(&self, key: &K, entry: &Arc<Entry<E>>) -> io::Result<()> {
        let mut state = entry.state.lock();
        if state.closed || !entry.is_empty() {
            return Ok(());
        }
        state.closed = true;

        // Close before leaving the map: a newcomer must not register the key while the old
        // registration is still live.
        let result = match state.registration.take() {
            Some(registration) => registration.close(),
            None => Ok(()),
        };
        self.entries
            .remove_if(key, |_, current| Arc::ptr_eq(current, entry));
        if result.is_ok() {
            tracing::debug!(target: "treewatch.bundle", key = %key, "unregistered");
        }
        result
    }
}

fn dispatcher<E: 'static>(entry: Weak<Entry<E>>) -> Callback<E> {
    Arc::new(move |batch: &E| {
        let Some(entry) = entry.upgrade() else {
            return;
        };
        for subscriber in entry.snapshot().iter() {
            (subscriber.callback)(batch);
        }
    })
}

/// One subscriber's membership in a [`Multiplexer`] entry.
///
/// Closing (explicitly or on drop) removes the subscriber; the physical registration is
/// closed after the grace period once no subscribers remain.
pub struct SubscriptionGuard {
    closed: AtomicBool,
    unsubscribe: Mutex<Option<Box<dyn FnOnce() -> io::Result<()> + Send>>>,
}

impl SubscriptionGuard {
    /// Removes this subscriber. Returns the registration's close error when this was the last
    /// subscriber and the grace period is zero; later calls return `Ok`.
    pub fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let unsubscribe = self.unsubscribe.lock().take();
        match unsubscribe {
            Some(unsubscribe) => unsubscribe(),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::error!(target: "treewatch.bundle", error = %err, "failed to close registration");
        }
    }
}

impl fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("closed", &self.is_closed())
            .finish()
    }
}
