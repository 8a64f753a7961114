use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{NativeBackend, RawBatch, RawEvent, RawEventKind};
use crate::bundle::{Callback, Registration};
use crate::key::SubscriptionKey;

#[derive(Default)]
struct ManualShared {
    routes: Mutex<HashMap<SubscriptionKey, (u64, Callback<RawBatch>)>>,
    stale: Mutex<HashSet<u64>>,
    next_id: AtomicU64,
    registrations: AtomicUsize,
    unregistrations: AtomicUsize,
    native_recursion: bool,
}

/// A deterministic backend driven entirely by the caller.
///
/// Registrations behave like a real per-directory facility (registering a missing directory
/// fails with `NotFound`), but no events are produced on their own: tests inject them with
/// [`ManualBackend::push`]. Delivery is synchronous on the injecting thread.
///
/// Cloning yields another handle to the same backend.
#[derive(Clone, Default)]
pub struct ManualBackend {
    shared: Arc<ManualShared>,
}

impl ManualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that claims to watch recursive keys natively.
    pub fn with_native_recursion() -> Self {
        Self {
            shared: Arc::new(ManualShared {
                native_recursion: true,
                ..ManualShared::default()
            }),
        }
    }

    /// Delivers `batch` to the registration for `key`. Returns `false` if nothing is
    /// registered for it.
    pub fn push(&self, key: &SubscriptionKey, batch: RawBatch) -> bool {
        let sink = self
            .shared
            .routes
            .lock()
            .get(key)
            .map(|(_, sink)| Arc::clone(sink));
        match sink {
            Some(sink) => {
                sink(&batch);
                true
            }
            None => false,
        }
    }

    /// Delivers one event for `name` to the non-recursive registration of `dir`.
    pub fn push_event(&self, dir: &Path, kind: RawEventKind, name: impl AsRef<Path>) -> bool {
        self.push(
            &SubscriptionKey::new(dir, false),
            vec![RawEvent::new(kind, name.as_ref())],
        )
    }

    /// Delivers an overflow to every live registration, like a backend whose queue overflowed.
    pub fn overflow_all(&self) {
        let sinks: Vec<_> = self
            .shared
            .routes
            .lock()
            .values()
            .map(|(_, sink)| Arc::clone(sink))
            .collect();
        for sink in sinks {
            sink(&vec![RawEvent::overflow()]);
        }
    }

    /// Marks the registration for `key` as no longer served, like a directory deleted under
    /// its OS watch. It stays registered until closed; events pushed to it are still
    /// delivered. Returns `false` if nothing is registered for `key`.
    pub fn invalidate(&self, key: &SubscriptionKey) -> bool {
        let id = self.shared.routes.lock().get(key).map(|(id, _)| *id);
        match id {
            Some(id) => self.shared.stale.lock().insert(id),
            None => false,
        }
    }

    pub fn is_registered(&self, key: &SubscriptionKey) -> bool {
        self.shared.routes.lock().contains_key(key)
    }

    /// Currently registered keys, sorted by path.
    pub fn registered_keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = self.shared.routes.lock().keys().cloned().collect();
        keys.sort_by(|a, b| a.path().cmp(b.path()).then(a.recursive().cmp(&b.recursive())));
        keys
    }

    /// Total number of successful registrations so far.
    pub fn registration_count(&self) -> usize {
        self.shared.registrations.load(Ordering::SeqCst)
    }

    pub fn unregistration_count(&self) -> usize {
        self.shared.unregistrations.load(Ordering::SeqCst)
    }
}

impl NativeBackend for ManualBackend {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn register(
        &self,
        key: &SubscriptionKey,
        sink: Callback<RawBatch>,
    ) -> io::Result<Box<dyn Registration>> {
        let meta = std::fs::metadata(key.path())?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", key.path().display()),
            ));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let mut routes = self.shared.routes.lock();
        if routes.contains_key(key) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{key} is already registered"),
            ));
        }
        routes.insert(key.clone(), (id, sink));
        self.shared.registrations.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(ManualRegistration {
            shared: Arc::clone(&self.shared),
            key: key.clone(),
            id,
        }))
    }

    fn supports_native_recursion(&self) -> bool {
        self.shared.native_recursion
    }
}

struct ManualRegistration {
    shared: Arc<ManualShared>,
    key: SubscriptionKey,
    id: u64,
}

impl Registration for ManualRegistration {
    fn close(self: Box<Self>) -> io::Result<()> {
        let mut routes = self.shared.routes.lock();
        if routes.get(&self.key).is_some_and(|(id, _)| *id == self.id) {
            routes.remove(&self.key);
            self.shared.unregistrations.fetch_add(1, Ordering::SeqCst);
        }
        self.shared.stale.lock().remove(&self.id);
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.shared.stale.lock().contains(&self.id)
    }
}
