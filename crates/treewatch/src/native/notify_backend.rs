use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel as channel;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};

use super::{NativeBackend, RawBatch, RawEvent, RawEventKind};
use crate::bundle::{Callback, Registration};
use crate::config::WatchSettings;
use crate::executor::PooledExecutor;
use crate::key::SubscriptionKey;

/// Upper bound on raw events folded into one dispatch round.
const MAX_EVENTS_PER_ROUND: usize = 1024;

type RawMessage = notify::Result<notify::Event>;

struct Route {
    key: SubscriptionKey,
    id: u64,
    sink: Callback<RawBatch>,
    /// Cleared once the registered directory itself is reported deleted: the OS watch died
    /// with the old inode, even if a directory of the same name shows up again.
    alive: Arc<AtomicBool>,
}

/// Routes are looked up by the directory events arrive for. A registration whose path is not
/// canonical (macOS reports `/private/var/...` for `/var/...`) is routed under both spellings.
type RouteTable = HashMap<SubscriptionKey, Arc<Route>>;

#[derive(Debug, Clone, Copy)]
struct ActualWatch {
    mode: RecursiveMode,
    ref_count: usize,
    /// The watched directory was deleted; `notify` already dropped its watch.
    stale: bool,
}

type ActualTable = HashMap<PathBuf, ActualWatch>;

struct NotifyShared {
    watcher: Mutex<notify::RecommendedWatcher>,
    routes: Arc<RwLock<RouteTable>>,
    actual: Arc<Mutex<ActualTable>>,
    next_id: AtomicU64,
}

/// OS-backed watching through `notify`.
///
/// One `notify` watcher and one drain thread serve every registration of the backend. The OS
/// callback only pushes into a bounded queue; the drain thread groups raw events per
/// registration and dispatches them. If the queue overflows (or `notify` flags a rescan), every
/// registration receives an overflow.
pub struct NotifyBackend {
    shared: Arc<NotifyShared>,
    register_pool: Arc<PooledExecutor>,
    native_recursion: bool,
    stop_tx: channel::Sender<()>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl NotifyBackend {
    /// Builds a backend from the default settings plus `TREEWATCH_*` environment overrides.
    pub fn new() -> io::Result<Self> {
        let settings = WatchSettings::default()
            .with_env_overrides()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
        Self::with_settings(&settings)
    }

    pub fn with_settings(settings: &WatchSettings) -> io::Result<Self> {
        let (raw_tx, raw_rx) = channel::bounded::<RawMessage>(settings.raw_queue_capacity.max(1));
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let overflowed = Arc::new(AtomicBool::new(false));

        let overflowed_cb = Arc::clone(&overflowed);
        let watcher = notify::recommended_watcher(move |res| {
            try_send_or_overflow(&raw_tx, overflowed_cb.as_ref(), res);
        })
        .map_err(notify_error_to_io)?;

        let routes = Arc::new(RwLock::new(RouteTable::new()));
        let actual = Arc::new(Mutex::new(ActualTable::new()));
        let thread_routes = Arc::clone(&routes);
        let thread_actual = Arc::clone(&actual);
        let thread = std::thread::Builder::new()
            .name("treewatch-notify".to_owned())
            .spawn(move || {
                run_drain_loop(raw_rx, stop_rx, thread_routes, thread_actual, overflowed)
            })?;

        Ok(Self {
            shared: Arc::new(NotifyShared {
                watcher: Mutex::new(watcher),
                routes,
                actual,
                next_id: AtomicU64::new(1),
            }),
            register_pool: Arc::new(PooledExecutor::new(
                "treewatch-register",
                settings.registration_threads,
            )),
            native_recursion: cfg!(target_os = "macos") && settings.prefer_native_recursion,
            stop_tx,
            thread: Some(thread),
        })
    }
}

impl NativeBackend for NotifyBackend {
    fn name(&self) -> &'static str {
        "notify"
    }

    fn register(
        &self,
        key: &SubscriptionKey,
        sink: Callback<RawBatch>,
    ) -> io::Result<Box<dyn Registration>> {
        let shared = Arc::clone(&self.shared);
        let key = key.clone();
        // Registration can block on the OS; keep it on the dedicated pool.
        self.register_pool.run(move || shared.register(key, sink))?
    }

    fn supports_native_recursion(&self) -> bool {
        self.native_recursion
    }
}

impl NotifyShared {
    fn register(
        self: Arc<Self>,
        key: SubscriptionKey,
        sink: Callback<RawBatch>,
    ) -> io::Result<Box<dyn Registration>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let alive = Arc::new(AtomicBool::new(true));
        let route = Arc::new(Route {
            key: key.clone(),
            id,
            sink,
            alive: Arc::clone(&alive),
        });
        let aliases = route_aliases(&key);

        // Route first so nothing that arrives right after the OS watch starts is dropped.
        {
            let mut routes = self.routes.write();
            for alias in &aliases {
                routes.insert(alias.clone(), Arc::clone(&route));
            }
        }

        if let Err(err) = self.add_actual_watch(key.path(), to_recursive_mode(key.recursive())) {
            self.remove_routes(&aliases, id);
            return Err(err);
        }

        tracing::debug!(target: "treewatch.native", key = %key, "notify watch added");
        Ok(Box::new(NotifyRegistration {
            shared: self,
            key,
            aliases,
            id,
            alive,
        }))
    }

    fn add_actual_watch(&self, path: &Path, mode: RecursiveMode) -> io::Result<()> {
        let mut actual = self.actual.lock();
        match actual.get_mut(path) {
            Some(existing) if existing.stale => {
                let desired = combine_modes(existing.mode, mode);
                self.watcher
                    .lock()
                    .watch(path, desired)
                    .map_err(notify_error_to_io)?;
                existing.mode = desired;
                existing.stale = false;
                existing.ref_count += 1;
            }
            Some(existing) => {
                let desired = combine_modes(existing.mode, mode);
                if desired != existing.mode {
                    // Upgrade NonRecursive -> Recursive in place.
                    let mut watcher = self.watcher.lock();
                    watcher.unwatch(path).map_err(notify_error_to_io)?;
                    watcher.watch(path, desired).map_err(notify_error_to_io)?;
                    existing.mode = desired;
                }
                existing.ref_count += 1;
            }
            None => {
                self.watcher
                    .lock()
                    .watch(path, mode)
                    .map_err(notify_error_to_io)?;
                actual.insert(
                    path.to_path_buf(),
                    ActualWatch {
                        mode,
                        ref_count: 1,
                        stale: false,
                    },
                );
            }
        }
        Ok(())
    }

    fn remove_actual_watch(&self, path: &Path) -> io::Result<()> {
        let mut actual = self.actual.lock();
        let Some(existing) = actual.get_mut(path) else {
            return Ok(());
        };
        existing.ref_count = existing.ref_count.saturating_sub(1);
        if existing.ref_count > 0 {
            return Ok(());
        }
        let stale = existing.stale;
        actual.remove(path);
        if stale {
            return Ok(());
        }

        match self.watcher.lock().unwatch(path) {
            Ok(()) => Ok(()),
            // The directory is already gone; the OS dropped the watch for us.
            Err(err) if matches!(err.kind, notify::ErrorKind::WatchNotFound) => Ok(()),
            Err(err) if !path.exists() => {
                tracing::trace!(
                    target: "treewatch.native",
                    path = %path.display(),
                    error = %err,
                    "unwatch of vanished directory failed"
                );
                Ok(())
            }
            Err(err) => Err(notify_error_to_io(err)),
        }
    }

    fn remove_routes(&self, aliases: &[SubscriptionKey], id: u64) {
        let mut routes = self.routes.write();
        for alias in aliases {
            if routes.get(alias).is_some_and(|route| route.id == id) {
                routes.remove(alias);
            }
        }
    }
}

struct NotifyRegistration {
    shared: Arc<NotifyShared>,
    key: SubscriptionKey,
    aliases: Vec<SubscriptionKey>,
    id: u64,
    alive: Arc<AtomicBool>,
}

impl Registration for NotifyRegistration {
    fn close(self: Box<Self>) -> io::Result<()> {
        self.shared.remove_routes(&self.aliases, self.id);
        let result = self.shared.remove_actual_watch(self.key.path());
        tracing::debug!(target: "treewatch.native", key = %self.key, "notify watch removed");
        result
    }

    fn is_valid(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl Drop for NotifyBackend {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            join_drain_thread_best_effort(thread);
        }
    }
}

fn route_aliases(key: &SubscriptionKey) -> Vec<SubscriptionKey> {
    let mut aliases = vec![key.clone()];
    if let Ok(canonical) = std::fs::canonicalize(key.path()) {
        if canonical != key.path() {
            aliases.push(SubscriptionKey::new(canonical, key.recursive()));
        }
    }
    aliases
}

fn try_send_or_overflow<T>(tx: &channel::Sender<T>, overflowed: &AtomicBool, msg: T) {
    match tx.try_send(msg) {
        Ok(()) => {}
        Err(channel::TrySendError::Full(_)) => {
            overflowed.store(true, Ordering::Release);
        }
        Err(channel::TrySendError::Disconnected(_)) => {
            // The backend is shutting down; dropping the message is fine.
        }
    }
}

fn notify_error_to_io(err: notify::Error) -> io::Error {
    let kind = match &err.kind {
        notify::ErrorKind::PathNotFound => io::ErrorKind::NotFound,
        notify::ErrorKind::Io(inner) => inner.kind(),
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}

fn event_requests_rescan(event: &notify::Event) -> bool {
    // `notify` marks dropped events with `Flag::Rescan`; some backends emit a path-less
    // `EventKind::Other` instead.
    matches!(event.attrs.flag(), Some(notify::event::Flag::Rescan))
        || (matches!(event.kind, EventKind::Other) && event.paths.is_empty())
}

/// Maps one `notify` event to `(absolute path, kind)` pairs.
fn translate(event: notify::Event) -> Vec<(PathBuf, RawEventKind)> {
    let each = |paths: Vec<PathBuf>, kind: RawEventKind| -> Vec<(PathBuf, RawEventKind)> {
        paths.into_iter().map(|path| (path, kind)).collect()
    };

    match event.kind {
        EventKind::Access(_) => Vec::new(),
        EventKind::Create(_) => each(event.paths, RawEventKind::Created),
        EventKind::Remove(_) => each(event.paths, RawEventKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            each(event.paths, RawEventKind::Deleted)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            each(event.paths, RawEventKind::Created)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let mut paths = event.paths.into_iter();
            let mut out = Vec::with_capacity(2);
            if let Some(from) = paths.next() {
                out.push((from, RawEventKind::Deleted));
            }
            if let Some(to) = paths.next() {
                out.push((to, RawEventKind::Created));
            }
            out
        }
        // Renames without a direction (FSEvents): decide by whether the path is still there.
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .into_iter()
            .map(|path| {
                let kind = if path.symlink_metadata().is_ok() {
                    RawEventKind::Created
                } else {
                    RawEventKind::Deleted
                };
                (path, kind)
            })
            .collect(),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
            each(event.paths, RawEventKind::Modified)
        }
    }
}

/// Appends `(path, kind)` to the batch of every route interested in it: the non-recursive
/// route of the parent directory and the recursive routes of every ancestor.
fn route_event(
    routes: &RouteTable,
    path: &Path,
    kind: RawEventKind,
    batches: &mut HashMap<SubscriptionKey, (Callback<RawBatch>, RawBatch)>,
) {
    let mut deliver = |route: &Arc<Route>, relative: &Path| {
        let (_, batch) = batches
            .entry(route.key.clone())
            .or_insert_with(|| (Arc::clone(&route.sink), Vec::new()));
        let event = RawEvent::new(kind, relative);
        // inotify reports a deleted subdirectory both to the parent and as a self-event.
        if batch.last() != Some(&event) {
            batch.push(event);
        }
    };

    if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
        if let Some(route) = routes.get(&SubscriptionKey::new(parent, false)) {
            deliver(route, Path::new(name));
        }
    }
    for ancestor in path.ancestors().skip(1) {
        if let Some(route) = routes.get(&SubscriptionKey::new(ancestor, true)) {
            if let Ok(relative) = path.strip_prefix(ancestor) {
                deliver(route, relative);
            }
        }
    }
}

/// Marks every registration of a deleted directory as dead, so the next subscriber for it
/// (the directory may be recreated under the same name) registers a fresh OS watch.
fn invalidate_deleted(routes: &RouteTable, actual: &Mutex<ActualTable>, path: &Path) {
    let mut hit = false;
    for recursive in [false, true] {
        if let Some(route) = routes.get(&SubscriptionKey::new(path, recursive)) {
            route.alive.store(false, Ordering::Release);
            tracing::debug!(target: "treewatch.native", key = %route.key, "watched directory deleted");
            hit = true;
        }
    }
    if hit {
        if let Some(existing) = actual.lock().get_mut(path) {
            existing.stale = true;
        }
    }
}

fn dispatch(batches: HashMap<SubscriptionKey, (Callback<RawBatch>, RawBatch)>) {
    for (key, (sink, batch)) in batches {
        if batch.is_empty() {
            continue;
        }
        tracing::trace!(target: "treewatch.native", key = %key, events = batch.len(), "dispatch");
        sink(&batch);
    }
}

fn broadcast_overflow(routes: &RwLock<RouteTable>) {
    let sinks: HashMap<SubscriptionKey, Callback<RawBatch>> = routes
        .read()
        .values()
        .map(|route| (route.key.clone(), Arc::clone(&route.sink)))
        .collect();
    tracing::debug!(
        target: "treewatch.native",
        registrations = sinks.len(),
        "native events were dropped; reporting overflow"
    );
    for sink in sinks.into_values() {
        sink(&vec![RawEvent::overflow()]);
    }
}

fn run_drain_loop(
    raw_rx: channel::Receiver<RawMessage>,
    stop_rx: channel::Receiver<()>,
    routes: Arc<RwLock<RouteTable>>,
    actual: Arc<Mutex<ActualTable>>,
    overflowed: Arc<AtomicBool>,
) {
    loop {
        // Once anything was dropped, the only safe recovery is an overflow for everyone.
        if overflowed.swap(false, Ordering::AcqRel) {
            while raw_rx.try_recv().is_ok() {}
            broadcast_overflow(&routes);
        }

        channel::select! {
            recv(stop_rx) -> _ => break,
            recv(raw_rx) -> msg => {
                let Ok(first) = msg else {
                    break;
                };
                let mut messages = vec![first];
                messages.extend(raw_rx.try_iter().take(MAX_EVENTS_PER_ROUND));

                let mut translated = Vec::new();
                for message in messages {
                    match message {
                        Ok(event) if event_requests_rescan(&event) => {
                            overflowed.store(true, Ordering::Release);
                        }
                        Ok(event) => translated.extend(translate(event)),
                        Err(err) => {
                            // Many notify backends use errors to signal lost events.
                            tracing::warn!(target: "treewatch.native", error = %err, "notify error");
                            overflowed.store(true, Ordering::Release);
                        }
                    }
                }
                if overflowed.load(Ordering::Acquire) {
                    continue;
                }

                let mut batches = HashMap::new();
                {
                    let routes = routes.read();
                    for (path, kind) in &translated {
                        if *kind == RawEventKind::Deleted {
                            invalidate_deleted(&routes, &actual, path);
                        }
                        route_event(&routes, path, *kind, &mut batches);
                    }
                }
                dispatch(batches);
            }
        }
    }
}

#[track_caller]
fn join_drain_thread_best_effort(thread: std::thread::JoinHandle<()>) {
    if let Err(panic) = thread.join() {
        let loc = std::panic::Location::caller();
        tracing::debug!(
            target: "treewatch.native",
            file = loc.file(),
            line = loc.line(),
            panic = %crate::executor::panic_message(panic.as_ref()),
            "notify drain thread panicked (best effort join)"
        );
    }
}

fn combine_modes(a: RecursiveMode, b: RecursiveMode) -> RecursiveMode {
    if a == RecursiveMode::Recursive || b == RecursiveMode::Recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    }
}

fn to_recursive_mode(recursive: bool) -> RecursiveMode {
    if recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind};

    fn table(keys: &[(&str, bool)]) -> (RouteTable, Arc<Mutex<Vec<(SubscriptionKey, RawBatch)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut routes = RouteTable::new();
        for (id, (path, recursive)) in keys.iter().enumerate() {
            let key = SubscriptionKey::new(*path, *recursive);
            let sink_key = key.clone();
            let sink_seen = Arc::clone(&seen);
            let route = Arc::new(Route {
                key: key.clone(),
                id: id as u64,
                sink: Arc::new(move |batch: &RawBatch| {
                    sink_seen.lock().push((sink_key.clone(), batch.clone()))
                }),
                alive: Arc::new(AtomicBool::new(true)),
            });
            routes.insert(key, route);
        }
        (routes, seen)
    }

    #[test]
    fn routes_to_parent_and_recursive_ancestors() {
        let (routes, seen) = table(&[("/w", false), ("/w/a", false), ("/w", true)]);
        let mut batches = HashMap::new();
        route_event(&routes, Path::new("/w/a/f.txt"), RawEventKind::Created, &mut batches);
        dispatch(batches);

        let mut seen = seen.lock().clone();
        seen.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        assert_eq!(
            seen,
            vec![
                (
                    SubscriptionKey::new("/w/a", false),
                    vec![RawEvent::new(RawEventKind::Created, "f.txt")]
                ),
                (
                    SubscriptionKey::new("/w", true),
                    vec![RawEvent::new(RawEventKind::Created, "a/f.txt")]
                ),
            ]
        );
    }

    #[test]
    fn consecutive_duplicate_events_are_folded() {
        let (routes, seen) = table(&[("/w", false)]);
        let mut batches = HashMap::new();
        route_event(&routes, Path::new("/w/d"), RawEventKind::Deleted, &mut batches);
        route_event(&routes, Path::new("/w/d"), RawEventKind::Deleted, &mut batches);
        route_event(&routes, Path::new("/w/e"), RawEventKind::Created, &mut batches);
        dispatch(batches);

        assert_eq!(
            seen.lock()[0].1,
            vec![
                RawEvent::new(RawEventKind::Deleted, "d"),
                RawEvent::new(RawEventKind::Created, "e"),
            ]
        );
    }

    #[test]
    fn deleting_a_watched_directory_invalidates_its_routes() {
        let (routes, _) = table(&[("/w", false), ("/w/sub", false), ("/w/sub", true)]);
        let actual = Mutex::new(ActualTable::new());
        actual.lock().insert(
            PathBuf::from("/w/sub"),
            ActualWatch {
                mode: RecursiveMode::Recursive,
                ref_count: 2,
                stale: false,
            },
        );

        invalidate_deleted(&routes, &actual, Path::new("/w/sub/file.txt"));
        assert!(routes.values().all(|route| route.alive.load(Ordering::Acquire)));
        assert!(!actual.lock()[Path::new("/w/sub")].stale);

        invalidate_deleted(&routes, &actual, Path::new("/w/sub"));
        let alive = |path: &str, recursive: bool| {
            routes[&SubscriptionKey::new(path, recursive)]
                .alive
                .load(Ordering::Acquire)
        };
        assert!(alive("/w", false));
        assert!(!alive("/w/sub", false));
        assert!(!alive("/w/sub", true));
        assert!(actual.lock()[Path::new("/w/sub")].stale);
    }

    #[test]
    fn translates_notify_kinds() {
        let created = notify::Event::new(EventKind::Create(CreateKind::File)).add_path("/w/a".into());
        assert_eq!(translate(created), vec![(PathBuf::from("/w/a"), RawEventKind::Created)]);

        let removed = notify::Event::new(EventKind::Remove(RemoveKind::Any)).add_path("/w/a".into());
        assert_eq!(translate(removed), vec![(PathBuf::from("/w/a"), RawEventKind::Deleted)]);

        let renamed = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path("/w/old".into())
            .add_path("/w/new".into());
        assert_eq!(
            translate(renamed),
            vec![
                (PathBuf::from("/w/old"), RawEventKind::Deleted),
                (PathBuf::from("/w/new"), RawEventKind::Created),
            ]
        );

        let accessed = notify::Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path("/w/a".into());
        assert!(translate(accessed).is_empty());
    }

    #[test]
    fn rescan_flag_requests_overflow() {
        let flagged = notify::Event::new(EventKind::Any).set_flag(notify::event::Flag::Rescan);
        assert!(event_requests_rescan(&flagged));
        assert!(event_requests_rescan(&notify::Event::new(EventKind::Other)));
        let plain = notify::Event::new(EventKind::Other).add_path("/w/a".into());
        assert!(!event_requests_rescan(&plain));
    }

    #[test]
    fn try_send_or_overflow_sets_flag_when_full() {
        let (tx, rx) = channel::bounded(1);
        let overflowed = AtomicBool::new(false);
        try_send_or_overflow(&tx, &overflowed, 1);
        assert!(!overflowed.load(Ordering::Acquire));
        try_send_or_overflow(&tx, &overflowed, 2);
        assert!(overflowed.load(Ordering::Acquire));
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1]);
    }
}
