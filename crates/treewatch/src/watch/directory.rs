use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{filter_accepts, EventFilter, EventHandlingWatch, HandlerChain};
use crate::bundle::{Callback, SubscriptionGuard};
use crate::event::{relative_path, WatchEvent, WatchEventKind};
use crate::executor::Executor;
use crate::key::SubscriptionKey;
use crate::native::{RawBatch, RawEventKind};
use crate::scope::WatchScope;
use crate::service::WatchService;

pub(crate) struct DirectoryWatchOptions {
    pub(crate) service: WatchService,
    /// The directory to register.
    pub(crate) path: PathBuf,
    /// The root events are expressed against; `path` itself for a standalone watch.
    pub(crate) root: PathBuf,
    pub(crate) recursive: bool,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) chain: HandlerChain,
    pub(crate) filter: Option<EventFilter>,
}

#[derive(Default)]
struct Pending {
    events: VecDeque<WatchEvent>,
    /// A drain job is queued or running on the executor.
    scheduled: bool,
}

struct DirectoryInner {
    service: WatchService,
    path: PathBuf,
    root: PathBuf,
    /// `path` relative to `root`.
    offset: PathBuf,
    recursive: bool,
    executor: Arc<dyn Executor>,
    chain: HandlerChain,
    filter: Option<EventFilter>,
    started: AtomicBool,
    closed: AtomicBool,
    subscription: Mutex<Option<SubscriptionGuard>>,
    pending: Mutex<Pending>,
}

/// A watch on one directory (and, with native recursion, everything below it).
///
/// Raw batches from the backend are translated into [`WatchEvent`]s and queued. A single drain
/// job at a time runs on the executor, so handlers see the events of one watch in the order the
/// backend produced them, never concurrently. Once closed, queued events are dropped.
///
/// Cloning yields another handle to the same watch.
#[derive(Clone)]
pub struct DirectoryWatch {
    inner: Arc<DirectoryInner>,
}

impl DirectoryWatch {
    pub(crate) fn new(options: DirectoryWatchOptions) -> Self {
        let offset = relative_path(&options.root, &options.path);
        Self {
            inner: Arc::new(DirectoryInner {
                service: options.service,
                path: options.path,
                root: options.root,
                offset,
                recursive: options.recursive,
                executor: options.executor,
                chain: options.chain,
                filter: options.filter,
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                subscription: Mutex::new(None),
                pending: Mutex::new(Pending::default()),
            }),
        }
    }

    /// Registers with the backend. Fails if the directory cannot be watched (it does not
    /// exist, permissions, OS limits) or if the watch was already opened. A failed open can be
    /// retried.
    pub fn open(&self) -> io::Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("watch on {} was already opened", self.inner.path.display()),
            ));
        }

        let weak = Arc::downgrade(&self.inner);
        let callback: Callback<RawBatch> = Arc::new(move |batch: &RawBatch| {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.on_batch(batch);
            }
        });
        let key = SubscriptionKey::new(&self.inner.path, self.inner.recursive);
        let guard = match self.inner.service.subscribe(&key, callback) {
            Ok(guard) => guard,
            Err(err) => {
                self.inner.started.store(false, Ordering::Release);
                return Err(err);
            }
        };

        let mut subscription = self.inner.subscription.lock();
        if self.inner.closed.load(Ordering::Acquire) {
            drop(subscription);
            guard.close()?;
        } else {
            *subscription = Some(guard);
        }
        tracing::debug!(target: "treewatch.watch", key = %key, "directory watch opened");
        Ok(())
    }

    /// Stops delivery. Idempotent; events still queued are dropped.
    ///
    /// The registration itself is released once no other watch shares it. With a zero close
    /// grace that happens here and a failure is returned; otherwise it happens later and a
    /// failure is only logged.
    pub fn close(&self) -> io::Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let guard = self.inner.subscription.lock().take();
        let result = match guard {
            Some(guard) => guard.close(),
            None => Ok(()),
        };
        self.inner.pending.lock().events.clear();
        tracing::debug!(
            target: "treewatch.watch",
            path = %self.inner.path.display(),
            "directory watch closed"
        );
        result
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl DirectoryInner {
    fn translate(&self, kind: RawEventKind, relative: Option<&Path>) -> WatchEvent {
        let relative = match relative {
            Some(name) if !name.as_os_str().is_empty() => self.offset.join(name),
            _ => self.offset.clone(),
        };
        WatchEvent::new(WatchEventKind::from(kind), &self.root, relative)
    }

    fn on_batch(self: Arc<Self>, batch: &RawBatch) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let events = batch
            .iter()
            .map(|raw| self.translate(raw.kind, raw.path.as_deref()))
            .collect();
        self.enqueue(events);
    }

    fn enqueue(self: Arc<Self>, events: Vec<WatchEvent>) {
        {
            let mut pending = self.pending.lock();
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            pending.events.extend(events);
            if pending.scheduled || pending.events.is_empty() {
                return;
            }
            pending.scheduled = true;
        }

        let executor = Arc::clone(&self.executor);
        executor.execute(Box::new(move || self.drain()));
    }

    fn drain(self: Arc<Self>) {
        let watch = DirectoryWatch {
            inner: Arc::clone(&self),
        };
        let mut unwinding = DrainGuard {
            pending: &self.pending,
            armed: true,
        };
        loop {
            let event = {
                let mut pending = self.pending.lock();
                if self.closed.load(Ordering::Acquire) {
                    pending.events.clear();
                }
                match pending.events.pop_front() {
                    Some(event) => event,
                    None => {
                        pending.scheduled = false;
                        unwinding.armed = false;
                        return;
                    }
                }
            };
            self.deliver(&watch, &event);
        }
    }

    fn deliver(&self, watch: &DirectoryWatch, event: &WatchEvent) {
        if let Some(filter) = &self.filter {
            if !filter_accepts(filter, watch, event) {
                return;
            }
        }
        tracing::trace!(target: "treewatch.watch", event = %event, "deliver");
        self.chain.dispatch(watch, event);
    }
}

/// Releases the drain slot if a drain unwinds, so the next event schedules a new one.
struct DrainGuard<'a> {
    pending: &'a Mutex<Pending>,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.lock().scheduled = false;
        }
    }
}

impl EventHandlingWatch for DirectoryWatch {
    fn path(&self) -> &Path {
        &self.inner.path
    }

    fn root(&self) -> &Path {
        &self.inner.root
    }

    fn scope(&self) -> WatchScope {
        if self.inner.recursive {
            WatchScope::PathAndAllDescendants
        } else {
            WatchScope::PathAndChildren
        }
    }

    fn handle_event(&self, event: WatchEvent) {
        Arc::clone(&self.inner).enqueue(vec![event]);
    }

    fn detach(&self) -> Arc<dyn EventHandlingWatch> {
        Arc::new(self.clone())
    }
}
