//! Watches: per-directory, single-file and recursive tree.
//!
//! Every watch delivers [`WatchEvent`]s through a [`HandlerChain`]: the user's handler first,
//! then internal handlers (overflow recovery, tree maintenance). Each handler is isolated: a
//! panic is caught, logged and does not stop the rest of the chain or later events.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use crate::event::{WatchEvent, WatchEventKind};
use crate::executor::panic_message;
use crate::scope::WatchScope;

mod directory;
mod file;
mod tree;

pub use directory::DirectoryWatch;
pub(crate) use directory::DirectoryWatchOptions;
pub use file::FileWatch;
pub use tree::FileTreeWatch;
pub(crate) use tree::TreeOptions;

/// A watch as seen by event handlers.
///
/// Overflow recovery uses it to learn what to rescan ([`path`](Self::path),
/// [`scope`](Self::scope)) and to feed synthetic events back in
/// ([`handle_event`](Self::handle_event)).
pub trait EventHandlingWatch: Send + Sync {
    /// The directory (or file) this watch observes.
    fn path(&self) -> &Path;

    /// The root events of this watch are expressed against. Differs from [`path`](Self::path)
    /// for the nodes of a recursive tree, whose events are relative to the tree root.
    fn root(&self) -> &Path;

    fn scope(&self) -> WatchScope;

    /// Delivers `event` through this watch's handlers as if the backend had produced it.
    fn handle_event(&self, event: WatchEvent);

    /// Expresses `event` relative to this watch's root.
    fn relativize(&self, event: &WatchEvent) -> WatchEvent {
        event.relativize(self.root())
    }

    /// An owned handle for work that outlives the current callback (asynchronous rescans).
    fn detach(&self) -> Arc<dyn EventHandlingWatch>;
}

impl fmt::Debug for dyn EventHandlingWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlingWatch")
            .field("path", &self.path())
            .field("root", &self.root())
            .field("scope", &self.scope())
            .finish()
    }
}

/// A handler receiving every event of a watch together with the watch that observed it.
pub type WatchHandler = Arc<dyn Fn(&dyn EventHandlingWatch, &WatchEvent) + Send + Sync>;

/// Decides which events reach the handlers at all.
pub type EventFilter = Arc<dyn Fn(&WatchEvent) -> bool + Send + Sync>;

/// Per-kind callbacks, an alternative to a single closure.
pub trait WatchEventListener: Send + Sync {
    fn on_created(&self, _event: &WatchEvent) {}
    fn on_modified(&self, _event: &WatchEvent) {}
    fn on_deleted(&self, _event: &WatchEvent) {}
    fn on_overflow(&self, _event: &WatchEvent) {}
}

pub(crate) fn listener_handler(listener: Arc<dyn WatchEventListener>) -> WatchHandler {
    Arc::new(move |_watch: &dyn EventHandlingWatch, event: &WatchEvent| match event.kind() {
        WatchEventKind::Created => listener.on_created(event),
        WatchEventKind::Modified => listener.on_modified(event),
        WatchEventKind::Deleted => listener.on_deleted(event),
        WatchEventKind::Overflow => listener.on_overflow(event),
    })
}

/// An ordered list of handlers invoked one after another for each event.
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<WatchHandler>,
}

impl HandlerChain {
    pub fn new(handler: WatchHandler) -> Self {
        Self {
            handlers: vec![handler],
        }
    }

    pub fn then(mut self, handler: WatchHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn dispatch(&self, watch: &dyn EventHandlingWatch, event: &WatchEvent) {
        for handler in &self.handlers {
            invoke_guarded(handler, watch, event);
        }
    }
}

/// Runs `filter` with the same isolation as handlers. A panicking filter drops the event.
pub(crate) fn filter_accepts(
    filter: &EventFilter,
    watch: &dyn EventHandlingWatch,
    event: &WatchEvent,
) -> bool {
    match catch_unwind(AssertUnwindSafe(|| filter(event))) {
        Ok(keep) => keep,
        Err(panic) => {
            tracing::error!(
                target: "treewatch.watch",
                path = %watch.path().display(),
                event = %event,
                panic = %panic_message(panic.as_ref()),
                "watch filter panicked; dropping event"
            );
            false
        }
    }
}

fn invoke_guarded(handler: &WatchHandler, watch: &dyn EventHandlingWatch, event: &WatchEvent) {
    let result = catch_unwind(AssertUnwindSafe(|| handler(watch, event)));
    if let Err(panic) = result {
        tracing::error!(
            target: "treewatch.watch",
            path = %watch.path().display(),
            event = %event,
            panic = %panic_message(panic.as_ref()),
            "watch handler panicked"
        );
    }
}
