//! Cross-platform file and directory change notification.
//!
//! `treewatch` turns a per-directory native watch primitive into:
//! - watches on a single path, a directory and its entries, or a whole directory tree
//!   (emulated with one native watch per directory when the platform cannot recurse);
//! - shared native registrations: any number of watches on the same directory use one OS
//!   resource, released after a short grace period once nobody needs it;
//! - overflow recovery: when the OS drops events, a rescan synthesizes events that
//!   approximate what was lost.
//!
//! Start with [`Watcher::watch`].

mod bundle;
mod config;
mod error;
mod event;
mod executor;
mod key;
mod native;
mod overflow;
mod scope;
mod service;
mod timer;
mod watch;
mod watcher;

#[cfg(test)]
mod test_support;

pub use bundle::{
    Callback, Multiplexer, Registration, Subscribable, SubscriptionGuard, DEFAULT_CLOSE_GRACE,
};
pub use config::{
    ConfigError, WatchSettings, ENV_CLOSE_GRACE_MS, ENV_HANDLER_THREADS, ENV_RAW_QUEUE_CAPACITY,
    ENV_REGISTRATION_THREADS,
};
pub use error::WatchError;
pub use event::{WatchEvent, WatchEventKind};
pub use executor::{
    default_executor, default_thread_count, Executor, InlineExecutor, Job, PooledExecutor,
};
pub use key::SubscriptionKey;
pub use native::{ManualBackend, NativeBackend, RawBatch, RawEvent, RawEventKind};
pub use overflow::{IndexingRescanner, MemorylessRescanner};
pub use scope::{Approximation, WatchScope};
pub use service::WatchService;
pub use watch::{
    DirectoryWatch, EventFilter, EventHandlingWatch, FileTreeWatch, FileWatch, HandlerChain,
    WatchEventListener, WatchHandler,
};
pub use watcher::{ActiveWatch, Watcher};

#[cfg(feature = "watch-notify")]
pub use native::NotifyBackend;
