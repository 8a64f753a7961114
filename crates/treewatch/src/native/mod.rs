//! Native watch backends.
//!
//! A backend turns one [`SubscriptionKey`] (a directory plus a recursion flag) into a stream of
//! raw event batches. Backends own *all* operating-system integration; everything above this
//! module works with [`RawEvent`]s only.
//!
//! - [`NotifyBackend`] (feature `watch-notify`) is backed by the `notify` crate. It runs one
//!   drain thread per backend and never calls into watch handlers directly from the OS callback.
//! - [`ManualBackend`] delivers injected batches synchronously. Tests use it to drive watches
//!   deterministically, without sleeping and hoping the OS fires.
//!
//! Backends may be lossy. When they know they dropped events (queue overflow, kernel overflow,
//! `notify`'s rescan flag) they must deliver [`RawEventKind::Overflow`] so the watch layer can
//! run overflow recovery.

use std::io;
use std::path::{Path, PathBuf};

use crate::bundle::{Callback, Registration};
use crate::event::WatchEventKind;
use crate::key::SubscriptionKey;

mod manual;
#[cfg(feature = "watch-notify")]
mod notify_backend;

pub use manual::ManualBackend;
#[cfg(feature = "watch-notify")]
pub use notify_backend::NotifyBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawEventKind {
    Created,
    Modified,
    Deleted,
    Overflow,
}

impl From<RawEventKind> for WatchEventKind {
    fn from(kind: RawEventKind) -> Self {
        match kind {
            RawEventKind::Created => WatchEventKind::Created,
            RawEventKind::Modified => WatchEventKind::Modified,
            RawEventKind::Deleted => WatchEventKind::Deleted,
            RawEventKind::Overflow => WatchEventKind::Overflow,
        }
    }
}

/// One raw native event for a registered directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawEvent {
    pub kind: RawEventKind,
    /// Path relative to the registered directory. `None` refers to the directory itself,
    /// which is always the case for overflows.
    pub path: Option<PathBuf>,
}

impl RawEvent {
    pub fn new(kind: RawEventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: Some(path.into()),
        }
    }

    pub fn overflow() -> Self {
        Self {
            kind: RawEventKind::Overflow,
            path: None,
        }
    }

    pub fn relative(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }
}

/// A batch of raw events, in the order the backend produced them.
pub type RawBatch = Vec<RawEvent>;

/// The contract every native watch facility implements.
pub trait NativeBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Starts delivering batches for `key` to `sink`.
    ///
    /// Registration may block briefly. The returned handle stops delivery when closed; closing
    /// must be safe while a batch for the key is being dispatched.
    fn register(
        &self,
        key: &SubscriptionKey,
        sink: Callback<RawBatch>,
    ) -> io::Result<Box<dyn Registration>>;

    /// Whether recursive keys are watched natively (a single registration covers the whole
    /// tree). When `false`, recursive watches are emulated with a tree of directory watches.
    fn supports_native_recursion(&self) -> bool {
        false
    }
}
