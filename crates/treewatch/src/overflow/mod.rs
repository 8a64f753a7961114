//! Overflow recovery.
//!
//! When a backend reports [`WatchEventKind::Overflow`], some events for the watched scope were
//! lost. The handler always sees the overflow itself; an [`Approximation`] additionally
//! synthesizes events that approximate what was missed:
//!
//! - [`MemorylessRescanner`] (`All`) walks the scope and reports everything as created (and
//!   non-empty files as modified). Cheap, keeps no state, never reports deletions.
//! - [`IndexingRescanner`] (`Diff`) keeps a last-modified index for the whole scope and reports
//!   only differences, including deletions.
//!
//! Rescans run on the watch's executor. Synthesized events are fed back through
//! [`EventHandlingWatch::handle_event`], so they pass the watch's filter and reach every
//! handler exactly like native events.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::event::{WatchEvent, WatchEventKind};
use crate::executor::Executor;
use crate::scope::{Approximation, WatchScope};
use crate::watch::{EventHandlingWatch, WatchHandler};

mod indexing;
mod memoryless;

pub use indexing::IndexingRescanner;
pub use memoryless::MemorylessRescanner;

pub(crate) struct OverflowContext<'a> {
    pub(crate) executor: Arc<dyn Executor>,
    /// The path the index (if any) is built for.
    pub(crate) path: &'a Path,
    pub(crate) scope: WatchScope,
}

/// Builds the handler implementing `approximation`, or `None` when nothing needs to happen.
pub(crate) fn overflow_handler(
    approximation: Approximation,
    context: OverflowContext<'_>,
) -> Option<WatchHandler> {
    match approximation {
        Approximation::None => None,
        Approximation::All => {
            let rescanner = MemorylessRescanner::new(context.executor);
            Some(Arc::new(move |watch: &dyn EventHandlingWatch, event: &WatchEvent| {
                rescanner.accept(watch, event)
            }))
        }
        Approximation::Diff => {
            let rescanner = IndexingRescanner::new(context.executor, context.path, context.scope);
            Some(Arc::new(move |watch: &dyn EventHandlingWatch, event: &WatchEvent| {
                rescanner.accept(watch, event)
            }))
        }
    }
}

/// The result of walking a watch's scope.
pub(crate) struct ScopeWalk {
    pub(crate) entries: Vec<walkdir::DirEntry>,
    /// Directories whose listing failed; their children are unknown.
    pub(crate) failed: HashSet<PathBuf>,
}

impl ScopeWalk {
    /// Walks everything below `root` within `scope`, excluding `root` itself. Errors are logged
    /// and skipped.
    pub(crate) fn run(root: &Path, scope: WatchScope) -> Self {
        let max_depth = scope.max_depth().unwrap_or(usize::MAX);
        let mut entries = Vec::new();
        let mut failed = HashSet::new();

        for result in walkdir::WalkDir::new(root)
            .min_depth(1)
            .max_depth(max_depth)
            .follow_links(false)
        {
            match result {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    tracing::warn!(
                        target: "treewatch.overflow",
                        root = %root.display(),
                        error = %err,
                        "rescan could not read an entry; skipping"
                    );
                    if let Some(path) = err.path() {
                        failed.insert(path.to_path_buf());
                    }
                }
            }
        }

        Self { entries, failed }
    }

    /// Directories whose direct children were all listed: the root and every walked directory
    /// above the depth limit, minus those whose listing failed.
    pub(crate) fn complete_directories(&self, root: &Path, scope: WatchScope) -> HashSet<PathBuf> {
        let max_depth = scope.max_depth().unwrap_or(usize::MAX);
        let mut complete: HashSet<PathBuf> = self
            .entries
            .iter()
            .filter(|entry| entry.file_type().is_dir() && entry.depth() < max_depth)
            .map(|entry| entry.path().to_path_buf())
            .collect();
        complete.insert(root.to_path_buf());
        complete.retain(|dir| !self.failed.contains(dir));
        complete
    }
}

/// Feeds `(kind, full path)` pairs back into `watch`, relativized to its root.
pub(crate) fn emit(watch: &dyn EventHandlingWatch, events: Vec<(WatchEventKind, PathBuf)>) {
    for (kind, path) in events {
        watch.handle_event(watch.relativize(&WatchEvent::for_full_path(kind, path)));
    }
}
