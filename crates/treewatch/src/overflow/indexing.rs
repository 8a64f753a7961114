use std::collections::HashSet;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;

use super::{emit, ScopeWalk};
use crate::event::{WatchEvent, WatchEventKind};
use crate::executor::Executor;
use crate::scope::WatchScope;
use crate::watch::EventHandlingWatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexEntry {
    modified: SystemTime,
    is_dir: bool,
}

impl IndexEntry {
    fn from_metadata(meta: &Metadata) -> Self {
        Self {
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            is_dir: meta.is_dir(),
        }
    }
}

/// Recovers from overflows by diffing the file system against a last-modified index.
///
/// The index covers every entry in the watch's scope. It is built when the rescanner is
/// created and kept current by every event the watch delivers, so after an overflow only the
/// differences are reported:
///
/// - entries missing from the index: `Created` (plus `Modified` for non-empty files);
/// - entries whose modification time moved forward: `Modified`;
/// - indexed entries that are gone from a fully listed directory: `Deleted`.
///
/// Memory grows with the size of the watched tree.
pub struct IndexingRescanner {
    executor: Arc<dyn Executor>,
    index: Arc<DashMap<PathBuf, IndexEntry>>,
}

impl IndexingRescanner {
    /// Indexes everything below `path` within `scope`.
    pub fn new(executor: Arc<dyn Executor>, path: &Path, scope: WatchScope) -> Self {
        let index = DashMap::new();
        for entry in ScopeWalk::run(path, scope).entries {
            match entry.metadata() {
                Ok(meta) => {
                    index.insert(entry.into_path(), IndexEntry::from_metadata(&meta));
                }
                Err(err) => tracing::warn!(
                    target: "treewatch.overflow",
                    path = %entry.path().display(),
                    error = %err,
                    "could not index entry"
                ),
            }
        }
        tracing::debug!(
            target: "treewatch.overflow",
            path = %path.display(),
            entries = index.len(),
            "overflow index built"
        );
        Self {
            executor,
            index: Arc::new(index),
        }
    }

    pub fn indexed_len(&self) -> usize {
        self.index.len()
    }

    pub fn is_indexed(&self, path: &Path) -> bool {
        self.index.contains_key(path)
    }

    pub fn accept(&self, watch: &dyn EventHandlingWatch, event: &WatchEvent) {
        match event.kind() {
            WatchEventKind::Overflow => {
                let watch = watch.detach();
                let index = Arc::clone(&self.index);
                self.executor
                    .execute(Box::new(move || rescan(watch.as_ref(), &index)));
            }
            WatchEventKind::Created | WatchEventKind::Modified => {
                self.observe_existing(watch, event);
            }
            WatchEventKind::Deleted => {
                let path = event.full_path();
                remove_with_descendants(&self.index, [path.as_path()]);
            }
        }
    }

    fn observe_existing(&self, watch: &dyn EventHandlingWatch, event: &WatchEvent) {
        let path = event.full_path();
        match std::fs::symlink_metadata(&path) {
            Ok(meta) => {
                let previous = self.index.insert(path.clone(), IndexEntry::from_metadata(&meta));
                // A modification of something never seen means its creation was missed.
                if previous.is_none() && event.kind() == WatchEventKind::Modified {
                    emit(watch, vec![(WatchEventKind::Created, path)]);
                }
            }
            Err(err) => {
                // Gone again already; the delete event will follow.
                if path.exists() {
                    tracing::warn!(
                        target: "treewatch.overflow",
                        path = %path.display(),
                        error = %err,
                        "could not read modification time"
                    );
                }
            }
        }
    }
}

/// Forgets `paths`, and everything below those that were directories, in one pass over the
/// index.
fn remove_with_descendants<'a>(
    index: &DashMap<PathBuf, IndexEntry>,
    paths: impl IntoIterator<Item = &'a Path>,
) {
    let mut directories: HashSet<&Path> = HashSet::new();
    for path in paths {
        if let Some((_, entry)) = index.remove(path) {
            if entry.is_dir {
                directories.insert(path);
            }
        }
    }
    if !directories.is_empty() {
        index.retain(|indexed, _| {
            !indexed
                .ancestors()
                .skip(1)
                .any(|ancestor| directories.contains(ancestor))
        });
    }
}

fn rescan(watch: &dyn EventHandlingWatch, index: &DashMap<PathBuf, IndexEntry>) {
    let root = watch.path().to_path_buf();
    let scope = watch.scope();
    let walk = ScopeWalk::run(&root, scope);

    let mut seen = HashSet::with_capacity(walk.entries.len());
    let mut events = Vec::new();
    for entry in &walk.entries {
        let path = entry.path().to_path_buf();
        seen.insert(path.clone());

        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                tracing::warn!(
                    target: "treewatch.overflow",
                    path = %path.display(),
                    error = %err,
                    "could not stat entry during rescan"
                );
                continue;
            }
        };
        let current = IndexEntry::from_metadata(&meta);
        let previous = index.get(&path).map(|entry| *entry);

        match previous {
            None => {
                index.insert(path.clone(), current);
                let non_empty_file = meta.is_file() && meta.len() > 0;
                events.push((WatchEventKind::Created, path.clone()));
                if non_empty_file {
                    events.push((WatchEventKind::Modified, path));
                }
            }
            Some(previous) if previous.modified < current.modified => {
                index.insert(path.clone(), current);
                events.push((WatchEventKind::Modified, path));
            }
            Some(previous) if previous.is_dir != current.is_dir => {
                index.insert(path, current);
            }
            Some(_) => {}
        }
    }

    // Only directories whose listing is complete can prove that an entry disappeared.
    let complete = walk.complete_directories(&root, scope);
    let vanished: Vec<PathBuf> = index
        .iter()
        .filter(|item| {
            let path = item.key();
            path.parent().is_some_and(|parent| complete.contains(parent))
                && !seen.contains(path)
        })
        .map(|item| item.key().clone())
        .collect();
    let deleted: Vec<PathBuf> = vanished
        .into_iter()
        .filter(|path| path.symlink_metadata().is_err())
        .collect();
    remove_with_descendants(index, deleted.iter().map(PathBuf::as_path));
    events.extend(deleted.into_iter().map(|path| (WatchEventKind::Deleted, path)));

    tracing::debug!(
        target: "treewatch.overflow",
        path = %root.display(),
        events = events.len(),
        "indexed rescan finished"
    );
    emit(watch, events);
}
