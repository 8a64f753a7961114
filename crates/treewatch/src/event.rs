//! The event model shared by every watch kind.

use std::fmt;
use std::path::{Component, Path, PathBuf};

/// What happened to the path an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WatchEventKind {
    /// A path was created (or moved into the watched scope).
    Created,
    /// A path's contents or metadata changed.
    Modified,
    /// A path was deleted (or moved out of the watched scope).
    Deleted,
    /// Events were lost. The relative path names the directory whose view is no longer
    /// trustworthy; consumers should resynchronize everything below it.
    Overflow,
}

impl WatchEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WatchEventKind::Created => "CREATED",
            WatchEventKind::Modified => "MODIFIED",
            WatchEventKind::Deleted => "DELETED",
            WatchEventKind::Overflow => "OVERFLOW",
        }
    }
}

impl fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A single observed change, expressed relative to the root of the watch that observed it.
///
/// Events are immutable values. For [`WatchEventKind::Overflow`] the relative path is the
/// directory that overflowed (empty for the watch root itself).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchEvent {
    kind: WatchEventKind,
    root: PathBuf,
    relative: PathBuf,
}

impl WatchEvent {
    pub fn new(kind: WatchEventKind, root: impl Into<PathBuf>, relative: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            root: root.into(),
            relative: relative.into(),
        }
    }

    /// Builds an event from a full path: the root becomes the parent directory and the
    /// relative path the final component.
    ///
    /// Paths without a final component (e.g. `/`) keep the whole path as root and an empty
    /// relative path.
    pub fn for_full_path(kind: WatchEventKind, full_path: impl AsRef<Path>) -> Self {
        let full_path = full_path.as_ref();
        match (full_path.parent(), full_path.file_name()) {
            (Some(parent), Some(name)) => Self::new(kind, parent, name),
            _ => Self::new(kind, full_path, PathBuf::new()),
        }
    }

    pub fn kind(&self) -> WatchEventKind {
        self.kind
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relative(&self) -> &Path {
        &self.relative
    }

    pub fn full_path(&self) -> PathBuf {
        if self.relative.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(&self.relative)
        }
    }

    /// Final component of the relative path, if any.
    pub fn file_name(&self) -> Option<&std::ffi::OsStr> {
        self.relative.file_name()
    }

    /// Re-expresses this event relative to another root.
    ///
    /// The full path is preserved; if `root` is not an ancestor of it the relative path
    /// contains `..` components.
    pub fn relativize(&self, root: &Path) -> WatchEvent {
        let full = self.full_path();
        WatchEvent::new(self.kind, root, relative_path(root, &full))
    }
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WatchEvent[{}, {}, {}]",
            self.root.display(),
            self.kind,
            self.relative.display()
        )
    }
}

/// Lexically computes the path of `target` relative to `base`.
pub(crate) fn relative_path(base: &Path, target: &Path) -> PathBuf {
    if let Ok(stripped) = target.strip_prefix(base) {
        return stripped.to_path_buf();
    }

    let base_components: Vec<Component<'_>> = base.components().collect();
    let target_components: Vec<Component<'_>> = target.components().collect();
    let common = base_components
        .iter()
        .zip(target_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for component in &base_components[common..] {
        if matches!(component, Component::Normal(_) | Component::ParentDir) {
            out.push("..");
        }
    }
    for component in &target_components[common..] {
        out.push(component.as_os_str());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_path_joins_root_and_relative() {
        let event = WatchEvent::new(WatchEventKind::Created, "/w", "a/b/f.txt");
        assert_eq!(event.full_path(), PathBuf::from("/w/a/b/f.txt"));
        assert_eq!(event.file_name().and_then(|n| n.to_str()), Some("f.txt"));
    }

    #[test]
    fn empty_relative_path_refers_to_root() {
        let event = WatchEvent::new(WatchEventKind::Overflow, "/w", "");
        assert_eq!(event.full_path(), PathBuf::from("/w"));
        assert_eq!(event.file_name(), None);
    }

    #[test]
    fn for_full_path_splits_parent_and_name() {
        let event = WatchEvent::for_full_path(WatchEventKind::Deleted, "/w/a/x");
        assert_eq!(event.root(), Path::new("/w/a"));
        assert_eq!(event.relative(), Path::new("x"));
    }

    #[test]
    fn relativize_against_ancestor_and_self() {
        let event = WatchEvent::new(WatchEventKind::Modified, "/w/a/b", "f.txt");

        let rebased = event.relativize(Path::new("/w"));
        assert_eq!(rebased.root(), Path::new("/w"));
        assert_eq!(rebased.relative(), Path::new("a/b/f.txt"));
        assert_eq!(rebased.kind(), WatchEventKind::Modified);
        assert_eq!(rebased.full_path(), event.full_path());

        let own = WatchEvent::new(WatchEventKind::Overflow, "/w/a", "");
        assert_eq!(own.relativize(Path::new("/w/a")).relative(), Path::new(""));
    }

    #[test]
    fn relativize_against_unrelated_root_walks_up() {
        let event = WatchEvent::new(WatchEventKind::Created, "/w/a", "x");
        let rebased = event.relativize(Path::new("/w/b/c"));
        assert_eq!(rebased.relative(), Path::new("../../a/x"));
    }

    #[test]
    fn display_lists_root_kind_and_relative() {
        let event = WatchEvent::new(WatchEventKind::Created, "/w", "x");
        assert_eq!(event.to_string(), "WatchEvent[/w, CREATED, x]");
    }
}
