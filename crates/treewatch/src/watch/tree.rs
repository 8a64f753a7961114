use std::collections::{HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{
    filter_accepts, DirectoryWatch, DirectoryWatchOptions, EventFilter, EventHandlingWatch,
    HandlerChain, WatchHandler,
};
use crate::error::FirstError;
use crate::event::{WatchEvent, WatchEventKind};
use crate::executor::Executor;
use crate::scope::WatchScope;
use crate::service::WatchService;

pub(crate) struct TreeOptions {
    pub(crate) service: WatchService,
    pub(crate) root: PathBuf,
    pub(crate) executor: Arc<dyn Executor>,
    /// User handler followed by overflow recovery.
    pub(crate) handlers: HandlerChain,
    pub(crate) filter: Option<EventFilter>,
}

struct TreeShared {
    root: PathBuf,
    service: WatchService,
    executor: Arc<dyn Executor>,
    handlers: HandlerChain,
    filter: Option<EventFilter>,
    started: AtomicBool,
    closed: AtomicBool,
    root_node: Mutex<Option<Arc<TreeNode>>>,
}

struct TreeNode {
    /// Path of this directory relative to the tree root; empty for the root node.
    relative: PathBuf,
    watch: DirectoryWatch,
    closed: AtomicBool,
    children: Mutex<HashMap<OsString, Arc<TreeNode>>>,
}

/// Recursive watching emulated with one non-recursive [`DirectoryWatch`] per directory.
///
/// The tree mirrors the live directory structure below its root: nodes are opened for
/// directories that appear and closed (with their whole subtree) for directories that go away.
/// All events are expressed against the tree root, whichever node observed them.
///
/// Maintenance runs after the user's handlers for every event a node sees, including events
/// the user's filter drops, so the tree stays accurate regardless of what the user asked to
/// see.
#[derive(Clone)]
pub struct FileTreeWatch {
    shared: Arc<TreeShared>,
}

impl FileTreeWatch {
    pub(crate) fn new(options: TreeOptions) -> Self {
        Self {
            shared: Arc::new(TreeShared {
                root: options.root,
                service: options.service,
                executor: options.executor,
                handlers: options.handlers,
                filter: options.filter,
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                root_node: Mutex::new(None),
            }),
        }
    }

    /// Opens the root watch, then a node for every existing subdirectory.
    ///
    /// Only a failure to watch the root itself is an error, and the open can then be retried;
    /// subdirectories that cannot be watched are logged and skipped.
    pub fn open(&self) -> io::Result<()> {
        let shared = &self.shared;
        if shared.started.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("tree watch on {} was already opened", shared.root.display()),
            ));
        }

        let root = match shared.open_node(PathBuf::new()) {
            Ok(root) => root,
            Err(err) => {
                shared.started.store(false, Ordering::Release);
                return Err(err);
            }
        };
        {
            let mut slot = shared.root_node.lock();
            if shared.closed.load(Ordering::Acquire) {
                drop(slot);
                return root.close_subtree();
            }
            *slot = Some(Arc::clone(&root));
        }
        shared.populate(&root);
        tracing::debug!(
            target: "treewatch.tree",
            root = %shared.root.display(),
            directories = self.watched_directories().len(),
            "tree watch opened"
        );
        Ok(())
    }

    /// Closes every node, children before parents. Every node gets closed even if some fail;
    /// the first failure is returned.
    pub fn close(&self) -> io::Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let root = self.shared.root_node.lock().take();
        let result = match root {
            Some(root) => root.close_subtree(),
            None => Ok(()),
        };
        tracing::debug!(
            target: "treewatch.tree",
            root = %self.shared.root.display(),
            "tree watch closed"
        );
        result
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Relative paths of every directory with a live node, sorted. The root is the empty path.
    pub fn watched_directories(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        if let Some(root) = self.shared.root_node() {
            root.collect_paths(&mut out);
        }
        out.sort();
        out
    }

    /// The node responsible for `relative`: its own node for a directory overflow, otherwise
    /// the node of its parent directory. Falls back to the closest existing ancestor.
    fn node_for(&self, event: &WatchEvent) -> Option<Arc<TreeNode>> {
        let mut node = self.shared.root_node()?;
        let relative = event.relative();
        let target = if event.kind() == WatchEventKind::Overflow {
            relative
        } else {
            relative.parent().unwrap_or(Path::new(""))
        };
        for component in target.components() {
            let Component::Normal(name) = component else {
                break;
            };
            let child = node.children.lock().get(name).cloned();
            match child {
                Some(child) => node = child,
                None => break,
            }
        }
        Some(node)
    }
}

impl TreeShared {
    fn root_node(&self) -> Option<Arc<TreeNode>> {
        self.root_node.lock().clone()
    }

    fn absolute(&self, relative: &Path) -> PathBuf {
        if relative.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    fn open_node(self: &Arc<Self>, relative: PathBuf) -> io::Result<Arc<TreeNode>> {
        let path = self.absolute(&relative);
        let shared = Arc::downgrade(self);
        let node = Arc::new_cyclic(|weak_node: &Weak<TreeNode>| {
            let handlers = self.handlers.clone();
            let filter = self.filter.clone();
            let user: WatchHandler = Arc::new(move |watch: &dyn EventHandlingWatch, event: &WatchEvent| {
                if filter.as_ref().map_or(true, |filter| filter_accepts(filter, watch, event)) {
                    handlers.dispatch(watch, event);
                }
            });

            let weak_node = weak_node.clone();
            let maintenance: WatchHandler =
                Arc::new(move |_watch: &dyn EventHandlingWatch, event: &WatchEvent| {
                    if let (Some(shared), Some(node)) = (shared.upgrade(), weak_node.upgrade()) {
                        shared.maintain(&node, event);
                    }
                });

            let watch = DirectoryWatch::new(DirectoryWatchOptions {
                service: self.service.clone(),
                path,
                root: self.root.clone(),
                recursive: false,
                executor: Arc::clone(&self.executor),
                chain: HandlerChain::new(user).then(maintenance),
                filter: None,
            });
            TreeNode {
                relative,
                watch,
                closed: AtomicBool::new(false),
                children: Mutex::new(HashMap::new()),
            }
        });
        node.watch.open()?;
        Ok(node)
    }

    /// Opens nodes for every subdirectory of `node`, recursively.
    fn populate(self: &Arc<Self>, node: &Arc<TreeNode>) {
        match subdirectories(node.watch.path()) {
            Ok(names) => {
                for name in names {
                    self.attach_child(node, &name);
                }
            }
            Err(err) => tracing::debug!(
                target: "treewatch.tree",
                path = %node.watch.path().display(),
                error = %err,
                "could not list directory"
            ),
        }
    }

    /// Opens and inserts a node for `parent/name`. Returns `None` if a node already existed,
    /// the tree is closing, or the directory could not be watched.
    fn attach_child(self: &Arc<Self>, parent: &Arc<TreeNode>, name: &OsStr) -> Option<Arc<TreeNode>> {
        if parent.children.lock().contains_key(name) {
            return None;
        }

        let relative = parent.relative.join(name);
        let child = match self.open_node(relative.clone()) {
            Ok(child) => child,
            Err(err) => {
                if err.kind() == io::ErrorKind::NotFound {
                    tracing::debug!(
                        target: "treewatch.tree",
                        directory = %relative.display(),
                        "directory vanished before it could be watched"
                    );
                } else {
                    tracing::warn!(
                        target: "treewatch.tree",
                        directory = %relative.display(),
                        error = %err,
                        "failed to watch directory; skipping its subtree"
                    );
                }
                return None;
            }
        };

        {
            let mut children = parent.children.lock();
            let rejected = self.closed.load(Ordering::Acquire)
                || parent.closed.load(Ordering::Acquire)
                || children.contains_key(name);
            if rejected {
                drop(children);
                if let Err(err) = child.close_subtree() {
                    tracing::debug!(target: "treewatch.tree", error = %err, "failed to close redundant node");
                }
                return None;
            }
            children.insert(name.to_os_string(), Arc::clone(&child));
        }

        // A deletion the parent reported before the insert found nothing to detach.
        if !is_directory(child.watch.path()) {
            tracing::debug!(
                target: "treewatch.tree",
                directory = %relative.display(),
                "directory vanished while its node was opened"
            );
            self.detach_child(parent, name);
            return None;
        }

        tracing::trace!(target: "treewatch.tree", directory = %relative.display(), "node opened");
        self.populate(&child);
        Some(child)
    }

    fn detach_child(&self, parent: &TreeNode, name: &OsStr) {
        let removed = parent.children.lock().remove(name);
        if let Some(child) = removed {
            tracing::trace!(
                target: "treewatch.tree",
                directory = %child.relative.display(),
                "node removed"
            );
            if let Err(err) = child.close_subtree() {
                tracing::warn!(
                    target: "treewatch.tree",
                    directory = %child.relative.display(),
                    error = %err,
                    "failed to close removed subtree"
                );
            }
        }
    }

    fn maintain(self: &Arc<Self>, node: &Arc<TreeNode>, event: &WatchEvent) {
        if node.closed.load(Ordering::Acquire) {
            return;
        }
        match event.kind() {
            WatchEventKind::Created => {
                let Some(name) = direct_child_name(node, event) else {
                    return;
                };
                if !is_directory(&event.full_path()) {
                    return;
                }
                // Entries created before the new node was registered would otherwise be missed.
                if let Some(child) = self.attach_child(node, name) {
                    child.post_overflow(&self.root);
                }
            }
            WatchEventKind::Deleted => {
                if let Some(name) = direct_child_name(node, event) {
                    self.detach_child(node, name);
                }
            }
            WatchEventKind::Modified => {}
            WatchEventKind::Overflow => {
                if event.relative() == node.relative {
                    self.resync(node);
                }
            }
        }
    }

    /// Reconciles the children of `node` with the file system, then passes the overflow on to
    /// every child: lost events may hide structural changes at any depth.
    fn resync(self: &Arc<Self>, node: &Arc<TreeNode>) {
        match subdirectories(node.watch.path()) {
            Ok(on_disk) => {
                let vanished: Vec<OsString> = node
                    .children
                    .lock()
                    .keys()
                    .filter(|name| !on_disk.contains(*name))
                    .cloned()
                    .collect();
                for name in vanished {
                    self.detach_child(node, &name);
                }
                for name in &on_disk {
                    self.attach_child(node, name);
                }
            }
            Err(err) => tracing::debug!(
                target: "treewatch.tree",
                path = %node.watch.path().display(),
                error = %err,
                "could not list directory after overflow"
            ),
        }

        let children: Vec<Arc<TreeNode>> = node.children.lock().values().cloned().collect();
        for child in children {
            child.post_overflow(&self.root);
        }
    }
}

impl TreeNode {
    fn post_overflow(&self, root: &Path) {
        self.watch
            .handle_event(WatchEvent::new(WatchEventKind::Overflow, root, &self.relative));
    }

    fn close_subtree(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        let children: Vec<Arc<TreeNode>> = self.children.lock().drain().map(|(_, child)| child).collect();
        let mut errors = FirstError::default();
        for child in children {
            errors.record(child.close_subtree());
        }
        errors.record(self.watch.close());
        errors.into_result()
    }

    fn collect_paths(&self, out: &mut Vec<PathBuf>) {
        out.push(self.relative.clone());
        let children: Vec<Arc<TreeNode>> = self.children.lock().values().cloned().collect();
        for child in children {
            child.collect_paths(out);
        }
    }
}

fn direct_child_name<'e>(node: &TreeNode, event: &'e WatchEvent) -> Option<&'e OsStr> {
    let relative = event.relative();
    if relative.parent()? != node.relative {
        return None;
    }
    relative.file_name()
}

/// A real directory; symlinks are not followed.
fn is_directory(path: &Path) -> bool {
    std::fs::symlink_metadata(path).map_or(false, |meta| meta.is_dir())
}

fn subdirectories(dir: &Path) -> io::Result<HashSet<OsString>> {
    let mut names = HashSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(target: "treewatch.tree", error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().map_or(false, |ty| ty.is_dir()) {
            names.insert(entry.file_name());
        }
    }
    Ok(names)
}

impl EventHandlingWatch for FileTreeWatch {
    fn path(&self) -> &Path {
        &self.shared.root
    }

    fn root(&self) -> &Path {
        &self.shared.root
    }

    fn scope(&self) -> WatchScope {
        WatchScope::PathAndAllDescendants
    }

    /// Routes `event` to the node owning its directory.
    fn handle_event(&self, event: WatchEvent) {
        if let Some(node) = self.node_for(&event) {
            node.watch.handle_event(event);
        }
    }

    fn detach(&self) -> Arc<dyn EventHandlingWatch> {
        Arc::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{Callback, Registration};
    use crate::config::WatchSettings;
    use crate::executor::InlineExecutor;
    use crate::key::SubscriptionKey;
    use crate::native::{ManualBackend, NativeBackend, RawBatch, RawEvent, RawEventKind};
    use crate::overflow::{overflow_handler, OverflowContext};
    use crate::scope::Approximation;
    use crate::test_support::{manual_service, wait_until, Recorder};
    use std::time::Duration;

    fn tree(
        backend: &ManualBackend,
        root: &Path,
        approximation: Approximation,
        filter: Option<EventFilter>,
    ) -> (FileTreeWatch, Recorder) {
        tree_on(manual_service(backend), root, approximation, filter)
    }

    fn tree_on(
        service: WatchService,
        root: &Path,
        approximation: Approximation,
        filter: Option<EventFilter>,
    ) -> (FileTreeWatch, Recorder) {
        let executor: Arc<dyn Executor> = Arc::new(InlineExecutor);
        let recorder = Recorder::default();
        let sink = recorder.clone();
        let mut handlers = HandlerChain::new(Arc::new(
            move |_: &dyn EventHandlingWatch, e: &WatchEvent| sink.push(e),
        ));
        if let Some(hook) = overflow_handler(
            approximation,
            OverflowContext {
                executor: Arc::clone(&executor),
                path: root,
                scope: WatchScope::PathAndAllDescendants,
            },
        ) {
            handlers = handlers.then(hook);
        }
        let tree = FileTreeWatch::new(TreeOptions {
            service,
            root: root.to_path_buf(),
            executor,
            handlers,
            filter,
        });
        (tree, recorder)
    }

    fn dirs(tree: &FileTreeWatch) -> Vec<String> {
        tree.watched_directories()
            .iter()
            .map(|p| crate::test_support::slash_path(p))
            .collect()
    }

    #[test]
    fn opens_nodes_for_existing_directories() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("a/b")).unwrap();
        std::fs::create_dir(root.path().join("c")).unwrap();
        std::fs::write(root.path().join("a/file.txt"), b"").unwrap();

        let backend = ManualBackend::new();
        let (tree, _) = tree(&backend, root.path(), Approximation::None, None);
        tree.open().unwrap();

        assert_eq!(dirs(&tree), vec!["", "a", "a/b", "c"]);
        assert_eq!(backend.registration_count(), 4);
        assert_eq!(tree.open().unwrap_err().kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn failed_open_can_be_retried() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("later");

        let backend = ManualBackend::new();
        let (tree, _) = tree(&backend, &root, Approximation::None, None);
        assert_eq!(tree.open().unwrap_err().kind(), io::ErrorKind::NotFound);
        assert!(tree.watched_directories().is_empty());

        std::fs::create_dir_all(root.join("a")).unwrap();
        tree.open().unwrap();
        assert_eq!(dirs(&tree), vec!["", "a"]);
    }

    #[test]
    fn mirrors_created_and_deleted_directories() {
        let root = tempfile::tempdir().unwrap();
        let backend = ManualBackend::new();
        let (tree, recorder) = tree(&backend, root.path(), Approximation::None, None);
        tree.open().unwrap();

        std::fs::create_dir_all(root.path().join("a/b/c")).unwrap();
        backend.push_event(root.path(), RawEventKind::Created, "a");
        assert_eq!(dirs(&tree), vec!["", "a", "a/b", "a/b/c"]);
        assert!(recorder.contains(WatchEventKind::Created, "a"));
        assert!(recorder.contains(WatchEventKind::Overflow, "a"));

        std::fs::remove_dir_all(root.path().join("a/b")).unwrap();
        backend.push_event(&root.path().join("a"), RawEventKind::Deleted, "b");
        assert_eq!(dirs(&tree), vec!["", "a"]);
        assert!(recorder.contains(WatchEventKind::Deleted, "a/b"));

        let b = SubscriptionKey::new(root.path().join("a/b"), false);
        let c = SubscriptionKey::new(root.path().join("a/b/c"), false);
        assert!(wait_until(Duration::from_secs(5), || {
            !backend.is_registered(&b) && !backend.is_registered(&c)
        }));
        assert!(backend.is_registered(&SubscriptionKey::new(root.path().join("a"), false)));
    }

    #[test]
    fn child_events_are_relative_to_the_tree_root() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        let backend = ManualBackend::new();
        let (tree, recorder) = tree(&backend, root.path(), Approximation::None, None);
        tree.open().unwrap();

        backend.push_event(&nested, RawEventKind::Modified, "f.txt");
        assert_eq!(
            recorder.summary(),
            vec![(WatchEventKind::Modified, "a/b/f.txt".to_owned())]
        );
        let event = &recorder.events()[0];
        assert_eq!(event.root(), root.path());
        assert_eq!(event.full_path(), nested.join("f.txt"));
    }

    #[test]
    fn overflow_at_the_root_recovers_nested_entries() {
        let root = tempfile::tempdir().unwrap();
        let backend = ManualBackend::new();
        let (tree, recorder) = tree(&backend, root.path(), Approximation::All, None);
        tree.open().unwrap();

        std::fs::create_dir_all(root.path().join("a/b")).unwrap();
        std::fs::write(root.path().join("a/b/f.txt"), b"data").unwrap();
        backend.push(
            &SubscriptionKey::new(root.path(), false),
            vec![RawEvent::overflow()],
        );

        assert_eq!(dirs(&tree), vec!["", "a", "a/b"]);
        for (kind, path) in [
            (WatchEventKind::Overflow, ""),
            (WatchEventKind::Created, "a"),
            (WatchEventKind::Created, "a/b"),
            (WatchEventKind::Created, "a/b/f.txt"),
            (WatchEventKind::Modified, "a/b/f.txt"),
        ] {
            assert!(recorder.contains(kind, path), "missing {kind} {path}: {:?}", recorder.summary());
        }
    }

    #[test]
    fn indexed_overflow_reports_deletions_in_subdirectories() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("a")).unwrap();
        std::fs::write(root.path().join("a/x.txt"), b"x").unwrap();
        std::fs::write(root.path().join("a/y.txt"), b"y").unwrap();

        let backend = ManualBackend::new();
        let (tree, recorder) = tree(&backend, root.path(), Approximation::Diff, None);
        tree.open().unwrap();

        std::fs::remove_file(root.path().join("a/x.txt")).unwrap();
        backend.overflow_all();

        assert!(recorder.contains(WatchEventKind::Deleted, "a/x.txt"));
        assert!(!recorder.contains(WatchEventKind::Deleted, "a/y.txt"));
        assert_eq!(recorder.count(WatchEventKind::Created), 0);
    }

    #[test]
    fn filtered_events_still_maintain_the_tree() {
        let root = tempfile::tempdir().unwrap();
        let backend = ManualBackend::new();
        let filter: EventFilter = Arc::new(|e: &WatchEvent| e.kind() == WatchEventKind::Modified);
        let (tree, recorder) = tree(&backend, root.path(), Approximation::None, Some(filter));
        tree.open().unwrap();

        std::fs::create_dir(root.path().join("a")).unwrap();
        backend.push_event(root.path(), RawEventKind::Created, "a");
        backend.push_event(&root.path().join("a"), RawEventKind::Modified, "f");

        assert_eq!(dirs(&tree), vec!["", "a"]);
        assert_eq!(
            recorder.summary(),
            vec![(WatchEventKind::Modified, "a/f".to_owned())]
        );
    }

    #[test]
    fn vanished_directory_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("real")).unwrap();

        let backend = ManualBackend::new();
        let (tree, _) = tree(&backend, root.path(), Approximation::None, None);
        tree.open().unwrap();

        let root_node = tree.shared.root_node().unwrap();
        assert!(tree.shared.attach_child(&root_node, OsStr::new("ghost")).is_none());

        // A created event for something that is no longer a directory is ignored too.
        backend.push_event(root.path(), RawEventKind::Created, "ghost");
        std::fs::create_dir(root.path().join("later")).unwrap();
        backend.push_event(root.path(), RawEventKind::Created, "later");
        assert_eq!(dirs(&tree), vec!["", "later", "real"]);
    }

    /// Removes `doomed` right after its registration succeeds and reports the removal to the
    /// parent's registration, before the tree inserts the new node.
    struct VanishingBackend {
        inner: ManualBackend,
        doomed: PathBuf,
    }

    impl NativeBackend for VanishingBackend {
        fn name(&self) -> &'static str {
            "vanishing"
        }

        fn register(
            &self,
            key: &SubscriptionKey,
            sink: Callback<RawBatch>,
        ) -> io::Result<Box<dyn Registration>> {
            let registration = self.inner.register(key, sink)?;
            if key.path() == self.doomed {
                std::fs::remove_dir(&self.doomed)?;
                let parent = self.doomed.parent().unwrap();
                let name = self.doomed.file_name().unwrap();
                assert!(self.inner.push_event(parent, RawEventKind::Deleted, name));
            }
            Ok(registration)
        }
    }

    #[test]
    fn directory_deleted_while_its_node_opens_is_dropped() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("a/gone")).unwrap();
        std::fs::create_dir(root.path().join("a/kept")).unwrap();

        let inner = ManualBackend::new();
        let backend = VanishingBackend {
            inner: inner.clone(),
            doomed: root.path().join("a/gone"),
        };
        let service = WatchService::new(Arc::new(backend), WatchSettings::default()).unwrap();
        let (tree, recorder) = tree_on(service, root.path(), Approximation::None, None);
        tree.open().unwrap();

        assert_eq!(dirs(&tree), vec!["", "a", "a/kept"]);
        assert!(recorder.contains(WatchEventKind::Deleted, "a/gone"));
        let gone = SubscriptionKey::new(root.path().join("a/gone"), false);
        assert!(wait_until(Duration::from_secs(5), || !inner.is_registered(&gone)));
    }

    #[test]
    fn directory_recreated_within_grace_gets_a_fresh_registration() {
        let root = tempfile::tempdir().unwrap();
        let sub = root.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        let backend = ManualBackend::new();
        let settings = WatchSettings {
            close_grace_ms: 2_000,
            ..WatchSettings::default()
        };
        let service = WatchService::new(Arc::new(backend.clone()), settings).unwrap();
        let (tree, recorder) = tree_on(service, root.path(), Approximation::None, None);
        tree.open().unwrap();
        assert_eq!(backend.registration_count(), 2);

        // The OS watch dies with the deleted directory.
        std::fs::remove_dir(&sub).unwrap();
        let sub_key = SubscriptionKey::new(&sub, false);
        assert!(backend.invalidate(&sub_key));
        backend.push_event(root.path(), RawEventKind::Deleted, "sub");
        assert_eq!(dirs(&tree), vec![""]);

        std::fs::create_dir(&sub).unwrap();
        backend.push_event(root.path(), RawEventKind::Created, "sub");
        assert_eq!(dirs(&tree), vec!["", "sub"]);
        assert_eq!(backend.registration_count(), 3);
        assert_eq!(backend.unregistration_count(), 1);

        backend.push_event(&sub, RawEventKind::Created, "late.txt");
        assert!(recorder.contains(WatchEventKind::Created, "sub/late.txt"));
        tree.close().unwrap();
    }

    /// Registrations under `failing` report an error when closed (after unregistering).
    struct FailingCloseBackend {
        inner: ManualBackend,
        failing: PathBuf,
    }

    struct FailingClose(Box<dyn Registration>);

    impl Registration for FailingClose {
        fn close(self: Box<Self>) -> io::Result<()> {
            self.0.close()?;
            Err(io::Error::new(io::ErrorKind::Other, "watch descriptor leaked"))
        }
    }

    impl NativeBackend for FailingCloseBackend {
        fn name(&self) -> &'static str {
            "failing-close"
        }

        fn register(
            &self,
            key: &SubscriptionKey,
            sink: Callback<RawBatch>,
        ) -> io::Result<Box<dyn Registration>> {
            let registration = self.inner.register(key, sink)?;
            if key.path() == self.failing {
                Ok(Box::new(FailingClose(registration)))
            } else {
                Ok(registration)
            }
        }
    }

    #[test]
    fn close_returns_the_first_failure_after_closing_everything() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("a/b")).unwrap();
        std::fs::create_dir(root.path().join("c")).unwrap();

        let inner = ManualBackend::new();
        let backend = FailingCloseBackend {
            inner: inner.clone(),
            failing: root.path().join("a"),
        };
        let settings = WatchSettings {
            close_grace_ms: 0,
            ..WatchSettings::default()
        };
        let service = WatchService::new(Arc::new(backend), settings).unwrap();
        let (tree, _) = tree_on(service, root.path(), Approximation::None, None);
        tree.open().unwrap();
        assert_eq!(inner.registered_keys().len(), 4);

        let err = tree.close().unwrap_err();
        assert_eq!(err.to_string(), "watch descriptor leaked");
        assert!(inner.registered_keys().is_empty());
        assert!(tree.close().is_ok());
    }

    #[test]
    fn close_releases_every_registration() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("a/b")).unwrap();

        let backend = ManualBackend::new();
        let (tree, recorder) = tree(&backend, root.path(), Approximation::None, None);
        tree.open().unwrap();
        assert_eq!(backend.registered_keys().len(), 3);

        tree.close().unwrap();
        tree.close().unwrap();
        assert!(tree.is_closed());
        assert!(tree.watched_directories().is_empty());

        tree.handle_event(WatchEvent::new(WatchEventKind::Created, root.path(), "x"));
        backend.push_event(&root.path().join("a"), RawEventKind::Created, "y");
        assert!(recorder.events().is_empty());
        assert!(wait_until(Duration::from_secs(5), || backend.registered_keys().is_empty()));
    }

    #[test]
    fn injected_events_reach_the_owning_node() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("a/b")).unwrap();

        let backend = ManualBackend::new();
        let (tree, recorder) = tree(&backend, root.path(), Approximation::None, None);
        tree.open().unwrap();

        tree.handle_event(WatchEvent::new(WatchEventKind::Modified, root.path(), "a/b/f"));
        tree.handle_event(WatchEvent::new(WatchEventKind::Overflow, root.path(), "a/b"));
        assert_eq!(
            recorder.summary(),
            vec![
                (WatchEventKind::Modified, "a/b/f".to_owned()),
                (WatchEventKind::Overflow, "a/b".to_owned()),
            ]
        );
    }
}
