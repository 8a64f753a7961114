//! The public entry point: configure a watch with [`Watcher`], run it as an [`ActiveWatch`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::WatchError;
use crate::event::WatchEvent;
use crate::executor::Executor;
use crate::overflow::{overflow_handler, OverflowContext};
use crate::scope::{Approximation, WatchScope};
use crate::service::WatchService;
use crate::watch::{
    listener_handler, DirectoryWatch, DirectoryWatchOptions, EventFilter, EventHandlingWatch,
    FileTreeWatch, FileWatch, HandlerChain, TreeOptions, WatchEventListener, WatchHandler,
};

/// Builder for a watch on one path.
///
/// ```no_run
/// use treewatch::{Approximation, Watcher, WatchScope};
///
/// # fn main() -> Result<(), treewatch::WatchError> {
/// let watch = Watcher::watch("/tmp/project", WatchScope::PathAndAllDescendants)?
///     .on(|event| println!("{event}"))?
///     .on_overflow(Approximation::Diff)
///     .start()?;
/// // ...
/// watch.close()?;
/// # Ok(())
/// # }
/// ```
pub struct Watcher {
    path: PathBuf,
    scope: WatchScope,
    handler: Option<WatchHandler>,
    filter: Option<EventFilter>,
    executor: Option<Arc<dyn Executor>>,
    approximation: Option<Approximation>,
    service: Option<WatchService>,
}

impl Watcher {
    /// Starts configuring a watch on `path`.
    ///
    /// The path must be absolute. `PathAndChildren` and `PathAndAllDescendants` need a
    /// directory (symlinks are not followed); `PathOnly` cannot watch a symlink or a file
    /// system root. A path that does not exist yet is accepted here and fails in
    /// [`start`](Self::start).
    pub fn watch(path: impl Into<PathBuf>, scope: WatchScope) -> Result<Self, WatchError> {
        let path = path.into();
        validate(&path, scope)?;
        Ok(Self {
            path,
            scope,
            handler: None,
            filter: None,
            executor: None,
            approximation: None,
            service: None,
        })
    }

    /// Sets the closure receiving every event. Only one handler may be registered.
    pub fn on<F>(self, handler: F) -> Result<Self, WatchError>
    where
        F: Fn(&WatchEvent) + Send + Sync + 'static,
    {
        self.on_handler(Arc::new(move |_watch: &dyn EventHandlingWatch, event: &WatchEvent| {
            handler(event)
        }))
    }

    /// Like [`on`](Self::on), but the handler also sees the watch that observed the event.
    pub fn on_handler(mut self, handler: WatchHandler) -> Result<Self, WatchError> {
        if self.handler.is_some() {
            return Err(WatchError::invalid("a handler was already registered"));
        }
        self.handler = Some(handler);
        Ok(self)
    }

    /// Registers per-kind callbacks instead of a single closure.
    pub fn on_listener<L>(self, listener: L) -> Result<Self, WatchError>
    where
        L: WatchEventListener + 'static,
    {
        self.on_handler(listener_handler(Arc::new(listener)))
    }

    /// Drops events for which `predicate` returns `false` before any handler (including
    /// overflow recovery) sees them. Only one filter may be registered.
    pub fn filter<P>(mut self, predicate: P) -> Result<Self, WatchError>
    where
        P: Fn(&WatchEvent) -> bool + Send + Sync + 'static,
    {
        if self.filter.is_some() {
            return Err(WatchError::invalid("a filter was already registered"));
        }
        self.filter = Some(Arc::new(predicate));
        Ok(self)
    }

    /// Runs handlers and rescans on `executor` instead of the service's default pool.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn on_overflow(mut self, approximation: Approximation) -> Self {
        self.approximation = Some(approximation);
        self
    }

    /// Uses `service` instead of [`WatchService::system`].
    pub fn with_service(mut self, service: WatchService) -> Self {
        self.service = Some(service);
        self
    }

    /// Registers the watch. Events flow to the handler until the returned [`ActiveWatch`] is
    /// closed or dropped.
    pub fn start(self) -> Result<ActiveWatch, WatchError> {
        let handler = self
            .handler
            .ok_or_else(|| WatchError::invalid("no handler registered; call `on` or `on_listener`"))?;
        let service = match self.service {
            Some(service) => service,
            None => WatchService::system()?,
        };
        let executor = self.executor.unwrap_or_else(|| service.default_executor());
        let approximation = self
            .approximation
            .unwrap_or(service.settings().default_overflow);

        let (watched_dir, rescan_scope) = match self.scope {
            WatchScope::PathOnly => (parent_of(&self.path)?, WatchScope::PathAndChildren),
            scope => (self.path.clone(), scope),
        };

        let mut chain = HandlerChain::new(handler);
        if let Some(hook) = overflow_handler(
            approximation,
            OverflowContext {
                executor: Arc::clone(&executor),
                path: &watched_dir,
                scope: rescan_scope,
            },
        ) {
            chain = chain.then(hook);
        }

        let directory_options = |recursive: bool| DirectoryWatchOptions {
            service: service.clone(),
            path: watched_dir.clone(),
            root: watched_dir.clone(),
            recursive,
            executor: Arc::clone(&executor),
            chain: chain.clone(),
            filter: self.filter.clone(),
        };

        let inner = match self.scope {
            WatchScope::PathOnly => {
                let watch = FileWatch::new(self.path.clone(), directory_options(false));
                watch.open().map_err(|err| WatchError::io(&self.path, err))?;
                ActiveInner::File(watch)
            }
            WatchScope::PathAndChildren => {
                let watch = DirectoryWatch::new(directory_options(false));
                watch.open().map_err(|err| WatchError::io(&self.path, err))?;
                ActiveInner::Directory(watch)
            }
            WatchScope::PathAndAllDescendants => {
                let native = if service.supports_native_recursion() {
                    let watch = DirectoryWatch::new(directory_options(true));
                    match watch.open() {
                        Ok(()) => Some(watch),
                        Err(err) => {
                            tracing::warn!(
                                target: "treewatch.watch",
                                path = %self.path.display(),
                                error = %err,
                                "native recursive watch failed; emulating with a directory tree"
                            );
                            None
                        }
                    }
                } else {
                    None
                };

                match native {
                    Some(watch) => ActiveInner::Directory(watch),
                    None => {
                        let tree = FileTreeWatch::new(TreeOptions {
                            service: service.clone(),
                            root: self.path.clone(),
                            executor: Arc::clone(&executor),
                            handlers: chain.clone(),
                            filter: self.filter.clone(),
                        });
                        tree.open().map_err(|err| WatchError::io(&self.path, err))?;
                        ActiveInner::Tree(tree)
                    }
                }
            }
        };

        tracing::debug!(
            target: "treewatch.watch",
            path = %self.path.display(),
            scope = %self.scope,
            overflow = %approximation,
            backend = service.backend_name(),
            "watch started"
        );
        Ok(ActiveWatch {
            path: self.path,
            scope: self.scope,
            inner,
        })
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("path", &self.path)
            .field("scope", &self.scope)
            .field("has_handler", &self.handler.is_some())
            .field("has_filter", &self.filter.is_some())
            .field("approximation", &self.approximation)
            .finish_non_exhaustive()
    }
}

fn validate(path: &Path, scope: WatchScope) -> Result<(), WatchError> {
    if !path.is_absolute() {
        return Err(WatchError::invalid(format!(
            "watch path must be absolute: {}",
            path.display()
        )));
    }

    let meta = std::fs::symlink_metadata(path).ok();
    if scope.requires_directory() {
        if let Some(meta) = meta {
            if !meta.is_dir() {
                return Err(WatchError::invalid(format!(
                    "scope `{scope}` needs a directory, but {} is not one",
                    path.display()
                )));
            }
        }
    } else {
        parent_of(path)?;
        if meta.is_some_and(|meta| meta.file_type().is_symlink()) {
            return Err(WatchError::invalid(format!(
                "cannot watch symbolic link {} with scope `{scope}`",
                path.display()
            )));
        }
    }
    Ok(())
}

fn parent_of(path: &Path) -> Result<PathBuf, WatchError> {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(_)) => Ok(parent.to_path_buf()),
        _ => Err(WatchError::invalid(format!(
            "{} has no parent directory to watch it through",
            path.display()
        ))),
    }
}

enum ActiveInner {
    Directory(DirectoryWatch),
    File(FileWatch),
    Tree(FileTreeWatch),
}

/// A running watch. Closing (explicitly or by dropping) stops delivery and releases every
/// native registration it holds.
pub struct ActiveWatch {
    path: PathBuf,
    scope: WatchScope,
    inner: ActiveInner,
}

impl ActiveWatch {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scope(&self) -> WatchScope {
        self.scope
    }

    /// `true` when a recursive scope is served by the backend directly instead of a tree of
    /// per-directory watches.
    pub fn is_native_recursive(&self) -> bool {
        self.scope == WatchScope::PathAndAllDescendants
            && matches!(self.inner, ActiveInner::Directory(_))
    }

    /// Directories with a live node (relative to the watch path) when recursion is emulated.
    pub fn tree_directories(&self) -> Option<Vec<PathBuf>> {
        match &self.inner {
            ActiveInner::Tree(tree) => Some(tree.watched_directories()),
            _ => None,
        }
    }

    /// Delivers `event` through the watch's filter and handlers as if the backend had produced
    /// it. Injecting an overflow triggers the configured recovery.
    pub fn handle_event(&self, event: WatchEvent) {
        self.as_watch().handle_event(event);
    }

    pub fn is_closed(&self) -> bool {
        match &self.inner {
            ActiveInner::Directory(watch) => watch.is_closed(),
            ActiveInner::File(watch) => watch.is_closed(),
            ActiveInner::Tree(tree) => tree.is_closed(),
        }
    }

    /// Stops delivery. Idempotent. With a tree every node is closed even if some fail; the
    /// first failure is returned.
    pub fn close(&self) -> Result<(), WatchError> {
        let result = match &self.inner {
            ActiveInner::Directory(watch) => watch.close(),
            ActiveInner::File(watch) => watch.close(),
            ActiveInner::Tree(tree) => tree.close(),
        };
        result.map_err(|err| WatchError::io(&self.path, err))
    }

    fn as_watch(&self) -> &dyn EventHandlingWatch {
        match &self.inner {
            ActiveInner::Directory(watch) => watch,
            ActiveInner::File(watch) => watch,
            ActiveInner::Tree(tree) => tree,
        }
    }
}

impl fmt::Debug for ActiveWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveWatch")
            .field("path", &self.path)
            .field("scope", &self.scope)
            .field("native_recursive", &self.is_native_recursive())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for ActiveWatch {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::error!(target: "treewatch.watch", error = %err, "failed to close watch on drop");
        }
    }
}
