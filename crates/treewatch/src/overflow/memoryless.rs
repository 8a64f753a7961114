use std::sync::Arc;

use super::{emit, ScopeWalk};
use crate::event::{WatchEvent, WatchEventKind};
use crate::executor::Executor;
use crate::watch::EventHandlingWatch;

/// Recovers from overflows by reporting everything in scope as new.
///
/// For each entry below the watch path (down to the scope's depth): `Created`, followed by
/// `Modified` when the entry is a non-empty regular file. Deletions are never reported, and
/// consumers must tolerate duplicate creates.
pub struct MemorylessRescanner {
    executor: Arc<dyn Executor>,
}

impl MemorylessRescanner {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    pub fn accept(&self, watch: &dyn EventHandlingWatch, event: &WatchEvent) {
        if event.kind() != WatchEventKind::Overflow {
            return;
        }
        let watch = watch.detach();
        self.executor.execute(Box::new(move || rescan(watch.as_ref())));
    }
}

fn rescan(watch: &dyn EventHandlingWatch) {
    let walk = ScopeWalk::run(watch.path(), watch.scope());
    let mut events = Vec::with_capacity(walk.entries.len());
    for entry in walk.entries {
        let non_empty_file = entry.file_type().is_file()
            && entry.metadata().map(|meta| meta.len() > 0).unwrap_or(false);
        let path = entry.into_path();
        if non_empty_file {
            events.push((WatchEventKind::Created, path.clone()));
            events.push((WatchEventKind::Modified, path));
        } else {
            events.push((WatchEventKind::Created, path));
        }
    }

    tracing::debug!(
        target: "treewatch.overflow",
        path = %watch.path().display(),
        events = events.len(),
        "memoryless rescan finished"
    );
    emit(watch, events);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InlineExecutor;
    use crate::native::ManualBackend;
    use crate::scope::WatchScope;
    use crate::test_support::{manual_service, Recorder};
    use crate::watch::{DirectoryWatch, DirectoryWatchOptions, HandlerChain};
    use std::path::Path;

    fn watch_with_rescanner(backend: &ManualBackend, dir: &Path) -> (DirectoryWatch, Recorder) {
        let recorder = Recorder::default();
        let sink = recorder.clone();
        let rescanner = MemorylessRescanner::new(Arc::new(InlineExecutor));
        let chain = HandlerChain::new(Arc::new(
            move |_: &dyn EventHandlingWatch, e: &WatchEvent| sink.push(e),
        ))
        .then(Arc::new(move |w: &dyn EventHandlingWatch, e: &WatchEvent| {
            rescanner.accept(w, e)
        }));
        let watch = DirectoryWatch::new(DirectoryWatchOptions {
            service: manual_service(backend),
            path: dir.to_path_buf(),
            root: dir.to_path_buf(),
            recursive: false,
            executor: Arc::new(InlineExecutor),
            chain,
            filter: None,
        });
        (watch, recorder)
    }

    #[test]
    fn reports_created_and_modified_for_non_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x"), b"").unwrap();
        std::fs::write(dir.path().join("y"), b"content").unwrap();

        let backend = ManualBackend::new();
        let (watch, recorder) = watch_with_rescanner(&backend, dir.path());
        watch.open().unwrap();
        watch.handle_event(WatchEvent::new(WatchEventKind::Overflow, dir.path(), ""));

        let mut synthesized: Vec<_> = recorder
            .summary()
            .into_iter()
            .filter(|(kind, _)| *kind != WatchEventKind::Overflow)
            .collect();
        synthesized.sort();
        assert_eq!(
            synthesized,
            vec![
                (WatchEventKind::Created, "x".to_owned()),
                (WatchEventKind::Created, "y".to_owned()),
                (WatchEventKind::Modified, "y".to_owned()),
            ]
        );
        assert_eq!(recorder.count(WatchEventKind::Deleted), 0);
    }

    #[test]
    fn created_precedes_modified_for_each_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("y"), b"content").unwrap();

        let backend = ManualBackend::new();
        let (watch, recorder) = watch_with_rescanner(&backend, dir.path());
        watch.open().unwrap();
        watch.handle_event(WatchEvent::new(WatchEventKind::Overflow, dir.path(), ""));

        assert_eq!(
            recorder.summary(),
            vec![
                (WatchEventKind::Overflow, String::new()),
                (WatchEventKind::Created, "y".to_owned()),
                (WatchEventKind::Modified, "y".to_owned()),
            ]
        );
    }

    #[test]
    fn ignores_non_overflow_events_and_stays_within_depth() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/deep.txt"), b"x").unwrap();

        let backend = ManualBackend::new();
        let (watch, recorder) = watch_with_rescanner(&backend, dir.path());
        watch.open().unwrap();

        watch.handle_event(WatchEvent::new(WatchEventKind::Modified, dir.path(), "sub"));
        assert_eq!(recorder.events().len(), 1);

        recorder.clear();
        watch.handle_event(WatchEvent::new(WatchEventKind::Overflow, dir.path(), ""));
        assert_eq!(
            recorder.summary(),
            vec![
                (WatchEventKind::Overflow, String::new()),
                (WatchEventKind::Created, "sub".to_owned()),
            ]
        );
        assert_eq!(watch.scope(), WatchScope::PathAndChildren);
    }
}
