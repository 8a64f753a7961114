use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{DirectoryWatch, DirectoryWatchOptions, EventFilter, EventHandlingWatch};
use crate::event::{WatchEvent, WatchEventKind};
use crate::scope::WatchScope;

/// A watch on a single path, emulated with a watch on its parent directory.
///
/// Only events whose relative path is the file's name get through, plus overflows: overflow
/// recovery rescans the parent directory and the synthesized events pass the same filter, so
/// the handler only ever hears about the watched file.
#[derive(Clone)]
pub struct FileWatch {
    file: PathBuf,
    parent: DirectoryWatch,
}

impl FileWatch {
    /// `options.path` must be the parent of `file`. `options.filter`, if any, is applied after
    /// the file-name filter.
    pub(crate) fn new(file: PathBuf, mut options: DirectoryWatchOptions) -> Self {
        let name: OsString = file.file_name().map(OsString::from).unwrap_or_default();
        let user_filter = options.filter.take();
        let filter: EventFilter = Arc::new(move |event: &WatchEvent| {
            let relevant = event.kind() == WatchEventKind::Overflow
                || event.relative().as_os_str() == name.as_os_str();
            relevant && user_filter.as_ref().map_or(true, |filter| filter(event))
        });
        options.filter = Some(filter);
        Self {
            file,
            parent: DirectoryWatch::new(options),
        }
    }

    pub fn open(&self) -> io::Result<()> {
        self.parent.open()
    }

    pub fn close(&self) -> io::Result<()> {
        self.parent.close()
    }

    pub fn is_closed(&self) -> bool {
        self.parent.is_closed()
    }
}

impl EventHandlingWatch for FileWatch {
    fn path(&self) -> &Path {
        &self.file
    }

    fn root(&self) -> &Path {
        self.parent.root()
    }

    fn scope(&self) -> WatchScope {
        WatchScope::PathOnly
    }

    fn handle_event(&self, event: WatchEvent) {
        self.parent.handle_event(event)
    }

    fn detach(&self) -> Arc<dyn EventHandlingWatch> {
        Arc::new(self.clone())
    }
}
