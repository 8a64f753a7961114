#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::WatchSettings;
use crate::event::{WatchEvent, WatchEventKind};
use crate::native::ManualBackend;
use crate::service::WatchService;

/// A service over `backend` with a short close grace period.
pub(crate) fn manual_service(backend: &ManualBackend) -> WatchService {
    let settings = WatchSettings {
        close_grace_ms: 5,
        ..WatchSettings::default()
    };
    match WatchService::new(Arc::new(backend.clone()), settings) {
        Ok(service) => service,
        Err(err) => panic!("failed to build manual service: {err}"),
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Collects every event a handler receives.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    events: Arc<Mutex<Vec<WatchEvent>>>,
}

impl Recorder {
    pub(crate) fn push(&self, event: &WatchEvent) {
        self.events.lock().push(event.clone());
    }

    pub(crate) fn events(&self) -> Vec<WatchEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn clear(&self) {
        self.events.lock().clear();
    }

    /// `(kind, relative path)` pairs, which is what most assertions care about.
    pub(crate) fn summary(&self) -> Vec<(WatchEventKind, String)> {
        self.events
            .lock()
            .iter()
            .map(|event| (event.kind(), slash_path(event.relative())))
            .collect()
    }

    pub(crate) fn contains(&self, kind: WatchEventKind, relative: &str) -> bool {
        self.summary()
            .iter()
            .any(|(k, rel)| *k == kind && rel == relative)
    }

    pub(crate) fn count(&self, kind: WatchEventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }
}

pub(crate) fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
