//! The shared watch runtime: one native backend behind one bundling layer.

use std::fmt;
use std::io;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::bundle::{Callback, Multiplexer, Registration, Subscribable, SubscriptionGuard};
use crate::config::WatchSettings;
use crate::error::WatchError;
use crate::executor::{default_executor, default_thread_count, Executor, PooledExecutor};
use crate::key::SubscriptionKey;
use crate::native::{NativeBackend, RawBatch};

struct BackendSource(Arc<dyn NativeBackend>);

impl Subscribable<SubscriptionKey, RawBatch> for BackendSource {
    fn subscribe(
        &self,
        key: &SubscriptionKey,
        sink: Callback<RawBatch>,
    ) -> io::Result<Box<dyn Registration>> {
        self.0.register(key, sink)
    }
}

struct ServiceInner {
    backend: Arc<dyn NativeBackend>,
    bundled: Multiplexer<SubscriptionKey, RawBatch>,
    settings: WatchSettings,
    executor: OnceCell<Arc<dyn Executor>>,
}

/// A native backend plus the bundling layer in front of it.
///
/// Every watch node holds a clone of the service it was started with, so a whole process
/// normally shares a single backend (see [`WatchService::system`]). Tests and embedders can
/// build their own with any [`NativeBackend`].
#[derive(Clone)]
pub struct WatchService {
    inner: Arc<ServiceInner>,
}

impl WatchService {
    pub fn new(backend: Arc<dyn NativeBackend>, settings: WatchSettings) -> Result<Self, WatchError> {
        settings.validate()?;
        let source = Arc::new(BackendSource(Arc::clone(&backend)));
        let bundled =
            Multiplexer::new(source, settings.close_grace()).map_err(WatchError::Runtime)?;
        tracing::debug!(
            target: "treewatch.service",
            backend = backend.name(),
            native_recursion = backend.supports_native_recursion(),
            "watch service started"
        );
        Ok(Self {
            inner: Arc::new(ServiceInner {
                backend,
                bundled,
                settings,
                executor: OnceCell::new(),
            }),
        })
    }

    /// The process-wide service backed by the operating system, created on first use from the
    /// default settings and `TREEWATCH_*` environment overrides.
    pub fn system() -> Result<Self, WatchError> {
        static SYSTEM: OnceCell<WatchService> = OnceCell::new();
        SYSTEM.get_or_try_init(Self::create_system).cloned()
    }

    #[cfg(feature = "watch-notify")]
    fn create_system() -> Result<Self, WatchError> {
        let settings = WatchSettings::default().with_env_overrides()?;
        let backend =
            crate::native::NotifyBackend::with_settings(&settings).map_err(WatchError::Runtime)?;
        Self::new(Arc::new(backend), settings)
    }

    #[cfg(not(feature = "watch-notify"))]
    fn create_system() -> Result<Self, WatchError> {
        Err(WatchError::invalid(
            "no operating-system backend compiled in (enable the `watch-notify` feature)",
        ))
    }

    pub fn settings(&self) -> &WatchSettings {
        &self.inner.settings
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    pub fn supports_native_recursion(&self) -> bool {
        self.inner.settings.prefer_native_recursion && self.inner.backend.supports_native_recursion()
    }

    /// The executor used by watches that were not given one.
    ///
    /// With the default thread count this is the shared process-wide pool; otherwise the
    /// service builds its own pool on first use.
    pub fn default_executor(&self) -> Arc<dyn Executor> {
        let executor = self.inner.executor.get_or_init(|| {
            let threads = self.inner.settings.handler_threads;
            if threads == default_thread_count() {
                default_executor()
            } else {
                Arc::new(PooledExecutor::new("treewatch-handler", threads)) as Arc<dyn Executor>
            }
        });
        Arc::clone(executor)
    }

    /// Number of native registrations currently alive or waiting for their grace period.
    pub fn active_registrations(&self) -> usize {
        self.inner.bundled.active_keys()
    }

    pub(crate) fn subscribe(
        &self,
        key: &SubscriptionKey,
        callback: Callback<RawBatch>,
    ) -> io::Result<SubscriptionGuard> {
        self.inner.bundled.subscribe(key, callback)
    }
}

impl fmt::Debug for WatchService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchService")
            .field("backend", &self.backend_name())
            .field("settings", &self.inner.settings)
            .finish()
    }
}
