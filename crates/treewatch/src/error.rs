use std::io;
use std::path::PathBuf;

use crate::config::ConfigError;

/// Errors surfaced by the public watch API.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The watch was configured in a way that can never work (relative path, wrong path type
    /// for the scope, handler registered twice, ...). Raised synchronously, before anything
    /// is registered with the operating system.
    #[error("invalid watch configuration: {0}")]
    InvalidConfig(String),

    #[error("watch on {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Threads or native resources backing the watch runtime could not be created.
    #[error("failed to start watch runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl WatchError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        WatchError::InvalidConfig(message.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        WatchError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Remembers the first error of a best-effort sequence of operations.
///
/// Used when closing several resources: every resource gets closed, and the first failure is
/// reported once everything had a chance to run.
#[derive(Debug, Default)]
pub(crate) struct FirstError {
    first: Option<io::Error>,
}

impl FirstError {
    pub(crate) fn record(&mut self, result: io::Result<()>) {
        if let Err(err) = result {
            if self.first.is_none() {
                self.first = Some(err);
            } else {
                tracing::debug!(target: "treewatch.watch", error = %err, "suppressed secondary close error");
            }
        }
    }

    pub(crate) fn into_result(self) -> io::Result<()> {
        match self.first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
