//! Executors that run event handlers and rescans off the native drain thread.

use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel as channel;
use once_cell::sync::OnceCell;
use rayon::ThreadPool;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs jobs, usually on another thread.
///
/// Watches never run user handlers on the backend's drain thread: every batch of events is
/// handed to the watch's executor.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Runs every job on the calling thread.
///
/// Useful in tests (delivery becomes synchronous and deterministic) and as a last-resort
/// fallback when no worker threads can be spawned.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) {
        job()
    }
}

enum Pool {
    Rayon(ThreadPool),
    Inline,
}

/// A bounded pool of named worker threads.
pub struct PooledExecutor {
    name: &'static str,
    pool: Pool,
}

impl PooledExecutor {
    /// Builds a pool with up to `threads` workers.
    ///
    /// Thread creation can fail in constrained environments (low `RLIMIT_NPROC`, `EAGAIN`).
    /// Rather than failing, the pool is retried at half the size, and if not even a single
    /// worker can be spawned the executor runs jobs inline.
    pub fn new(name: &'static str, threads: usize) -> Self {
        let mut threads = threads.max(1);
        loop {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(move |idx| format!("{name}-{idx}"))
                .build()
            {
                Ok(pool) => {
                    return Self {
                        name,
                        pool: Pool::Rayon(pool),
                    }
                }
                Err(_) if threads > 1 => {
                    threads = (threads / 2).max(1);
                }
                Err(err) => {
                    tracing::warn!(
                        target: "treewatch.executor",
                        pool = name,
                        error = %err,
                        "failed to spawn worker threads; running jobs inline"
                    );
                    return Self {
                        name,
                        pool: Pool::Inline,
                    };
                }
            }
        }
    }

    pub fn threads(&self) -> usize {
        match &self.pool {
            Pool::Rayon(pool) => pool.current_num_threads(),
            Pool::Inline => 0,
        }
    }

    /// Runs `op` on one of the pool's workers and blocks until it finishes.
    ///
    /// Unlike `ThreadPool::install`, the calling thread does not steal work while it waits, so
    /// callers may hold locks that other queued jobs need. A panic in `op` is resumed on the
    /// calling thread.
    pub fn run<R, F>(&self, op: F) -> io::Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        match &self.pool {
            Pool::Rayon(pool) => {
                let (tx, rx) = channel::bounded(1);
                pool.spawn(move || {
                    let _ = tx.send(catch_unwind(AssertUnwindSafe(op)));
                });
                match rx.recv() {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(panic)) => resume_unwind(panic),
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::Interrupted,
                        format!("{} worker exited before finishing", self.name),
                    )),
                }
            }
            Pool::Inline => Ok(op()),
        }
    }
}

impl Executor for PooledExecutor {
    fn execute(&self, job: Job) {
        match &self.pool {
            // rayon aborts the process when a spawned job panics.
            Pool::Rayon(pool) => pool.spawn(move || run_job_guarded(job)),
            Pool::Inline => job(),
        }
    }
}

impl fmt::Debug for PooledExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledExecutor")
            .field("name", &self.name)
            .field("threads", &self.threads())
            .finish()
    }
}

/// Default number of worker threads for handler and registration pools.
pub fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, 8)
}

/// The process-wide handler pool used by watches that were not given an executor.
///
/// Created on first use.
pub fn default_executor() -> Arc<dyn Executor> {
    static DEFAULT: OnceCell<Arc<PooledExecutor>> = OnceCell::new();
    let pool = DEFAULT.get_or_init(|| {
        Arc::new(PooledExecutor::new(
            "treewatch-handler",
            default_thread_count(),
        ))
    });
    Arc::clone(pool) as Arc<dyn Executor>
}

fn run_job_guarded(job: Job) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
        tracing::error!(
            target: "treewatch.executor",
            panic = %panic_message(panic.as_ref()),
            "job panicked"
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("<non-string panic>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn inline_executor_runs_on_calling_thread() {
        let caller = std::thread::current().id();
        let (tx, rx) = channel::bounded(1);
        InlineExecutor.execute(Box::new(move || {
            tx.send(std::thread::current().id()).unwrap();
        }));
        assert_eq!(rx.try_recv().unwrap(), caller);
    }

    #[test]
    fn pooled_executor_runs_jobs_on_named_workers() {
        let pool = PooledExecutor::new("treewatch-test", 2);
        let (tx, rx) = channel::bounded(1);
        pool.execute(Box::new(move || {
            let name = std::thread::current().name().map(str::to_owned);
            tx.send(name).unwrap();
        }));

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        if pool.threads() > 0 {
            assert!(name.unwrap().starts_with("treewatch-test-"));
        }
    }

    #[test]
    fn run_returns_the_closure_result() {
        let pool = PooledExecutor::new("treewatch-run", 1);
        assert_eq!(pool.run(|| 40 + 2).unwrap(), 42);
    }

    #[test]
    fn panicking_job_does_not_take_down_the_pool() {
        let pool = PooledExecutor::new("treewatch-panic", 1);
        pool.execute(Box::new(|| panic!("handler bug")));

        let (tx, rx) = channel::bounded(1);
        pool.execute(Box::new(move || tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "<non-string panic>");
    }
}
