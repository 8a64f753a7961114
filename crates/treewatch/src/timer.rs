//! A single-threaded delay queue for deferred teardown.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crossbeam_channel as channel;

use crate::executor::{panic_message, Job};

struct Delayed {
    deadline: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    // Reversed so `BinaryHeap` pops the earliest deadline first; ties run in submission order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Runs jobs after a delay on a dedicated thread.
///
/// Jobs are expected to be short (closing a native registration). When the executor is
/// dropped, jobs that have not fired yet run immediately so no teardown is lost.
pub(crate) struct DelayedExecutor {
    tx: channel::Sender<(Duration, Job)>,
}

impl DelayedExecutor {
    pub(crate) fn new(name: &str) -> io::Result<Self> {
        let (tx, rx) = channel::unbounded::<(Duration, Job)>();
        std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run_delay_loop(rx))?;
        Ok(Self { tx })
    }

    pub(crate) fn schedule(&self, delay: Duration, job: Job) {
        if let Err(channel::SendError((_, job))) = self.tx.send((delay, job)) {
            // The timer thread is gone; run now rather than leak the teardown.
            run_job(job);
        }
    }
}

fn run_delay_loop(rx: channel::Receiver<(Duration, Job)>) {
    let mut heap = BinaryHeap::<Delayed>::new();
    let mut seq = 0_u64;

    loop {
        let tick = match heap.peek() {
            Some(next) => channel::at(next.deadline),
            None => channel::never(),
        };

        channel::select! {
            recv(rx) -> msg => match msg {
                Ok((delay, job)) => {
                    seq += 1;
                    heap.push(Delayed {
                        deadline: Instant::now() + delay,
                        seq,
                        job,
                    });
                }
                Err(_) => {
                    while let Some(delayed) = heap.pop() {
                        run_job(delayed.job);
                    }
                    return;
                }
            },
            recv(tick) -> _ => {
                let now = Instant::now();
                while heap.peek().is_some_and(|next| next.deadline <= now) {
                    if let Some(delayed) = heap.pop() {
                        run_job(delayed.job);
                    }
                }
            }
        }
    }
}

fn run_job(job: Job) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
        tracing::error!(
            target: "treewatch.timer",
            panic = %panic_message(panic.as_ref()),
            "delayed job panicked"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_jobs_in_deadline_order() {
        let timer = DelayedExecutor::new("treewatch-timer-test").unwrap();
        let (tx, rx) = channel::unbounded();

        let late = tx.clone();
        timer.schedule(
            Duration::from_millis(60),
            Box::new(move || late.send("late").unwrap()),
        );
        timer.schedule(
            Duration::from_millis(5),
            Box::new(move || tx.send("early").unwrap()),
        );

        let timeout = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), "early");
        assert_eq!(rx.recv_timeout(timeout).unwrap(), "late");
    }

    #[test]
    fn pending_jobs_run_when_dropped() {
        let timer = DelayedExecutor::new("treewatch-timer-drop").unwrap();
        let (tx, rx) = channel::unbounded();
        timer.schedule(
            Duration::from_secs(3600),
            Box::new(move || tx.send(()).unwrap()),
        );
        drop(timer);

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn panicking_job_does_not_stop_the_timer() {
        let timer = DelayedExecutor::new("treewatch-timer-panic").unwrap();
        let (tx, rx) = channel::unbounded();
        timer.schedule(Duration::ZERO, Box::new(|| panic!("boom")));
        timer.schedule(
            Duration::from_millis(1),
            Box::new(move || tx.send(()).unwrap()),
        );

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
