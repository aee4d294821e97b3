//! Fixed worker pool for the tick scheduler.
//!
//! The pool is created once with a fixed parallelism; each worker thread
//! carries a stable index retrievable from inside a task via
//! [`current_thread_index`]. [`WorkerPool::dispatch`] partitions an index
//! range into contiguous slices and blocks until every worker finished its
//! slice. Worker panics are collected and re-raised on the calling thread
//! after the remaining workers complete their slices.

use evochora_channel::{bounded, unbounded, Receiver, Sender};
use evochora_logger::debug;
use std::any::Any;
use std::cell::Cell;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{Builder, JoinHandle};

thread_local! {
    static WORKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// The stable index of the current pool worker, or `None` outside the pool.
pub fn current_thread_index() -> Option<usize> {
    WORKER_INDEX.with(Cell::get)
}

type Task = Arc<dyn Fn(usize, usize) + Send + Sync + 'static>;
type Outcome = Result<(), Box<dyn Any + Send>>;

struct Job {
    from: usize,
    to: usize,
    task: Task,
    done: Sender<(usize, Outcome)>,
}

struct Inner {
    senders: Vec<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

/// A fixed-size pool of named worker threads.
pub struct WorkerPool {
    parallelism: usize,
    inner: Mutex<Option<Inner>>,
}

impl WorkerPool {
    /// Spawns `parallelism` workers (at least 2).
    pub fn new(parallelism: usize) -> WorkerPool {
        let parallelism = parallelism.max(2);
        let mut senders = Vec::with_capacity(parallelism);
        let mut handles = Vec::with_capacity(parallelism);
        for index in 0..parallelism {
            let (sender, receiver) = unbounded::<Job>();
            let handle = Builder::new()
                .name(format!("tick-worker-{}", index))
                .spawn(move || worker_main(index, receiver))
                .expect("spawn tick worker");
            senders.push(sender);
            handles.push(handle);
        }
        WorkerPool {
            parallelism,
            inner: Mutex::new(Some(Inner { senders, handles })),
        }
    }

    /// The fixed worker count.
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Partitions `[0, len)` into `min(active, parallelism)` contiguous
    /// ranges and runs `body(from, to)` on one worker per range, blocking
    /// until all of them finish.
    ///
    /// # Panics
    ///
    /// Panics when called from inside a pool worker (re-entrant dispatch),
    /// after shutdown, or when a worker's `body` panicked; the panic
    /// payload is re-raised here once the other workers completed.
    pub fn dispatch<F>(&self, len: usize, active: usize, body: F)
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        assert!(
            current_thread_index().is_none(),
            "re-entrant dispatch from a pool worker"
        );
        if len == 0 {
            return;
        }
        let pieces = partition(len, active.clamp(1, self.parallelism));

        let senders: Vec<Sender<Job>> = {
            let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let inner = guard.as_ref().expect("dispatch on a shut-down pool");
            inner.senders[..pieces.len()].to_vec()
        };

        let task: Task = erase(Arc::new(body));
        let (done_tx, done_rx) = bounded::<(usize, Outcome)>(pieces.len());
        for (sender, (from, to)) in senders.iter().zip(&pieces) {
            sender
                .send(Job {
                    from: *from,
                    to: *to,
                    task: Arc::clone(&task),
                    done: done_tx.clone(),
                })
                .expect("pool worker exited while dispatching");
        }
        drop(done_tx);

        let mut outcomes: Vec<Option<Outcome>> = (0..pieces.len()).map(|_| None).collect();
        for _ in 0..pieces.len() {
            let (index, outcome) = done_rx
                .recv()
                .expect("pool worker exited before completing its slice");
            outcomes[index] = Some(outcome);
        }
        // all workers have dropped their task clones; the borrow in `task`
        // ends when it is dropped at the end of this call
        drop(task);
        for outcome in outcomes.into_iter().flatten() {
            if let Err(payload) = outcome {
                resume_unwind(payload);
            }
        }
    }

    /// Stops and joins all workers. Idempotent.
    pub fn shutdown(&self) {
        let inner = {
            let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(inner) = inner {
            drop(inner.senders);
            for handle in inner.handles {
                let _ = handle.join();
            }
            debug!("worker pool shut down");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_main(index: usize, receiver: Receiver<Job>) {
    WORKER_INDEX.with(|cell| cell.set(Some(index)));
    while let Ok(job) = receiver.recv() {
        let outcome = catch_unwind(AssertUnwindSafe(|| (job.task)(job.from, job.to)));
        // release the task borrow before reporting completion
        drop(job.task);
        let _ = job.done.send((index, outcome));
    }
}

/// Splits `[0, len)` into `pieces` contiguous, non-empty, balanced ranges.
fn partition(len: usize, pieces: usize) -> Vec<(usize, usize)> {
    let pieces = pieces.min(len);
    let base = len / pieces;
    let extra = len % pieces;
    let mut ranges = Vec::with_capacity(pieces);
    let mut start = 0;
    for piece in 0..pieces {
        let size = base + usize::from(piece < extra);
        ranges.push((start, start + size));
        start += size;
    }
    debug_assert_eq!(start, len);
    ranges
}

/// Erases the caller-stack lifetime of a dispatch body.
///
/// Sound because `dispatch` does not return until every worker has dropped
/// its clone of the task, so no worker can observe the closure after the
/// caller's borrow ends.
fn erase<'env>(task: Arc<dyn Fn(usize, usize) + Send + Sync + 'env>) -> Task {
    unsafe {
        std::mem::transmute::<
            Arc<dyn Fn(usize, usize) + Send + Sync + 'env>,
            Arc<dyn Fn(usize, usize) + Send + Sync + 'static>,
        >(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn every_index_is_visited_exactly_once() {
        let pool = WorkerPool::new(4);
        let hits: Vec<AtomicUsize> = (0..1000).map(|_| AtomicUsize::new(0)).collect();
        pool.dispatch(hits.len(), 4, |from, to| {
            for i in from..to {
                hits[i].fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(hits.iter().all(|h| h.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn all_assigned_thread_indices_appear() {
        let pool = WorkerPool::new(4);
        let seen = Mutex::new(HashSet::new());
        pool.dispatch(400, 4, |_, _| {
            seen.lock()
                .unwrap()
                .insert(current_thread_index().expect("inside pool"));
        });
        assert_eq!(*seen.lock().unwrap(), (0..4).collect::<HashSet<_>>());
    }

    #[test]
    fn active_parallelism_caps_the_partition_count() {
        let pool = WorkerPool::new(8);
        let seen = Mutex::new(HashSet::new());
        pool.dispatch(100, 2, |from, to| {
            seen.lock().unwrap().insert((from, to));
        });
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn thousands_of_dispatches_do_not_deadlock() {
        let pool = WorkerPool::new(3);
        let counter = AtomicUsize::new(0);
        for _ in 0..2000 {
            pool.dispatch(7, 3, |from, to| {
                counter.fetch_add(to - from, Ordering::Relaxed);
            });
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2000 * 7);
    }

    #[test]
    fn panics_propagate_after_other_workers_finish() {
        let pool = WorkerPool::new(2);
        let finished = AtomicUsize::new(0);
        let result = catch_unwind(AssertUnwindSafe(|| {
            pool.dispatch(2, 2, |from, _| {
                if from == 0 {
                    panic!("boom");
                }
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }));
        assert!(result.is_err());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        // the pool survives a panicking dispatch
        pool.dispatch(2, 2, |_, _| {});
    }

    #[test]
    fn shutdown_is_idempotent() {
        let pool = WorkerPool::new(2);
        pool.shutdown();
        pool.shutdown();
    }

    #[test]
    fn short_ranges_use_fewer_workers() {
        assert_eq!(partition(2, 4), vec![(0, 1), (1, 2)]);
        assert_eq!(partition(10, 3), vec![(0, 4), (4, 7), (7, 10)]);
    }
}
