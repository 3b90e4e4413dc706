//! Fixed-size worker pool for per-item extraction.
//!
//! The pool outlives individual batches: threads are spawned once and fed boxed jobs over a
//! crossbeam channel. `run_batch` keeps at most `size()` jobs in flight, samples the memory
//! guard after every completion, and stops handing out work the moment the guard trips.
//! Jobs already running are allowed to finish before the error is returned, so no thread is
//! ever left writing into a batch that has been abandoned.
//!
//! Results come back in input order regardless of completion order. An item whose work
//! returns an error (or panics) is logged and left as `None`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, unbounded};
use tracing::{debug, warn};

use crate::memory::MemoryGuard;
use crate::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

// (position in batch, outcome) sent back by each job.
type Completion<R> = (usize, thread::Result<Result<R>>);

pub struct WorkerPool {
    job_tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size())
            .finish()
    }
}

impl WorkerPool {
    /// Spawn `size` worker threads (at least one).
    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(1);
        let (job_tx, job_rx) = unbounded::<Job>();

        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            let rx = job_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("featstage-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })?;
            handles.push(handle);
        }

        debug!(workers = size, "worker pool started");
        Ok(Self {
            job_tx: Some(job_tx),
            handles,
        })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Run `work` over every item and collect the results in input order.
    ///
    /// `on_complete(done, total)` is called after each item finishes, successful or not.
    /// If the memory guard trips, no further items are dispatched; in-flight items are
    /// drained and the guard's error is returned.
    pub fn run_batch<T, R, F>(
        &self,
        items: Vec<T>,
        work: Arc<F>,
        guard: &MemoryGuard,
        mut on_complete: impl FnMut(usize, usize),
    ) -> Result<Vec<Option<R>>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Result<R> + Send + Sync + 'static,
    {
        let total = items.len();
        let mut results: Vec<Option<R>> = Vec::with_capacity(total);
        results.resize_with(total, || None);
        if total == 0 {
            return Ok(results);
        }

        let job_tx = self
            .job_tx
            .as_ref()
            .ok_or_else(|| Error::msg("worker pool is shut down"))?;
        let (done_tx, done_rx) = unbounded::<Completion<R>>();

        let mut pending = items.into_iter().enumerate();
        let mut in_flight = 0usize;

        for (pos, item) in pending.by_ref().take(self.size()) {
            submit(job_tx, &done_tx, &work, pos, item)?;
            in_flight += 1;
        }

        let mut done = 0usize;
        let mut tripped: Option<Error> = None;

        while in_flight > 0 {
            let (pos, outcome) = done_rx
                .recv()
                .map_err(|_| Error::msg("worker pool disconnected"))?;
            in_flight -= 1;
            done += 1;

            match outcome {
                Ok(Ok(value)) => results[pos] = Some(value),
                Ok(Err(err)) => warn!(item = pos, error = %err, "skipping item"),
                Err(_) => warn!(item = pos, "worker panicked; skipping item"),
            }
            on_complete(done, total);

            if tripped.is_some() {
                continue;
            }
            if let Err(err) = guard.check() {
                debug!(in_flight, "memory guard tripped; draining in-flight items");
                tripped = Some(err);
                continue;
            }
            if let Some((pos, item)) = pending.next() {
                submit(job_tx, &done_tx, &work, pos, item)?;
                in_flight += 1;
            }
        }

        match tripped {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }
}

fn submit<T, R, F>(
    job_tx: &Sender<Job>,
    done_tx: &Sender<Completion<R>>,
    work: &Arc<F>,
    pos: usize,
    item: T,
) -> Result<()>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Result<R> + Send + Sync + 'static,
{
    let work = Arc::clone(work);
    let done_tx = done_tx.clone();
    let job: Job = Box::new(move || {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(item)));
        // Receiver gone means the batch was abandoned.
        let _ = done_tx.send((pos, outcome));
    });

    job_tx
        .send(job)
        .map_err(|_| Error::msg("worker pool threads have exited"))
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel ends each worker's recv loop.
        self.job_tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FixedMemory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn healthy() -> MemoryGuard {
        MemoryGuard::new(Arc::new(FixedMemory(50.0)), 10.0)
    }

    #[test]
    fn results_keep_input_order() -> anyhow::Result<()> {
        let pool = WorkerPool::new(4)?;
        let items: Vec<u64> = (0..12).collect();

        // Earlier items sleep longer so they finish last.
        let work = Arc::new(|i: u64| -> Result<u64> {
            thread::sleep(Duration::from_millis((12 - i) * 3));
            Ok(i * 2)
        });

        let results = pool.run_batch(items, work, &healthy(), |_, _| {})?;
        let expected: Vec<Option<u64>> = (0..12).map(|i| Some(i * 2)).collect();
        assert_eq!(results, expected);
        Ok(())
    }

    #[test]
    fn failed_and_panicking_items_are_skipped() -> anyhow::Result<()> {
        let pool = WorkerPool::new(2)?;
        let work = Arc::new(|i: usize| -> Result<usize> {
            match i {
                1 => Err(Error::msg("bad item")),
                2 => panic!("worker blew up"),
                _ => Ok(i),
            }
        });

        let results = pool.run_batch(vec![0, 1, 2, 3], work, &healthy(), |_, _| {})?;
        assert_eq!(results, vec![Some(0), None, None, Some(3)]);

        // Pool is still usable after a panic.
        let identity = Arc::new(|i: usize| -> Result<usize> { Ok(i) });
        let again = pool.run_batch(vec![5], identity, &healthy(), |_, _| {})?;
        assert_eq!(again, vec![Some(5)]);
        Ok(())
    }

    #[test]
    fn progress_reports_every_item() -> anyhow::Result<()> {
        let pool = WorkerPool::new(3)?;
        let mut seen = Vec::new();
        pool.run_batch(
            vec![1, 2, 3, 4, 5],
            Arc::new(|i: i32| -> Result<i32> { Ok(i) }),
            &healthy(),
            |done, total| seen.push((done, total)),
        )?;
        assert_eq!(seen, vec![(1, 5), (2, 5), (3, 5), (4, 5), (5, 5)]);
        Ok(())
    }

    #[test]
    fn tripped_guard_stops_dispatch_and_drains() -> anyhow::Result<()> {
        let pool = WorkerPool::new(2)?;
        let executed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&executed);
        let work = Arc::new(move |i: usize| -> Result<usize> {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            Ok(i)
        });

        let low = MemoryGuard::new(Arc::new(FixedMemory(9.0)), 10.0);
        let err = pool
            .run_batch((0..10).collect(), work, &low, |_, _| {})
            .unwrap_err();

        assert!(err.is_resource_exhausted());
        // Only the initial window was ever dispatched.
        assert_eq!(executed.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn guard_just_above_threshold_lets_batch_finish() -> anyhow::Result<()> {
        let pool = WorkerPool::new(2)?;
        let guard = MemoryGuard::new(Arc::new(FixedMemory(11.0)), 10.0);
        let identity = Arc::new(|i: usize| -> Result<usize> { Ok(i) });
        let results = pool.run_batch((0..6).collect(), identity, &guard, |_, _| {})?;
        assert!(results.iter().all(Option::is_some));
        Ok(())
    }

    #[test]
    fn empty_batch_is_a_no_op() -> anyhow::Result<()> {
        let pool = WorkerPool::new(1)?;
        let identity = Arc::new(|i: u8| -> Result<u8> { Ok(i) });
        let results = pool.run_batch(Vec::<u8>::new(), identity, &healthy(), |_, _| {})?;
        assert!(results.is_empty());
        Ok(())
    }
}
