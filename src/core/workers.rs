//! Background pool for raster work (LOD renders, warps).
//!
//! Jobs enter a shared injector; each worker pulls batches into its own
//! FIFO deque and steals from siblings when both run dry. Idle workers park
//! and are woken round-robin on submission, so an idle pool costs nothing.
//!
//! Every job is tagged with the epoch current at submission. Bumping the
//! epoch (renderer reset, fragment set replaced) turns queued jobs into
//! no-ops without draining the queues.

use crossbeam::deque::{Injector, Stealer, Worker};
use crossbeam::sync::{Parker, Unparker};
use log::{error, trace};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Upper bound on a park; covers a wake-up racing the park call
const PARK_TIMEOUT: Duration = Duration::from_millis(20);
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Counters shared by the pool and its threads.
#[derive(Debug, Default)]
pub struct PoolStats {
    queued: AtomicUsize,
    executed: AtomicU64,
    skipped_stale: AtomicU64,
}

impl PoolStats {
    /// Jobs submitted and not yet finished (running ones included).
    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn skipped_stale(&self) -> u64 {
        self.skipped_stale.load(Ordering::Relaxed)
    }
}

struct Shared {
    injector: Injector<Job>,
    stealers: Vec<Stealer<Job>>,
    shutdown: AtomicBool,
    stats: PoolStats,
}

impl Shared {
    fn find_job(&self, local: &Worker<Job>) -> Option<Job> {
        local.pop().or_else(|| {
            std::iter::repeat_with(|| {
                self.injector
                    .steal_batch_and_pop(local)
                    .or_else(|| self.stealers.iter().map(|s| s.steal()).collect())
            })
            .find(|s| !s.is_retry())
            .and_then(|s| s.success())
        })
    }

    fn run(&self, job: Job) {
        job();
        self.stats.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Epoch-aware worker pool.
///
/// ```ignore
/// let workers = Workers::new(4, Arc::new(AtomicU64::new(0)));
/// let epoch = workers.current_epoch();
/// workers.execute_with_epoch(epoch, move || {
///     tx.send(job.run()).ok();
/// });
/// ```
pub struct Workers {
    shared: Arc<Shared>,
    unparkers: Vec<Unparker>,
    next_wake: AtomicUsize,
    handles: Vec<thread::JoinHandle<()>>,
    epoch: Arc<AtomicU64>,
}

impl Workers {
    /// Start `num_threads` workers (at least one) sharing `epoch`.
    ///
    /// A thread that fails to spawn is logged and skipped.
    pub fn new(num_threads: usize, epoch: Arc<AtomicU64>) -> Self {
        let locals: Vec<Worker<Job>> = (0..num_threads.max(1)).map(|_| Worker::new_fifo()).collect();
        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers: locals.iter().map(|w| w.stealer()).collect(),
            shutdown: AtomicBool::new(false),
            stats: PoolStats::default(),
        });

        let mut unparkers = Vec::with_capacity(locals.len());
        let mut handles = Vec::with_capacity(locals.len());
        for (index, local) in locals.into_iter().enumerate() {
            let parker = Parker::new();
            let unparker = parker.unparker().clone();
            let shared = Arc::clone(&shared);

            let spawned = thread::Builder::new()
                .name(format!("tessera-worker-{}", index))
                .spawn(move || {
                    trace!("Worker {} started", index);
                    loop {
                        if let Some(job) = shared.find_job(&local) {
                            shared.run(job);
                            continue;
                        }
                        if shared.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        parker.park_timeout(PARK_TIMEOUT);
                    }
                    trace!("Worker {} stopped", index);
                });

            match spawned {
                Ok(handle) => {
                    handles.push(handle);
                    unparkers.push(unparker);
                }
                Err(e) => error!("Failed to spawn worker thread {}: {}", index, e),
            }
        }
        trace!("Workers initialized: {} threads", handles.len());

        Self {
            shared,
            unparkers,
            next_wake: AtomicUsize::new(0),
            handles,
            epoch,
        }
    }

    pub fn num_threads(&self) -> usize {
        self.handles.len()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.shared.stats
    }

    fn submit(&self, job: Job) {
        self.shared.stats.queued.fetch_add(1, Ordering::AcqRel);
        self.shared.injector.push(job);
        if !self.unparkers.is_empty() {
            let i = self.next_wake.fetch_add(1, Ordering::Relaxed) % self.unparkers.len();
            self.unparkers[i].unpark();
        }
    }

    /// Run `f` on a worker regardless of epoch.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.submit(Box::new(move || {
            f();
            shared.stats.executed.fetch_add(1, Ordering::Relaxed);
        }));
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Invalidate every job queued with an older epoch. Returns the new epoch.
    pub fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Run `f` only if `epoch` is still current when a worker picks it up.
    pub fn execute_with_epoch<F>(&self, epoch: u64, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let current = Arc::clone(&self.epoch);
        let shared = Arc::clone(&self.shared);
        self.submit(Box::new(move || {
            if current.load(Ordering::Acquire) == epoch {
                f();
                shared.stats.executed.fetch_add(1, Ordering::Relaxed);
            } else {
                shared.stats.skipped_stale.fetch_add(1, Ordering::Relaxed);
                trace!("Skipping stale job (epoch {})", epoch);
            }
        }));
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        for unparker in &self.unparkers {
            unparker.unpark();
        }

        // Threads still busy past the grace period die with the process
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        for handle in std::mem::take(&mut self.handles) {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Workers: shutdown grace period exceeded");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
        trace!("Workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_runs_jobs() {
        let workers = Workers::new(3, Arc::new(AtomicU64::new(0)));
        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..32 {
            let tx = tx.clone();
            workers.execute(move || {
                tx.send(i).ok();
            });
        }
        let mut got: Vec<i32> = (0..32)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort();
        assert_eq!(got, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_stale_epoch_skipped_and_counted() {
        let workers = Workers::new(1, Arc::new(AtomicU64::new(0)));
        let (tx, rx) = crossbeam_channel::unbounded();

        // Hold the only worker so the next jobs stay queued
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        workers.execute(move || {
            gate_rx.recv_timeout(Duration::from_secs(5)).ok();
        });
        let stale = workers.current_epoch();
        let tx1 = tx.clone();
        workers.execute_with_epoch(stale, move || {
            tx1.send("stale").ok();
        });
        assert_eq!(workers.bump_epoch(), stale + 1);
        workers.execute_with_epoch(stale + 1, move || {
            tx.send("fresh").ok();
        });
        assert_eq!(workers.stats().pending(), 3);
        gate_tx.send(()).ok();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "fresh");
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        wait_drained(&workers);
        assert_eq!(workers.stats().skipped_stale(), 1);
        assert_eq!(workers.stats().executed(), 2);
    }

    fn wait_drained(workers: &Workers) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while workers.stats().pending() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_pending_drains_to_zero() {
        let workers = Workers::new(2, Arc::new(AtomicU64::new(0)));
        assert_eq!(workers.num_threads(), 2);
        for _ in 0..16 {
            workers.execute(|| thread::sleep(Duration::from_millis(1)));
        }
        wait_drained(&workers);
        assert_eq!(workers.stats().pending(), 0);
        assert_eq!(workers.stats().executed(), 16);
    }

    #[test]
    fn test_idle_pool_wakes_on_submit() {
        let workers = Workers::new(2, Arc::new(AtomicU64::new(0)));
        // Let both threads park
        thread::sleep(Duration::from_millis(50));
        let (tx, rx) = crossbeam_channel::unbounded();
        workers.execute(move || {
            tx.send(()).ok();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
