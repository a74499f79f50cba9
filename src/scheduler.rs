//! Shared pool of background threads.
//!
//! A node runs a handful of long-lived loops (prefetch worker, tag consensus,
//! UI notification). They share one small rayon pool that is created by the
//! caller and handed to each component, instead of living in a process-wide
//! global.
//!
//! A loop holds its pool thread for as long as it runs, so every loop first
//! takes a [`Lease`] on one thread. Leasing fails once all threads are taken,
//! which lets a node refuse to start rather than queue a loop that would
//! never get a thread.

use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Long-lived loops a single node keeps on the pool at the same time.
pub const LONG_RUNNING_TASKS: usize = 3;

/// Default pool size: the long-running loops of one node plus one spare.
pub const DEFAULT_THREADS: usize = LONG_RUNNING_TASKS + 1;

/// Cheap, clonable handle to the pool.
#[derive(Debug, Clone)]
pub struct Scheduler {
    pool: Arc<rayon::ThreadPool>,
    leased: Arc<AtomicUsize>,
}

impl Scheduler {
    /// Pool with `threads` workers, never fewer than [`DEFAULT_THREADS`].
    ///
    /// # Errors
    ///
    /// Fails if the OS refuses to spawn the threads.
    pub fn new(threads: usize) -> Result<Self> {
        let threads = threads.max(DEFAULT_THREADS);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("songmesh-{i}"))
            .panic_handler(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::error!("Background task panicked: {message}");
            })
            .build()
            .context("Failed to build background thread pool")?;

        log::debug!("Started scheduler with {threads} threads");
        Ok(Self {
            pool: Arc::new(pool),
            leased: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Reserve one pool thread for the loop called `name`.
    ///
    /// # Errors
    ///
    /// Fails when every thread is already leased.
    pub fn lease(&self, name: &str) -> Result<Lease> {
        let threads = self.threads();
        let taken = self
            .leased
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |leased| {
                (leased < threads).then_some(leased + 1)
            });

        match taken {
            Ok(leased) => {
                log::debug!("Leased thread {}/{threads} for {name}", leased + 1);
                Ok(Lease {
                    pool: Arc::clone(&self.pool),
                    leased: Arc::clone(&self.leased),
                    name: name.to_string(),
                })
            }
            Err(_) => bail!("No free scheduler thread for {name}: all {threads} are in use"),
        }
    }

    #[must_use]
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Threads not held by a [`Lease`].
    #[must_use]
    pub fn free_threads(&self) -> usize {
        self.threads().saturating_sub(self.leased.load(Ordering::SeqCst))
    }
}

/// One pool thread reserved for a long-running loop. The thread is given
/// back when the lease is dropped, which [`spawn`](Self::spawn) does once
/// the loop returns or panics.
#[derive(Debug)]
pub struct Lease {
    pool: Arc<rayon::ThreadPool>,
    leased: Arc<AtomicUsize>,
    name: String,
}

impl Lease {
    /// Run `task` on the leased thread. Returns immediately.
    pub fn spawn<F>(self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        pool.spawn(move || {
            let _lease = self;
            task();
        });
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.leased.fetch_sub(1, Ordering::SeqCst);
        log::debug!("Released scheduler thread of {}", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_pool_has_room_for_long_running_loops() {
        let scheduler = Scheduler::new(1).unwrap();
        assert_eq!(scheduler.threads(), DEFAULT_THREADS);
        assert_eq!(scheduler.free_threads(), DEFAULT_THREADS);
    }

    #[test]
    fn test_spawned_tasks_run() {
        let scheduler = Scheduler::new(4).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            scheduler.lease("test").unwrap().spawn(move || tx.send(i).unwrap());
            assert!(wait_for(|| scheduler.free_threads() == 4));
        }

        let mut got: Vec<i32> = (0..8)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_lease_fails_when_pool_is_full() {
        let scheduler = Scheduler::new(4).unwrap();
        let leases: Vec<Lease> = (0..4).map(|i| scheduler.lease(&format!("loop {i}")).unwrap()).collect();
        assert_eq!(scheduler.free_threads(), 0);
        assert!(scheduler.lease("one too many").is_err());

        drop(leases);
        assert_eq!(scheduler.free_threads(), 4);
        assert!(scheduler.lease("again").is_ok());
    }

    #[test]
    fn test_panicking_task_releases_its_thread() {
        let scheduler = Scheduler::new(4).unwrap();
        scheduler.lease("doomed").unwrap().spawn(|| panic!("boom"));
        assert!(wait_for(|| scheduler.free_threads() == 4));

        let (tx, rx) = mpsc::channel();
        scheduler.lease("after").unwrap().spawn(move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
