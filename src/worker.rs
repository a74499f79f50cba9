//! # Prefetch Worker
//!
//! Background loop that keeps the [`PrefetchQueue`] topped up: it asks the
//! recommender for the next song, fetches it, and offers the result to the
//! queue. A full queue blocks the loop, which is the only back-pressure.
//!
//! ## States
//!
//! ```text
//!            start               pause
//! Stopped ---------> Running <---------> Paused
//!    ^                  |       resume
//!    |     shutdown     |
//!    +------------------+
//! ```
//!
//! Pausing never interrupts a cycle in flight; the loop notices at the top of
//! its next cycle and parks on a condition variable. Shutdown is terminal.
//!
//! A panicking recommender or fetcher is treated like a failed fetch: the
//! cycle is logged and skipped, and the loop carries on.

use crate::queue::{PrefetchQueue, QueueClosed};
use crate::fetcher::SongFetcher;
use crate::recommender::RecommenderSystem;
use crate::scheduler::{Lease, Scheduler};
use crate::slot::Slot;
use crate::song::{PlayListEntry, Song};
use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Running,
    Paused,
}

#[derive(Debug)]
struct Control {
    state: WorkerState,
    shutdown: bool,
    loop_alive: bool,
}

#[derive(Debug)]
struct Shared {
    control: Mutex<Control>,
    wake: Condvar,
    iterations: AtomicU64,
    loops_started: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park while paused. `false` once shutdown was requested.
    fn checkpoint(&self) -> bool {
        let mut control = self.lock();
        while control.state == WorkerState::Paused && !control.shutdown {
            control = self.wake.wait(control).unwrap_or_else(PoisonError::into_inner);
        }
        !control.shutdown
    }

    /// Nothing to fetch: wait out the backoff unless a state change comes first.
    fn idle(&self, backoff: Duration) {
        let control = self.lock();
        if control.state == WorkerState::Running && !control.shutdown {
            let _ = self
                .wake
                .wait_timeout(control, backoff)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn finish(&self) {
        let mut control = self.lock();
        control.loop_alive = false;
        control.state = WorkerState::Stopped;
        self.wake.notify_all();
    }
}

/// Handle to the prefetch loop. The loop itself runs on the [`Scheduler`].
pub struct PrefetchWorker {
    shared: Arc<Shared>,
    scheduler: Scheduler,
    lease: Mutex<Option<Lease>>,
    queue: Arc<PrefetchQueue>,
    fetcher: Arc<dyn SongFetcher>,
    recommender: Slot<dyn RecommenderSystem>,
    idle_backoff: Duration,
}

impl PrefetchWorker {
    /// A stopped worker. Nothing runs until [`start`](Self::start), but the
    /// scheduler thread for the loop is reserved right away.
    ///
    /// `recommender` is read on every cycle, so a recommender registered
    /// later is picked up by a running loop.
    ///
    /// # Errors
    ///
    /// Fails if `scheduler` has no free thread left.
    pub fn new(
        scheduler: Scheduler,
        queue: Arc<PrefetchQueue>,
        fetcher: Arc<dyn SongFetcher>,
        recommender: Slot<dyn RecommenderSystem>,
        idle_backoff: Duration,
    ) -> Result<Self> {
        let lease = scheduler.lease("prefetch worker")?;
        Ok(Self {
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state: WorkerState::Stopped,
                    shutdown: false,
                    loop_alive: false,
                }),
                wake: Condvar::new(),
                iterations: AtomicU64::new(0),
                loops_started: AtomicUsize::new(0),
            }),
            scheduler,
            lease: Mutex::new(Some(lease)),
            queue,
            fetcher,
            recommender,
            idle_backoff,
        })
    }

    /// The reserved thread, or a fresh one if an earlier loop used it up.
    fn take_lease(&self) -> Result<Lease> {
        let reserved = self.lease.lock().unwrap_or_else(PoisonError::into_inner).take();
        match reserved {
            Some(lease) => Ok(lease),
            None => self.scheduler.lease("prefetch worker"),
        }
    }

    /// Start the loop, or resume it if paused. No-op while running.
    pub fn start(&self) {
        let mut control = self.shared.lock();
        if control.shutdown {
            warn!("Prefetch worker was shut down, not restarting");
            return;
        }

        match control.state {
            WorkerState::Running => debug!("Prefetch worker already running"),
            WorkerState::Paused => {
                control.state = WorkerState::Running;
                self.shared.wake.notify_all();
                info!("Prefetch worker resumed");
            }
            WorkerState::Stopped => {
                let lease = match self.take_lease() {
                    Ok(lease) => lease,
                    Err(e) => {
                        error!("Cannot start prefetch worker: {e:#}");
                        return;
                    }
                };
                control.state = WorkerState::Running;
                control.loop_alive = true;
                drop(control);

                self.shared.loops_started.fetch_add(1, Ordering::SeqCst);
                let shared = Arc::clone(&self.shared);
                let queue = Arc::clone(&self.queue);
                let fetcher = Arc::clone(&self.fetcher);
                let recommender = self.recommender.clone();
                let backoff = self.idle_backoff;
                lease.spawn(move || run(&shared, &queue, fetcher.as_ref(), &recommender, backoff));
                info!("Prefetch worker started");
            }
        }
    }

    /// Let the current cycle finish, then park the loop.
    pub fn pause(&self) {
        let mut control = self.shared.lock();
        if control.state == WorkerState::Running {
            control.state = WorkerState::Paused;
            info!("Prefetch worker paused");
        }
    }

    pub fn resume(&self) {
        let mut control = self.shared.lock();
        if control.state == WorkerState::Paused && !control.shutdown {
            control.state = WorkerState::Running;
            self.shared.wake.notify_all();
            info!("Prefetch worker resumed");
        }
    }

    /// Ask the loop to exit and wait up to `timeout` for it.
    ///
    /// A loop blocked on a full queue only exits once the queue is polled or
    /// closed. Returns whether the loop is gone.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let mut control = self.shared.lock();
        control.shutdown = true;
        self.shared.wake.notify_all();
        self.lease.lock().unwrap_or_else(PoisonError::into_inner).take();

        let (mut control, _) = self
            .shared
            .wake
            .wait_timeout_while(control, timeout, |c| c.loop_alive)
            .unwrap_or_else(PoisonError::into_inner);

        if control.loop_alive {
            warn!("Prefetch worker did not stop within {timeout:?}");
            false
        } else {
            control.state = WorkerState::Stopped;
            true
        }
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.shared.lock().state
    }

    /// Recommendations pulled so far.
    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.shared.iterations.load(Ordering::SeqCst)
    }

    /// How many loops were ever spawned. Stays at one across pause/resume.
    #[must_use]
    pub fn loops_started(&self) -> usize {
        self.shared.loops_started.load(Ordering::SeqCst)
    }
}

fn run(
    shared: &Shared,
    queue: &PrefetchQueue,
    fetcher: &dyn SongFetcher,
    recommender: &Slot<dyn RecommenderSystem>,
    backoff: Duration,
) {
    while shared.checkpoint() {
        let Some(recommender) = recommender.get() else {
            shared.idle(backoff);
            continue;
        };

        let next = catch_unwind(AssertUnwindSafe(|| recommender.next_song()));
        shared.iterations.fetch_add(1, Ordering::SeqCst);
        let song = match next {
            Ok(Some(song)) => song,
            Ok(None) => {
                shared.idle(backoff);
                continue;
            }
            Err(_) => {
                error!("Recommender panicked, skipping this cycle");
                shared.idle(backoff);
                continue;
            }
        };

        match fetch_contained(fetcher, &song) {
            Ok(entry) => {
                debug!("Prefetched {entry}");
                if let Err(QueueClosed(entry)) = queue.offer(entry) {
                    debug!("Queue closed, dropping {entry}");
                    break;
                }
            }
            Err(e) => warn!("Failed to prefetch {song}: {e:#}"),
        }
    }

    shared.finish();
    info!("Prefetch worker stopped");
}

fn fetch_contained(fetcher: &dyn SongFetcher, song: &Song) -> Result<PlayListEntry> {
    catch_unwind(AssertUnwindSafe(|| fetcher.fetch(song)))
        .unwrap_or_else(|_| Err(anyhow!("fetcher panicked")))
}
