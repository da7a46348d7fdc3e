//! The time keeper: one worker thread servicing a deadline queue.
//!
//! Callbacks are either *fast* (run inline on the worker thread, must not
//! block) or *slow* (dispatched to a background pool; a recurring slow
//! timer is re-armed only after the callback returns, so overlapping
//! executions are impossible). Precision is best-effort; users should
//! assume tens of milliseconds of granularity.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::pool::WorkerPool;

/// Upper bound for the idle wait; merely a safety net against lost
/// notifications.
const IDLE_WAIT: Duration = Duration::from_secs(100);

type Callback = Arc<dyn Fn() + Send + Sync>;

struct TimerCore {
    cb: Option<Callback>,
    cancelled: bool,
    expires_at: Instant,
}

struct TimerEntry {
    core: Mutex<TimerCore>,
    interval: Option<Duration>,
    slow: bool,
}

/// Handle returned by [`TimeKeeper::add_timer`], used for cancellation.
#[derive(Clone)]
pub struct TimerId(Arc<TimerEntry>);

impl fmt::Debug for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerId").finish_non_exhaustive()
    }
}

struct QueuedTimer {
    at: Instant,
    entry: Arc<TimerEntry>,
}

// Min-heap on `at`.
impl Ord for QueuedTimer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.at.cmp(&self.at)
    }
}

impl PartialOrd for QueuedTimer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedTimer {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}

impl Eq for QueuedTimer {}

/// Process-wide timer service.
///
/// Obtained via [`TimeKeeper::instance`]. During shutdown the time keeper
/// is stopped *last*: descriptors and hazptr domains keep timers alive
/// until they are gone themselves.
pub struct TimeKeeper {
    timers: Mutex<BinaryHeap<QueuedTimer>>,
    cv: Condvar,
    exited: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    background: WorkerPool,
}

impl TimeKeeper {
    /// The process-wide instance, started on first use.
    pub fn instance() -> &'static TimeKeeper {
        static INSTANCE: OnceLock<TimeKeeper> = OnceLock::new();
        INSTANCE.get_or_init(|| {
            let tk = TimeKeeper {
                timers: Mutex::new(BinaryHeap::new()),
                cv: Condvar::new(),
                exited: AtomicBool::new(false),
                worker: Mutex::new(None),
                background: WorkerPool::new("evio-timekeeper-bg", 2),
            };
            let handle = std::thread::Builder::new()
                .name("evio-timekeeper".to_string())
                .spawn(|| TimeKeeper::instance().worker_proc())
                .expect("failed to spawn time keeper");
            *tk.worker.lock().unwrap() = Some(handle);
            tk
        })
    }

    /// Adds a timer firing at `expires_at` and then every `interval` (or
    /// once, when `interval` is `None`). Slow callbacks run on the
    /// background pool.
    ///
    /// Returns `None` if the time keeper has been stopped.
    pub fn add_timer<F>(
        &self,
        expires_at: Instant,
        interval: Option<Duration>,
        slow: bool,
        cb: F,
    ) -> Option<TimerId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.exited.load(Ordering::Relaxed) {
            return None;
        }
        let entry = Arc::new(TimerEntry {
            core: Mutex::new(TimerCore {
                cb: Some(Arc::new(cb)),
                cancelled: false,
                expires_at: expires_at.max(Instant::now()),
            }),
            interval,
            slow,
        });
        let at = entry.core.lock().unwrap().expires_at;
        let mut timers = self.timers.lock().unwrap();
        timers.push(QueuedTimer {
            at,
            entry: Arc::clone(&entry),
        });
        drop(timers);
        // Always wake the worker; performance does not matter here.
        self.cv.notify_all();
        Some(TimerId(entry))
    }

    /// Cancels a timer. Cancellation is coupled with the callback lock: a
    /// timer that has been cancelled does not fire afterwards.
    pub fn kill_timer(&self, id: &TimerId) {
        let mut core = id.0.core.lock().unwrap();
        core.cb = None;
        core.cancelled = true;
    }

    /// Asks the worker to exit. Pending slow callbacks are drained.
    pub fn stop(&self) {
        self.exited.store(true, Ordering::Relaxed);
        let _lock = self.timers.lock().unwrap();
        self.cv.notify_all();
        self.background.stop();
    }

    /// Waits for the worker and the background pool to finish.
    pub fn join(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.background.join();
    }

    fn worker_proc(&self) {
        while !self.exited.load(Ordering::Relaxed) {
            let mut timers = self.timers.lock().unwrap();
            let now = Instant::now();
            let due = timers.peek().map_or(false, |q| q.at <= now);
            if !due {
                let wait = timers
                    .peek()
                    .map(|q| q.at.saturating_duration_since(now))
                    .unwrap_or(IDLE_WAIT);
                let (guard, _) = self.cv.wait_timeout(timers, wait).unwrap();
                timers = guard;
                if self.exited.load(Ordering::Relaxed) {
                    break;
                }
                let now = Instant::now();
                if !timers.peek().map_or(false, |q| q.at <= now) {
                    continue;
                }
            }
            let queued = timers.pop().unwrap();
            drop(timers);
            if queued.entry.slow {
                self.fire_slow_timer(queued.entry);
            } else {
                self.fire_fast_timer(queued.entry);
            }
        }
    }

    fn fire_fast_timer(&self, entry: Arc<TimerEntry>) {
        let cb = {
            let core = entry.core.lock().unwrap();
            if core.cancelled {
                return;
            }
            core.cb.clone().expect("live timer without callback")
        };
        cb();
        self.rearm(entry);
    }

    fn fire_slow_timer(&self, entry: Arc<TimerEntry>) {
        self.background.spawn(move || {
            let cb = {
                let core = entry.core.lock().unwrap();
                if core.cancelled {
                    return;
                }
                core.cb.clone().expect("live timer without callback")
            };
            cb();
            // Re-arming only after the callback has returned serializes
            // overlapping executions.
            TimeKeeper::instance().rearm(entry);
        });
    }

    fn rearm(&self, entry: Arc<TimerEntry>) {
        let Some(interval) = entry.interval else {
            let mut core = entry.core.lock().unwrap();
            core.cancelled = true;
            core.cb = None;
            return;
        };
        let at = {
            let mut core = entry.core.lock().unwrap();
            if core.cancelled {
                return;
            }
            core.expires_at += interval;
            core.expires_at
        };
        let mut timers = self.timers.lock().unwrap();
        timers.push(QueuedTimer { at, entry });
        drop(timers);
        self.cv.notify_all();
    }
}

impl fmt::Debug for TimeKeeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeKeeper").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn one_shot_fires_once() {
        let (tx, rx) = mpsc::channel();
        let id = TimeKeeper::instance()
            .add_timer(
                Instant::now() + Duration::from_millis(20),
                None,
                false,
                move || {
                    tx.send(Instant::now()).unwrap();
                },
            )
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // One-shot: nothing more arrives.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(id);
    }

    #[test]
    fn recurring_fires_repeatedly() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let id = TimeKeeper::instance()
            .add_timer(
                Instant::now(),
                Some(Duration::from_millis(10)),
                false,
                move || {
                    fired2.fetch_add(1, Ordering::Relaxed);
                },
            )
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while fired.load(Ordering::Relaxed) < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(fired.load(Ordering::Relaxed) >= 5);
        TimeKeeper::instance().kill_timer(&id);
        let stopped_at = fired.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(100));
        // A cancelled timer does not fire again. One already-running
        // callback may still land.
        assert!(fired.load(Ordering::Relaxed) <= stopped_at + 1);
    }

    #[test]
    fn cancelled_before_expiry_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let id = TimeKeeper::instance()
            .add_timer(
                Instant::now() + Duration::from_millis(100),
                None,
                false,
                move || {
                    fired2.fetch_add(1, Ordering::Relaxed);
                },
            )
            .unwrap();
        TimeKeeper::instance().kill_timer(&id);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn slow_timer_runs_on_background_pool() {
        let (tx, rx) = mpsc::channel();
        let worker = std::thread::current().id();
        TimeKeeper::instance()
            .add_timer(Instant::now(), None, true, move || {
                tx.send(std::thread::current().id()).unwrap();
            })
            .unwrap();
        let id = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(id, worker);
    }
}
