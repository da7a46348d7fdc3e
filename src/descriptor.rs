//! The per-descriptor event state machine.
//!
//! A [`Descriptor`] multiplexes readable / writable / error events onto
//! the callbacks of a [`Pollable`] with at most one in-flight callback per
//! direction, supports suppress / restart (including delayed restart) and
//! delivers exactly one cleanup after [`kill`].
//!
//! [`kill`]: Descriptor::kill

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use log::trace;

use crate::barrier::memory_barrier;
use crate::event_loop::EventLoop;
use crate::sys::socket;
use crate::timer::TimeKeeper;
use crate::{Interest, Token};

pub(crate) const READ_BIT: u8 = 0b001;
pub(crate) const WRITE_BIT: u8 = 0b010;
pub(crate) const ERROR_BIT: u8 = 0b100;

/// Returned by [`Pollable::on_readable`] / [`Pollable::on_writable`] to
/// tell the framework what has been done, or what should be done next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventAction {
    /// No special action. The implementation MUST have drained the
    /// system's buffer before returning this.
    Ready,

    /// The descriptor killed itself in the callback.
    Leaving,

    /// Suppress this event until `restart_read_in` / `restart_write_in`
    /// re-enables it.
    Suppress,
}

/// Why a descriptor is being cleaned up. The first `kill` wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CleanupReason {
    /// Placeholder, never delivered to `on_cleanup`.
    None = 0,
    HandshakeFailed,
    /// The peer closed the connection cleanly.
    Disconnect,
    /// Explicit `stop()`.
    UserInitiated,
    /// Loop-wide shutdown.
    Closing,
    /// I/O or protocol error.
    Error,
}

impl CleanupReason {
    fn from_u8(value: u8) -> CleanupReason {
        match value {
            0 => CleanupReason::None,
            1 => CleanupReason::HandshakeFailed,
            2 => CleanupReason::Disconnect,
            3 => CleanupReason::UserInitiated,
            4 => CleanupReason::Closing,
            5 => CleanupReason::Error,
            _ => unreachable!("invalid cleanup reason {}", value),
        }
    }
}

/// Capability set implemented by concrete descriptors (stream connection,
/// datagram transceiver, acceptor, ...).
///
/// Callbacks run on the worker pool. `on_readable` and `on_writable` for
/// the same descriptor may run concurrently with each other, but never two
/// of the same direction.
pub trait Pollable: Send + Sync {
    /// The embedded descriptor core.
    fn descriptor(&self) -> &Descriptor;

    /// There is something to read.
    fn on_readable(&self) -> EventAction;

    /// There is buffer space for writing.
    fn on_writable(&self) -> EventAction;

    /// An error happened. The implementation should call
    /// [`Descriptor::kill`] with [`CleanupReason::Error`].
    fn on_error(&self, err: io::Error);

    /// The descriptor is quiescent: it has been removed from the event
    /// loop and no callback is running or will run. Called exactly once.
    fn on_cleanup(&self, reason: CleanupReason);
}

struct SeldomlyUsed {
    name: String,

    cleanup_queued: AtomicBool,

    // Incremented whenever an error event is seen.
    //
    // FIXME: Can we really see more than one error event in practice?
    error_events: AtomicUsize,
    error_seen: AtomicBool, // Latch against multiple error events.

    // Set once a cleanup is pending. If multiple events trigger cleanup
    // concurrently, the first one wins.
    cleanup_reason: AtomicU8,

    // For `wait_for_cleanup`.
    cleanup_done: Mutex<bool>,
    cleanup_cv: Condvar,
}

/// State machine mediating one file descriptor's events.
///
/// Reference counting is expressed through the owning `Arc<dyn Pollable>`:
/// the event loop, in-flight workers and posted tasks each hold a clone,
/// so the concrete descriptor outlives every callback.
pub struct Descriptor {
    // Number of readable / writable events not yet acknowledged by a
    // `Ready` return. Accessed on the hottest path.
    read_events: AtomicUsize,
    write_events: AtomicUsize,

    // Set once the descriptor has been disabled by `kill`'s loop task.
    cleanup_pending: AtomicBool,

    // Difference between `restart_*` calls and `Suppress` returns. This is
    // what allows a restart to be issued before the matching suppress has
    // been processed. Starts at 1 for each direction that is armed.
    restart_read_count: AtomicUsize,
    restart_write_count: AtomicUsize,

    fd: OwnedFd,
    event_loop: OnceLock<Arc<EventLoop>>,
    // Only touched on the owning loop's thread.
    event_mask: AtomicU8,
    enabled: AtomicBool,

    watcher: OnceLock<Weak<dyn Pollable>>,

    seldomly_used: SeldomlyUsed,
}

impl Descriptor {
    /// Creates a descriptor for `fd` with the given initial events armed.
    /// `name` shows up in log lines.
    pub fn new(fd: OwnedFd, events: Interest, name: impl Into<String>) -> Descriptor {
        let mut mask = 0;
        if events.is_readable() {
            mask |= READ_BIT;
        }
        if events.is_writable() {
            mask |= WRITE_BIT;
        }
        Descriptor {
            read_events: AtomicUsize::new(0),
            write_events: AtomicUsize::new(0),
            cleanup_pending: AtomicBool::new(false),
            restart_read_count: AtomicUsize::new(usize::from(mask & READ_BIT != 0)),
            restart_write_count: AtomicUsize::new(usize::from(mask & WRITE_BIT != 0)),
            fd,
            event_loop: OnceLock::new(),
            event_mask: AtomicU8::new(mask),
            enabled: AtomicBool::new(false),
            watcher: OnceLock::new(),
            seldomly_used: SeldomlyUsed {
                name: name.into(),
                cleanup_queued: AtomicBool::new(false),
                error_events: AtomicUsize::new(0),
                error_seen: AtomicBool::new(false),
                cleanup_reason: AtomicU8::new(CleanupReason::None as u8),
                cleanup_done: Mutex::new(false),
                cleanup_cv: Condvar::new(),
            },
        }
    }

    /// Binds the concrete descriptor this core dispatches to. Must be
    /// called exactly once, before the descriptor is attached to a loop.
    pub fn bind(&self, watcher: Weak<dyn Pollable>) {
        if self.watcher.set(watcher).is_err() {
            panic!("descriptor {} bound twice", self.name());
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.fd() as usize)
    }

    pub(crate) fn name(&self) -> &str {
        &self.seldomly_used.name
    }

    /// The event loop this descriptor is attached to.
    pub fn event_loop(&self) -> Option<&Arc<EventLoop>> {
        self.event_loop.get()
    }

    /// Prevents further events and schedules cleanup. Idempotent; the
    /// first caller's `reason` is delivered to `on_cleanup`.
    pub fn kill(&self, reason: CleanupReason) {
        assert!(reason != CleanupReason::None);
        if self
            .seldomly_used
            .cleanup_reason
            .compare_exchange(
                CleanupReason::None as u8,
                reason as u8,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            let watcher = self.watcher();
            self.ev().add_task(move || {
                let desc = watcher.descriptor();
                desc.ev().disable_descriptor(desc);
                desc.cleanup_pending.store(true, Ordering::Relaxed);
                // From now on no more events will be fired.

                desc.queue_cleanup_callback_check();
            });
        }
    }

    /// The reason set by the first `kill`, or `None` when alive.
    pub fn cleanup_reason(&self) -> CleanupReason {
        CleanupReason::from_u8(self.seldomly_used.cleanup_reason.load(Ordering::Relaxed))
    }

    /// Re-enables read events suppressed by an `EventAction::Suppress`
    /// return. Safe to call from any thread, including before the
    /// suppressing callback has returned (the suppression is then
    /// cancelled out).
    pub fn restart_read_in(&self, after: Duration) {
        if after.is_zero() {
            self.restart_read_now();
        } else {
            // The captured reference keeps us alive until the timer fires.
            let watcher = self.watcher();
            TimeKeeper::instance().add_timer(Instant::now() + after, None, false, move || {
                watcher.descriptor().restart_read_now();
            });
        }
    }

    /// Write-side counterpart of `restart_read_in`.
    pub fn restart_write_in(&self, after: Duration) {
        if after.is_zero() {
            self.restart_write_now();
        } else {
            let watcher = self.watcher();
            TimeKeeper::instance().add_timer(Instant::now() + after, None, false, move || {
                watcher.descriptor().restart_write_now();
            });
        }
    }

    /// Blocks until `on_cleanup` has returned. `kill` must have been
    /// called.
    pub fn wait_for_cleanup(&self) {
        let mut done = self.seldomly_used.cleanup_done.lock().unwrap();
        while !*done {
            done = self.seldomly_used.cleanup_cv.wait(done).unwrap();
        }
    }

    pub(crate) fn set_event_loop(&self, ev: Arc<EventLoop>) {
        if self.event_loop.set(ev).is_err() {
            panic!("descriptor {} attached twice", self.name());
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn event_mask(&self) -> u8 {
        self.event_mask.load(Ordering::Relaxed)
    }

    pub(crate) fn set_event_mask(&self, mask: u8) {
        self.event_mask.store(mask, Ordering::Relaxed);
    }

    pub(crate) fn interest(&self) -> Option<Interest> {
        let mask = self.event_mask();
        let mut bits = 0;
        if mask & READ_BIT != 0 {
            bits |= Interest::READABLE.bits();
        }
        if mask & WRITE_BIT != 0 {
            bits |= Interest::WRITABLE.bits();
        }
        Interest::from_bits(bits)
    }

    /// Dispatches the events in `mask`, spawning per-direction workers as
    /// needed. Runs on the loop thread.
    pub(crate) fn fire_events(&self, mask: u8) {
        if mask & ERROR_BIT != 0 {
            // Errors are handled first and exclusively; reading from or
            // writing to a descriptor in error state is pointless.
            self.fire_error_event();
            return;
        }
        if mask & READ_BIT != 0 {
            self.fire_read_event();
        }
        if mask & WRITE_BIT != 0 {
            self.fire_write_event();
        }
    }

    fn fire_read_event(&self) {
        // The acquire pairs with the releasing decrement at the end of a
        // prior callback run, making its effects visible to this worker.
        if self.read_events.fetch_add(1, Ordering::Acquire) == 0 {
            // `read_events` was 0, so no worker is calling `on_readable`.
            // Spawn one.
            //
            // The worker holds its own reference: cleanup only waits for
            // the event counters to reach zero, so without it the
            // descriptor could be destroyed between our final decrement
            // and leaving the closure.
            let watcher = self.watcher();
            self.ev().pool().spawn(move || {
                let desc = watcher.descriptor();
                loop {
                    match watcher.on_readable() {
                        EventAction::Ready => {
                            // Loop until the counter is drained; if more
                            // data arrived while `on_readable` ran, the
                            // counter is above one and we go again.
                            if desc.read_events.fetch_sub(1, Ordering::Release) == 1 {
                                break;
                            }
                        }
                        EventAction::Leaving => {
                            debug_assert!(
                                desc.cleanup_reason() != CleanupReason::None,
                                "descriptor {} returned Leaving without kill()",
                                desc.name()
                            );
                            // The counter may only be reset in loop
                            // context: by the time the task runs, the
                            // descriptor has been disabled and nothing
                            // increments it anymore.
                            let watcher = Arc::clone(&watcher);
                            desc.ev().add_task(move || {
                                let desc = watcher.descriptor();
                                desc.read_events.store(0, Ordering::Relaxed);
                                desc.queue_cleanup_callback_check();
                            });
                            break;
                        }
                        EventAction::Suppress => {
                            // We leave with `read_events` non-zero; the
                            // suppress task resets it in loop context.
                            desc.suppress_read_and_clear_count();
                            break;
                        }
                    }
                }
                desc.queue_cleanup_callback_check();
            });
        } // Otherwise a worker is already running and will observe the
          // increment through its loop condition.
    }

    fn fire_write_event(&self) {
        if self.write_events.fetch_add(1, Ordering::Acquire) == 0 {
            let watcher = self.watcher();
            self.ev().pool().spawn(move || {
                let desc = watcher.descriptor();
                loop {
                    match watcher.on_writable() {
                        EventAction::Ready => {
                            if desc.write_events.fetch_sub(1, Ordering::Release) == 1 {
                                break;
                            }
                        }
                        EventAction::Leaving => {
                            debug_assert!(
                                desc.cleanup_reason() != CleanupReason::None,
                                "descriptor {} returned Leaving without kill()",
                                desc.name()
                            );
                            let watcher = Arc::clone(&watcher);
                            desc.ev().add_task(move || {
                                let desc = watcher.descriptor();
                                desc.write_events.store(0, Ordering::Relaxed);
                                desc.queue_cleanup_callback_check();
                            });
                            break;
                        }
                        EventAction::Suppress => {
                            desc.suppress_write_and_clear_count();
                            break;
                        }
                    }
                }
                desc.queue_cleanup_callback_check();
            });
        }
    }

    fn fire_error_event(&self) {
        if self.seldomly_used.error_seen.swap(true, Ordering::Relaxed) {
            trace!("{}: repeated error event ignored", self.name());
            return;
        }

        let prior = self.seldomly_used.error_events.fetch_add(1, Ordering::Acquire);
        debug_assert_eq!(prior, 0, "error latch bypassed");
        let watcher = self.watcher();
        self.ev().pool().spawn(move || {
            let desc = watcher.descriptor();
            watcher.on_error(socket::socket_error(desc.fd()));
            let prior = desc
                .seldomly_used
                .error_events
                .fetch_sub(1, Ordering::Release);
            debug_assert_eq!(prior, 1);
            desc.queue_cleanup_callback_check();
        });
    }

    fn suppress_read_and_clear_count(&self) {
        // Must run in the loop: rearm calls would otherwise be ordered
        // nondeterministically against other mask updates.
        let watcher = self.watcher();
        self.ev().add_task(move || {
            let desc = watcher.descriptor();
            // `read_events` was left non-zero by the worker that returned
            // `Suppress`; nobody else touches it until we reset it here
            // (event delivery happens on this thread).
            desc.read_events.store(0, Ordering::Release);

            // Needed in case the descriptor is leaving and its last
            // callback returned `Suppress`.
            desc.queue_cleanup_callback_check();

            if desc.enabled() {
                let reached = desc.restart_read_count.fetch_sub(1, Ordering::Relaxed) - 1;
                // `reached` may exceed zero: the upper layer is allowed to
                // issue more restarts than suppressions while we are still
                // draining the system buffer.
                debug_assert_ne!(reached, usize::MAX);
                debug_assert_ne!(desc.event_mask() & READ_BIT, 0);
                if reached == 0 {
                    desc.set_event_mask(desc.event_mask() & !READ_BIT);
                    desc.ev().rearm_descriptor(desc);
                } else {
                    // A restart won the race. From the kernel's view the
                    // buffer was never drained, so readability will not be
                    // re-reported; synthesize the event instead.
                    desc.fire_events(READ_BIT);
                }
            } // The descriptor is leaving otherwise; nothing to do.
        });
    }

    fn suppress_write_and_clear_count(&self) {
        let watcher = self.watcher();
        self.ev().add_task(move || {
            let desc = watcher.descriptor();
            desc.write_events.store(0, Ordering::Relaxed);
            desc.queue_cleanup_callback_check();

            if desc.enabled() {
                let reached = desc.restart_write_count.fetch_sub(1, Ordering::Relaxed) - 1;
                debug_assert!(
                    reached == 0 || reached == 1,
                    "unexpected restart-write count {}",
                    reached
                );
                debug_assert_ne!(desc.event_mask() & WRITE_BIT, 0);
                if reached == 0 {
                    desc.set_event_mask(desc.event_mask() & !WRITE_BIT);
                    desc.ev().rearm_descriptor(desc);
                } else {
                    desc.fire_events(WRITE_BIT);
                }
            }
        });
    }

    fn restart_read_now(&self) {
        let watcher = self.watcher();
        self.ev().add_task(move || {
            let desc = watcher.descriptor();
            if desc.enabled() {
                let count = desc.restart_read_count.fetch_add(1, Ordering::Relaxed);
                // `count` is 0 if `Suppress` has been processed, 1 if we
                // arrive before it. Higher values come from the upper
                // layer's restart / suppress imbalance.
                if count == 0 {
                    debug_assert_eq!(desc.event_mask() & READ_BIT, 0);
                    desc.set_event_mask(desc.event_mask() | READ_BIT);
                    desc.ev().rearm_descriptor(desc);
                } // Otherwise the pending suppress observes the non-zero
                  // counter and synthesizes the event.
            }
        });
    }

    fn restart_write_now(&self) {
        let watcher = self.watcher();
        self.ev().add_task(move || {
            let desc = watcher.descriptor();
            if desc.enabled() {
                let count = desc.restart_write_count.fetch_add(1, Ordering::Relaxed);
                debug_assert!(
                    count == 0 || count == 1,
                    "unexpected restart-write count {}",
                    count
                );
                if count == 0 {
                    debug_assert_eq!(desc.event_mask() & WRITE_BIT, 0);
                    desc.set_event_mask(desc.event_mask() | WRITE_BIT);
                    desc.ev().rearm_descriptor(desc);
                }
            }
        });
    }

    fn queue_cleanup_callback_check(&self) {
        // Full barrier. For `kill`'s task, the preceding store to
        // `cleanup_pending` must not be reordered after reading the event
        // counters; for the event workers, the load of `cleanup_pending`
        // must not be reordered before their final counter store. Either
        // reordering makes a quiescent descriptor look busy forever.
        memory_barrier();

        if !self.cleanup_pending.load(Ordering::Relaxed) {
            return;
        }

        // The descriptor was removed from the loop before
        // `cleanup_pending` was set, so no more events fire and the
        // counters can only go down.
        if self.read_events.load(Ordering::Relaxed) == 0
            && self.write_events.load(Ordering::Relaxed) == 0
            && self.seldomly_used.error_events.load(Ordering::Relaxed) == 0
            && !self
                .seldomly_used
                .cleanup_queued
                .swap(true, Ordering::Release)
        {
            let watcher = self.watcher();
            self.ev().add_task(move || {
                let desc = watcher.descriptor();
                // They cannot have changed since the check.
                debug_assert_eq!(desc.read_events.load(Ordering::Relaxed), 0);
                debug_assert_eq!(desc.write_events.load(Ordering::Relaxed), 0);

                // Detach, tell the implementation, wake any waiters.
                desc.ev().detach_descriptor(desc);
                watcher.on_cleanup(desc.cleanup_reason());

                let mut done = desc.seldomly_used.cleanup_done.lock().unwrap();
                *done = true;
                desc.seldomly_used.cleanup_cv.notify_all();
            });
        }
    }

    fn ev(&self) -> &Arc<EventLoop> {
        self.event_loop
            .get()
            .expect("descriptor used before being attached to an event loop")
    }

    fn watcher(&self) -> Arc<dyn Pollable> {
        self.watcher
            .get()
            .expect("descriptor core not bound")
            .upgrade()
            .expect("concrete descriptor dropped while its core is in use")
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        debug_assert!(
            !self.enabled(),
            "descriptor {} destroyed while still attached to its event loop",
            self.name()
        );
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("fd", &self.fd())
            .field("name", &self.name())
            .field("enabled", &self.enabled())
            .field("cleanup_reason", &self.cleanup_reason())
            .finish()
    }
}
