//! The event loop and the per-process group of loops.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{trace, warn};

use crate::descriptor::{Descriptor, CleanupReason, ERROR_BIT, READ_BIT, WRITE_BIT};
use crate::event::Events;
use crate::pool::WorkerPool;
use crate::sys::{Selector, Waker};
use crate::{Interest, Pollable, Token};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// How long one poll may sleep. A safety net; the waker interrupts the
/// sleep whenever there is work.
const POLL_INTERVAL: Duration = Duration::from_millis(1000);

type Task = Box<dyn FnOnce() + Send>;

/// An edge-triggered event loop.
///
/// Owns the readiness notifier, a wake fd and a set of descriptors. Event
/// callbacks are dispatched to the group's worker pool; posted tasks run
/// on the loop thread itself, after all readiness events of the current
/// tick.
pub struct EventLoop {
    selector: Selector,
    waker: Waker,
    exiting: AtomicBool,
    tasks: Mutex<Vec<Task>>,
    descriptors: Mutex<HashMap<Token, Arc<dyn Pollable>>>,
    pool: Arc<WorkerPool>,
}

impl EventLoop {
    pub(crate) fn new(pool: Arc<WorkerPool>) -> io::Result<Arc<EventLoop>> {
        let selector = Selector::new()?;
        let waker = Waker::new()?;
        selector.register(waker.as_raw_fd(), WAKER_TOKEN, Some(Interest::READABLE))?;
        Ok(Arc::new(EventLoop {
            selector,
            waker,
            exiting: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            descriptors: Mutex::new(HashMap::new()),
            pool,
        }))
    }

    /// Attaches a descriptor. Its callbacks may fire before this method
    /// returns; attach with `enabled = false` and call
    /// [`enable_descriptor`] later if that is inconvenient.
    ///
    /// [`enable_descriptor`]: EventLoop::enable_descriptor
    pub fn attach_descriptor(
        self: &Arc<EventLoop>,
        watcher: Arc<dyn Pollable>,
        enabled: bool,
    ) -> io::Result<()> {
        let desc = watcher.descriptor();
        desc.set_event_loop(Arc::clone(self));
        desc.set_enabled(enabled);
        let token = desc.token();
        let fd = desc.fd();
        let interests = if enabled { desc.interest() } else { None };

        self.descriptors
            .lock()
            .unwrap()
            .insert(token, Arc::clone(&watcher));
        if let Err(err) = self.selector.register(fd, token, interests) {
            self.descriptors.lock().unwrap().remove(&token);
            desc.set_enabled(false);
            return Err(err);
        }
        trace!("attached descriptor {} (fd {})", desc.name(), fd);
        Ok(())
    }

    /// Enables a descriptor attached with `enabled = false`. Only for the
    /// first enabling; use [`rearm_descriptor`] afterwards.
    ///
    /// [`rearm_descriptor`]: EventLoop::rearm_descriptor
    pub fn enable_descriptor(&self, desc: &Descriptor) {
        desc.set_enabled(true);
        self.rearm_descriptor(desc);
    }

    /// Re-registers `desc` with its current event mask. Must run on the
    /// loop thread (post a task), otherwise it races with suppressions.
    pub(crate) fn rearm_descriptor(&self, desc: &Descriptor) {
        let interests = if desc.enabled() { desc.interest() } else { None };
        if let Err(err) = self.selector.reregister(desc.fd(), desc.token(), interests) {
            warn!("failed to rearm descriptor {}: {}", desc.name(), err);
        }
    }

    /// Removes `desc` from the notifier; no events fire afterwards.
    /// Cleanup is not delivered by this call alone.
    pub(crate) fn disable_descriptor(&self, desc: &Descriptor) {
        if let Err(err) = self.selector.deregister(desc.fd()) {
            warn!("failed to disable descriptor {}: {}", desc.name(), err);
        }
        desc.set_enabled(false);
    }

    /// Final step of cleanup: drops the loop's reference.
    ///
    /// The removal itself is posted as a task, so every task posted before
    /// this call is executed before the descriptor is actually detached,
    /// and any task posted after it observes the descriptor as gone.
    pub(crate) fn detach_descriptor(&self, desc: &Descriptor) {
        let token = desc.token();
        let ev = Arc::clone(desc.event_loop().expect("detaching unattached descriptor"));
        trace!("detaching descriptor {} (fd {})", desc.name(), desc.fd());
        self.add_task(move || {
            ev.descriptors.lock().unwrap().remove(&token);
        });
    }

    /// Posts `f` to run on the loop thread after the current tick's
    /// readiness events.
    ///
    /// Not meant as a general executor: use it for loop-coupled state
    /// changes only.
    pub fn add_task<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tasks.lock().unwrap().push(Box::new(f));
        if let Err(err) = self.waker.wake() {
            warn!("failed to wake event loop: {}", err);
        }
    }

    /// Posts a no-op task and waits for it. Every task posted before this
    /// call has been executed once it returns.
    ///
    /// Must not be called from the loop thread itself.
    pub fn barrier(&self) {
        let (tx, rx) = mpsc::channel();
        self.add_task(move || {
            let _ = tx.send(());
        });
        let _ = rx.recv();
    }

    /// Runs the loop until [`stop`] is called. Pending tasks are executed
    /// before this returns.
    ///
    /// [`stop`]: EventLoop::stop
    pub fn run(&self) {
        let mut events = Events::with_capacity(256);
        while !self.exiting.load(Ordering::Relaxed) {
            self.wait_and_run_events(&mut events, POLL_INTERVAL);
            self.run_user_tasks();
        }
        // The loop guarantees all tasks posted before `stop` run before it
        // fully stops.
        self.run_user_tasks();
        self.disable_remaining_descriptors();
    }

    /// Asks the loop to exit.
    pub fn stop(&self) {
        self.exiting.store(true, Ordering::Relaxed);
        if let Err(err) = self.waker.wake() {
            warn!("failed to wake event loop for stop: {}", err);
        }
    }

    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    fn wait_and_run_events(&self, events: &mut Events, wait_for: Duration) {
        if let Err(err) = self.selector.select(events.sys(), Some(wait_for)) {
            if err.kind() != io::ErrorKind::Interrupted {
                warn!("event loop poll failed: {}", err);
            }
            return;
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                if let Err(err) = self.waker.reset() {
                    warn!("failed to drain waker: {}", err);
                }
                continue;
            }
            let watcher = self.descriptors.lock().unwrap().get(&token).cloned();
            let Some(watcher) = watcher else {
                // Detached while the event was in flight.
                continue;
            };
            let mut mask = 0;
            if event.is_error() {
                mask |= ERROR_BIT;
            }
            if event.is_readable() {
                mask |= READ_BIT;
            }
            if event.is_writable() {
                mask |= WRITE_BIT;
            }
            watcher.descriptor().fire_events(mask);
        }
    }

    fn run_user_tasks(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                task();
            }
        }
    }

    /// Descriptors that are still attached when the loop exits have not
    /// been stopped by their owner. Quiesce them so the fds stop being
    /// polled; their cleanup callbacks cannot run anymore.
    fn disable_remaining_descriptors(&self) {
        let descriptors = std::mem::take(&mut *self.descriptors.lock().unwrap());
        for (_, watcher) in descriptors {
            let desc = watcher.descriptor();
            if desc.enabled() {
                warn!(
                    "descriptor {} still attached at event loop exit",
                    desc.name()
                );
                self.disable_descriptor(desc);
            }
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("selector", &self.selector)
            .field("exiting", &self.exiting.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// One event loop per scheduling slot plus the worker pool all their
/// descriptors share.
///
/// Descriptors are mapped to loops by a stable hash of their fd.
pub struct EventLoopGroup {
    loops: Vec<Arc<EventLoop>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    pool: Arc<WorkerPool>,
    stopped: AtomicBool,
}

impl EventLoopGroup {
    /// Starts `num_loops` event loops and the shared worker pool.
    pub fn new(num_loops: usize) -> io::Result<EventLoopGroup> {
        assert!(num_loops > 0);
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .max(4);
        let pool = Arc::new(WorkerPool::new("evio-worker", workers));

        let mut loops = Vec::with_capacity(num_loops);
        let mut threads = Vec::with_capacity(num_loops);
        for i in 0..num_loops {
            let ev = EventLoop::new(Arc::clone(&pool))?;
            let ev2 = Arc::clone(&ev);
            let handle = std::thread::Builder::new()
                .name(format!("evio-loop-{}", i))
                .spawn(move || ev2.run())
                .expect("failed to spawn event loop thread");
            loops.push(ev);
            threads.push(handle);
        }
        Ok(EventLoopGroup {
            loops,
            threads: Mutex::new(threads),
            pool,
            stopped: AtomicBool::new(false),
        })
    }

    /// The loop a descriptor with `fd` belongs to.
    pub fn event_loop_for(&self, fd: RawFd) -> &Arc<EventLoop> {
        &self.loops[fd as usize % self.loops.len()]
    }

    /// Attaches `watcher` to the loop selected by its fd.
    pub fn attach(&self, watcher: Arc<dyn Pollable>, enabled: bool) -> io::Result<()> {
        let fd = watcher.descriptor().fd();
        self.event_loop_for(fd).attach_descriptor(watcher, enabled)
    }

    /// Waits until each loop has executed a task posted by this call.
    /// Primarily used in shutdown paths.
    pub fn barrier(&self) {
        for ev in &self.loops {
            ev.barrier();
        }
    }

    /// Kills every descriptor still attached (reason `Closing`), then
    /// asks the loops to exit. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::Relaxed) {
            return;
        }
        for ev in &self.loops {
            let watchers: Vec<_> = ev.descriptors.lock().unwrap().values().cloned().collect();
            for watcher in watchers {
                watcher.descriptor().kill(CleanupReason::Closing);
            }
        }
        // Give the kill tasks a chance to disable their descriptors.
        self.barrier();
        for ev in &self.loops {
            ev.stop();
        }
    }

    /// Joins the loop threads, then drains and joins the worker pool.
    pub fn join(&self) {
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for thread in threads {
            let _ = thread.join();
        }
        self.pool.stop();
        self.pool.join();
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

impl fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopGroup")
            .field("loops", &self.loops.len())
            .finish_non_exhaustive()
    }
}
