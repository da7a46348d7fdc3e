//! A small fixed worker pool.
//!
//! Descriptor event callbacks and slow timer callbacks run here instead of
//! on the event-loop or time-keeper threads, so a slow callback never
//! stalls event dispatch.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send>;

pub(crate) struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    cv: Condvar,
    exiting: AtomicBool,
}

impl WorkerPool {
    pub(crate) fn new(name: &str, threads: usize) -> WorkerPool {
        assert!(threads > 0);
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            exiting: AtomicBool::new(false),
        });
        let workers = (0..threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("{}-{}", name, i))
                    .spawn(move || worker_proc(&shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        WorkerPool {
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub(crate) fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(Box::new(f));
        drop(queue);
        self.shared.cv.notify_one();
    }

    pub(crate) fn stop(&self) {
        self.shared.exiting.store(true, Ordering::Relaxed);
        self.shared.cv.notify_all();
    }

    pub(crate) fn join(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.join();
        }
    }
}

fn worker_proc(shared: &Shared) {
    loop {
        let mut queue = shared.queue.lock().unwrap();
        let task = loop {
            if let Some(task) = queue.pop_front() {
                break task;
            }
            // Queued tasks are drained even during shutdown.
            if shared.exiting.load(Ordering::Relaxed) {
                return;
            }
            queue = shared.cv.wait(queue).unwrap();
        };
        drop(queue);
        task();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn runs_tasks() {
        let pool = WorkerPool::new("test-pool", 2);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                tx.send(()).unwrap();
            });
        }
        for _ in 0..64 {
            rx.recv().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 64);
        pool.stop();
        pool.join();
    }
}
