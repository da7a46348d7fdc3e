//! Races the restart / kill paths of the descriptor state machine, the
//! way the interlock is actually exercised by upper layers.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Weak};
use std::time::Duration;

use evio::{CleanupReason, Descriptor, EventAction, EventLoopGroup, Interest, Pollable};

mod util;

use util::init;

struct PipeDesc {
    desc: Descriptor,
    read_action: EventAction,
    cleaned: Arc<AtomicUsize>,
}

impl PipeDesc {
    /// The read end of a pipe holding a little data, with its write end
    /// already closed. Read interest starts disarmed; `restart_read_in`
    /// arms it.
    fn new(read_action: EventAction, cleaned: Arc<AtomicUsize>) -> Arc<PipeDesc> {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0, "pipe2 failed: {}", io::Error::last_os_error());
        unsafe {
            assert_eq!(libc::write(fds[1], b"asdf".as_ptr() as *const _, 4), 4);
            libc::close(fds[1]);
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };

        Arc::new_cyclic(|weak: &Weak<PipeDesc>| {
            let desc = Descriptor::new(fd, Interest::WRITABLE, "PipeDesc");
            let pollable: Weak<dyn Pollable> = weak.clone();
            desc.bind(pollable);
            PipeDesc {
                desc,
                read_action,
                cleaned,
            }
        })
    }
}

impl Pollable for PipeDesc {
    fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    fn on_readable(&self) -> EventAction {
        self.read_action
    }

    fn on_writable(&self) -> EventAction {
        EventAction::Ready
    }

    fn on_error(&self, _err: io::Error) {
        self.desc.kill(CleanupReason::Error);
    }

    fn on_cleanup(&self, _reason: CleanupReason) {
        self.cleaned.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn concurrent_restart_read_and_kill() {
    init();
    const ITERATIONS: usize = 500;

    let group = Arc::new(EventLoopGroup::new(1).unwrap());
    let cleaned = Arc::new(AtomicUsize::new(0));

    for read_action in [EventAction::Ready, EventAction::Suppress] {
        for _ in 0..ITERATIONS {
            let desc = PipeDesc::new(read_action, Arc::clone(&cleaned));
            group.attach(desc.clone(), true).unwrap();

            let start = Arc::new(Barrier::new(2));
            let restarter = {
                let desc = Arc::clone(&desc);
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    start.wait();
                    desc.descriptor().restart_read_in(Duration::ZERO);
                })
            };
            let killer = {
                let desc = Arc::clone(&desc);
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    start.wait();
                    desc.descriptor().kill(CleanupReason::Closing);
                })
            };
            restarter.join().unwrap();
            killer.join().unwrap();

            desc.descriptor().wait_for_cleanup();
        }
    }

    // Exactly one cleanup per descriptor, no matter how the race went.
    assert_eq!(cleaned.load(Ordering::Relaxed), ITERATIONS * 2);

    group.stop();
    group.join();
}
