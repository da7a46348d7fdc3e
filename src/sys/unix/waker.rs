use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Wakes the event loop out of its poll, backed by `eventfd`.
///
/// The eventfd counter accumulates one increment per [`wake`]; the loop
/// registers the fd edge-triggered and calls [`reset`] once per wakeup.
/// Draining on every wakeup means a burst of task postings between two
/// polls collapses into a single readiness event, and the counter never
/// creeps towards its overflow limit.
///
/// [`wake`]: Waker::wake
/// [`reset`]: Waker::reset
#[derive(Debug)]
pub(crate) struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` returned a valid fd that nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Waker { fd })
    }

    /// Adds one to the counter, producing a readiness event for the loop.
    pub(crate) fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        match syscall_eintr!(write(
            self.fd.as_raw_fd(),
            &one as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // The counter is about to overflow, which can only mean
                // the loop has not drained it for a very long time. Make
                // room, then wake again.
                self.reset()?;
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    /// Drains the counter back to zero.
    ///
    /// Called by the event loop once per wakeup, before it runs posted
    /// tasks; any number of `wake` calls since the last poll cost exactly
    /// one event.
    pub(crate) fn reset(&self) -> io::Result<()> {
        let mut count: u64 = 0;
        match syscall_eintr!(read(
            self.fd.as_raw_fd(),
            &mut count as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )) {
            Ok(_) => Ok(()),
            // Nobody woke us since the last drain; nothing to clear.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
