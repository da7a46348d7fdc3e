use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use libc::{EPOLLERR, EPOLLET, EPOLLIN, EPOLLOUT};

use crate::{Interest, Token};

#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up. This avoids
                // turning sub-millisecond timeouts into a zero timeout,
                // unless the caller explicitly requests that by specifying a
                // zero timeout.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        events.clear();
        syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout,
        ))
        .map(|n_events| {
            // This is safe because `epoll_wait` ensures that `n_events` are
            // assigned.
            unsafe { events.set_len(n_events as usize) };
        })
    }

    /// Registers `fd` edge-triggered. With `interests` of `None` only error
    /// conditions are reported, which epoll delivers unconditionally.
    pub(crate) fn register(
        &self,
        fd: RawFd,
        token: Token,
        interests: Option<Interest>,
    ) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: usize::from(token) as u64,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn reregister(
        &self,
        fd: RawFd,
        token: Token,
        interests: Option<Interest>,
    ) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: usize::from(token) as u64,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())).map(|_| ())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

fn interests_to_epoll(interests: Option<Interest>) -> u32 {
    let mut kind = EPOLLET;

    if let Some(interests) = interests {
        if interests.is_readable() {
            kind |= EPOLLIN;
        }
        if interests.is_writable() {
            kind |= EPOLLOUT;
        }
    }

    kind as u32
}

pub(crate) type Event = libc::epoll_event;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use super::*;
    use crate::Token;

    pub(crate) fn token(event: &Event) -> Token {
        Token(event.u64 as usize)
    }

    pub(crate) fn is_readable(event: &Event) -> bool {
        // A peer close surfaces as `EPOLLIN` (with the read reporting
        // end-of-stream), so `EPOLLHUP` needs no mapping of its own. HUP
        // is delivered whether or not it was asked for; forwarding it to
        // an unarmed direction would corrupt the restart accounting.
        (event.events as libc::c_int & EPOLLIN) != 0
    }

    pub(crate) fn is_writable(event: &Event) -> bool {
        (event.events as libc::c_int & EPOLLOUT) != 0
    }

    pub(crate) fn is_error(event: &Event) -> bool {
        (event.events as libc::c_int & EPOLLERR) != 0
    }
}
