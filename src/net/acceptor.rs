//! Listening-socket descriptor.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Weak};

use log::warn;

use crate::descriptor::{CleanupReason, Descriptor, EventAction, Pollable};
use crate::sys::socket;
use crate::Interest;

/// Options for [`Acceptor::new`].
pub struct AcceptorOptions {
    /// Called for each accepted connection with the new socket (already
    /// `CLOEXEC` and non-blocking) and the remote endpoint.
    ///
    /// Connections land on the handler in event-loop order; if several
    /// acceptors share one listening fd the distribution between them is
    /// not balanced.
    pub connection_handler: Box<dyn Fn(OwnedFd, SocketAddr) + Send + Sync>,
}

impl fmt::Debug for AcceptorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptorOptions").finish_non_exhaustive()
    }
}

/// Accepts connections from a listening socket.
///
/// The caller is responsible for bind / listen (see
/// [`socket::create_listener`]); the acceptor only accepts.
///
/// [`socket::create_listener`]: crate::net::socket::create_listener
pub struct Acceptor {
    desc: Descriptor,
    connection_handler: Box<dyn Fn(OwnedFd, SocketAddr) + Send + Sync>,
}

impl Acceptor {
    /// Wraps a non-blocking listening socket.
    pub fn new(fd: OwnedFd, options: AcceptorOptions) -> Arc<Acceptor> {
        Arc::new_cyclic(|weak: &Weak<Acceptor>| {
            let desc = Descriptor::new(fd, Interest::READABLE, "Acceptor");
            let pollable: Weak<dyn Pollable> = weak.clone();
            desc.bind(pollable);
            Acceptor {
                desc,
                connection_handler: options.connection_handler,
            }
        })
    }

    /// The embedded descriptor; use it to attach the acceptor.
    pub fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    /// Initiates shutdown.
    pub fn stop(&self) {
        self.desc.kill(CleanupReason::UserInitiated);
    }

    /// Blocks until cleanup has completed. Call `stop` first.
    pub fn join(&self) {
        self.desc.wait_for_cleanup();
    }
}

impl Pollable for Acceptor {
    fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    fn on_readable(&self) -> EventAction {
        loop {
            match socket::accept(self.desc.fd()) {
                Ok((fd, peer)) => (self.connection_handler)(fd, peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return EventAction::Ready;
                }
                // The connection died between the kernel queue and us.
                Err(err) if err.raw_os_error() == Some(libc::ECONNABORTED) => continue,
                Err(err) => {
                    warn!("{}: accept failed: {}", self.desc.name(), err);
                    self.desc.kill(CleanupReason::Error);
                    return EventAction::Leaving;
                }
            }
        }
    }

    fn on_writable(&self) -> EventAction {
        unreachable!("writable event on a listening socket");
    }

    fn on_error(&self, err: io::Error) {
        warn!("{}: error event: {}", self.desc.name(), err);
        self.desc.kill(CleanupReason::Error);
    }

    fn on_cleanup(&self, _reason: CleanupReason) {}
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor")
            .field("descriptor", &self.desc)
            .finish_non_exhaustive()
    }
}
