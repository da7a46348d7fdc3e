//! Non-blocking datagram transceivers.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::mem::{size_of, MaybeUninit};
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use log::warn;

use crate::descriptor::{CleanupReason, Descriptor, EventAction, Pollable};
use crate::net::writing_list::{DatagramFlush, WritingDatagramList};
use crate::sys::socket;
use crate::Interest;

/// Number of send syscalls attempted directly from `write` before the
/// event loop takes over.
const MAX_WRITES_PER_CALL: usize = 64;

/// Returned by [`DatagramTransceiverHandler::on_datagram_arrival`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatagramConsumptionStatus {
    Consumed,
    /// Pause reads until [`DatagramTransceiver::restart_read`].
    SuppressRead,
    /// Terminate the transceiver.
    Error,
}

/// Callbacks of a datagram transceiver.
pub trait DatagramTransceiverHandler: Send + Sync {
    /// Called once on construction.
    fn on_attach(&self, conn: &Arc<DatagramTransceiver>);

    /// Called after cleanup.
    fn on_detach(&self) {}

    /// One datagram arrived. Boundaries are preserved; an empty datagram
    /// is data, not end-of-stream.
    fn on_datagram_arrival(&self, buffer: Bytes, peer: SocketAddr) -> DatagramConsumptionStatus;

    /// Every queued datagram has been handed to the kernel.
    fn on_pending_writes_flushed(&self) {}

    /// One datagram given to [`DatagramTransceiver::write`] went out.
    fn on_datagram_written(&self, _ctx: u64) {}

    /// The transceiver failed; it is already detached when called.
    fn on_error(&self) {}
}

/// Options for [`DatagramTransceiver::new`].
pub struct DatagramTransceiverOptions {
    pub handler: Box<dyn DatagramTransceiverHandler>,

    /// Upper bound on a received datagram's payload; longer datagrams are
    /// truncated by the kernel.
    pub maximum_packet_size: usize,
}

impl fmt::Debug for DatagramTransceiverOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramTransceiverOptions")
            .field("maximum_packet_size", &self.maximum_packet_size)
            .finish_non_exhaustive()
    }
}

/// A datagram (UDP) socket driven by an event loop.
///
/// There is no ordering dependency between datagrams and no handshake;
/// each queued datagram is sent whole and reported through
/// `on_datagram_written`.
pub struct DatagramTransceiver {
    desc: Descriptor,
    handler: Box<dyn DatagramTransceiverHandler>,
    maximum_packet_size: usize,
    write_buffer: WritingDatagramList,
}

enum FlushStatus {
    Flushed,
    SystemBufferSaturated,
    QuotaExceeded,
    Error(io::Error),
}

impl DatagramTransceiver {
    /// Wraps a bound non-blocking datagram socket.
    pub fn new(fd: OwnedFd, options: DatagramTransceiverOptions) -> Arc<DatagramTransceiver> {
        assert!(options.maximum_packet_size > 0);
        let conn = Arc::new_cyclic(|weak: &Weak<DatagramTransceiver>| {
            let desc = Descriptor::new(fd, Interest::READABLE, "DatagramTransceiver");
            let pollable: Weak<dyn Pollable> = weak.clone();
            desc.bind(pollable);
            DatagramTransceiver {
                desc,
                handler: options.handler,
                maximum_packet_size: options.maximum_packet_size,
                write_buffer: WritingDatagramList::new(),
            }
        });
        conn.handler.on_attach(&conn);
        conn
    }

    /// The embedded descriptor; use it to attach the transceiver.
    pub fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    /// Queues one datagram for `to`. Datagram boundaries are preserved
    /// end-to-end.
    ///
    /// Returns `false` only if the kernel reported the socket closed /
    /// unusable; queued or sent datagrams return `true`.
    pub fn write(&self, to: SocketAddr, buffer: Bytes, ctx: u64) -> bool {
        if self.desc.cleanup_reason() != CleanupReason::None {
            return false;
        }
        if self.write_buffer.append(to, buffer, ctx) {
            // The queue was empty; try to send inline before arming the
            // write event.
            match self.flush_writing_buffer(MAX_WRITES_PER_CALL) {
                FlushStatus::SystemBufferSaturated | FlushStatus::QuotaExceeded => {
                    self.desc.restart_write_in(Duration::ZERO);
                }
                FlushStatus::Flushed => {
                    self.handler.on_pending_writes_flushed();
                }
                FlushStatus::Error(err) => {
                    // The failure also surfaces as an error event; nothing
                    // more to do here.
                    warn!("{}: failed to write: {}", self.desc.name(), err);
                }
            }
        }
        true
    }

    /// Cancels a read suppression requested by `on_datagram_arrival`.
    pub fn restart_read(&self) {
        self.desc.restart_read_in(Duration::ZERO);
    }

    /// Initiates shutdown.
    pub fn stop(&self) {
        self.desc.kill(CleanupReason::UserInitiated);
    }

    /// Blocks until cleanup has completed. Call `stop` first.
    pub fn join(&self) {
        self.desc.wait_for_cleanup();
    }

    fn flush_writing_buffer(&self, max_writes: usize) -> FlushStatus {
        for _ in 0..max_writes {
            match self.write_buffer.flush_to(self.desc.fd()) {
                Ok(DatagramFlush::Empty) => return FlushStatus::Flushed,
                Ok(DatagramFlush::Sent { ctx, emptied }) => {
                    self.handler.on_datagram_written(ctx);
                    if emptied {
                        return FlushStatus::Flushed;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return FlushStatus::SystemBufferSaturated;
                }
                Err(err) => return FlushStatus::Error(err),
            }
        }
        FlushStatus::QuotaExceeded
    }
}

impl Pollable for DatagramTransceiver {
    fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    fn on_readable(&self) -> EventAction {
        thread_local! {
            static SCRATCH: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
        }

        loop {
            let result = SCRATCH.with(|scratch| {
                let mut scratch = scratch.borrow_mut();
                scratch.resize(self.maximum_packet_size, 0);

                let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
                let mut length = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                let read = syscall_eintr!(recvfrom(
                    self.desc.fd(),
                    scratch.as_mut_ptr() as *mut libc::c_void,
                    scratch.len(),
                    0,
                    storage.as_mut_ptr() as *mut _,
                    &mut length,
                ))?;
                // A zero-byte result is an empty datagram (headers only),
                // not an error and not end-of-stream.
                let peer = unsafe { socket::to_socket_addr(storage.as_ptr())? };
                Ok::<_, io::Error>((Bytes::copy_from_slice(&scratch[..read as usize]), peer))
            });

            let (datagram, peer) = match result {
                Ok(pair) => pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return EventAction::Ready;
                }
                Err(err) => {
                    warn!("{}: read failed: {}", self.desc.name(), err);
                    self.desc.kill(CleanupReason::Error);
                    return EventAction::Leaving;
                }
            };

            match self.handler.on_datagram_arrival(datagram, peer) {
                DatagramConsumptionStatus::Consumed => {}
                DatagramConsumptionStatus::Error => {
                    self.desc.kill(CleanupReason::Error);
                    return EventAction::Leaving;
                }
                DatagramConsumptionStatus::SuppressRead => {
                    return EventAction::Suppress;
                }
            }
        }
    }

    fn on_writable(&self) -> EventAction {
        match self.flush_writing_buffer(usize::MAX) {
            FlushStatus::SystemBufferSaturated => EventAction::Ready,
            FlushStatus::Flushed => {
                self.handler.on_pending_writes_flushed();
                EventAction::Suppress
            }
            FlushStatus::QuotaExceeded => unreachable!("unbounded flush reported a quota"),
            FlushStatus::Error(err) => {
                warn!("{}: write failed: {}", self.desc.name(), err);
                self.desc.kill(CleanupReason::Error);
                EventAction::Leaving
            }
        }
    }

    fn on_error(&self, err: io::Error) {
        warn!("{}: error event: {}", self.desc.name(), err);
        self.desc.kill(CleanupReason::Error);
    }

    fn on_cleanup(&self, reason: CleanupReason) {
        debug_assert!(reason != CleanupReason::None);
        match reason {
            CleanupReason::UserInitiated | CleanupReason::Disconnect => {}
            _ => self.handler.on_error(),
        }
        self.handler.on_detach();
    }
}

impl fmt::Debug for DatagramTransceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramTransceiver")
            .field("descriptor", &self.desc)
            .finish_non_exhaustive()
    }
}
