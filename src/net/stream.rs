//! Non-blocking stream connections.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::BytesMut;
use log::warn;

use crate::buffer::ChainBuffer;
use crate::descriptor::{CleanupReason, Descriptor, EventAction, Pollable};
use crate::net::rate_limiter::{
    default_rx_rate_limiter, default_tx_rate_limiter, RateLimiter, DEFAULT_TICK,
};
use crate::net::stream_io::{HandshakeStatus, ReadStatus, StreamIo, SystemStreamIo};
use crate::net::writing_list::{ListFlushStatus, WritingBufferList};
use crate::Interest;

/// Upper bound of one read syscall.
const READ_CHUNK: usize = 64 * 1024;

/// Returned by [`StreamConnectionHandler::on_data_arrival`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataConsumptionStatus {
    /// Keep the data coming.
    Ready,
    /// Pause reads; the handler re-enables them via
    /// [`StreamConnection::restart_read`].
    SuppressRead,
    /// Terminate the connection.
    Error,
}

/// Callbacks of a stream connection.
///
/// `on_data_arrival` and `on_data_written` may run concurrently (they
/// belong to different directions); implementations synchronize their own
/// state.
pub trait StreamConnectionHandler: Send + Sync {
    /// Called once on construction.
    fn on_attach(&self, conn: &Arc<StreamConnection>);

    /// Called after cleanup; the connection will not call back afterwards.
    fn on_detach(&self) {}

    /// All queued writes have been handed to the kernel. The kernel may
    /// still be buffering; this only describes the connection's own queue.
    fn on_write_buffer_empty(&self) {}

    /// One chunk given to [`StreamConnection::write`] was fully written.
    /// Contexts arrive exactly once and in `write` order. If the
    /// connection breaks earlier, the context is never reported.
    fn on_data_written(&self, _ctx: u64) {}

    /// Data arrived. Consume from the front of `buffer`; leaving more than
    /// the configured `read_buffer_size` while returning `Ready` is a
    /// protocol violation and terminates the connection.
    fn on_data_arrival(&self, buffer: &mut ChainBuffer) -> DataConsumptionStatus;

    /// The peer closed the connection. Mutually exclusive with
    /// `on_error`; the connection is already detached when called.
    fn on_close(&self) {}

    /// The connection failed. Mutually exclusive with `on_close`.
    fn on_error(&self) {}
}

/// Options for [`StreamConnection::new`].
pub struct StreamConnectionOptions {
    pub handler: Box<dyn StreamConnectionHandler>,

    /// Upper bound on bytes buffered while awaiting `on_data_arrival`.
    /// Required, positive.
    pub read_buffer_size: usize,

    /// Byte transport; plain TCP when `None`.
    pub stream_io: Option<Box<dyn StreamIo>>,

    /// Defaults to the process-wide rx limiter. If you override this,
    /// layer your own limiter above the default one (see
    /// [`LayeredRateLimiter`]), otherwise the global cap is bypassed.
    ///
    /// [`LayeredRateLimiter`]: crate::net::LayeredRateLimiter
    pub read_rate_limiter: Option<Box<dyn RateLimiter>>,

    /// Defaults to the process-wide tx limiter. Same caveat as above.
    pub write_rate_limiter: Option<Box<dyn RateLimiter>>,
}

impl fmt::Debug for StreamConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnectionOptions")
            .field("read_buffer_size", &self.read_buffer_size)
            .finish_non_exhaustive()
    }
}

struct HandshakingFlags {
    need_restart_read: bool,
    pending_restart_writes: bool,
}

struct HandshakingState {
    done: AtomicBool,
    lock: Mutex<HandshakingFlags>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum HandshakeCaller {
    Start,
    Reader,
    Writer,
}

enum HandshakeOutcome {
    /// Handshake finished; proceed with normal I/O.
    Done,
    /// Waiting for this direction's next readiness edge.
    Wait,
    /// This direction parks itself until the other side finishes the
    /// handshake.
    Park,
    Failed,
}

struct ReadState {
    buffer: ChainBuffer,
    limiter: Box<dyn RateLimiter>,
}

struct WriteState {
    limiter: Box<dyn RateLimiter>,
}

enum FlushStatus {
    Flushed,
    SystemBufferSaturated,
    RateLimited,
    Error(io::Error),
}

enum Consumed {
    Ready,
    Suppressed,
    Killed,
}

/// A TCP (or TLS-style layered) connection driven by an event loop.
///
/// Construct with [`new`], attach to a loop, then call
/// [`start_handshaking`]. Writes are ordered; completion is reported
/// per-context through the handler.
///
/// [`new`]: StreamConnection::new
/// [`start_handshaking`]: StreamConnection::start_handshaking
pub struct StreamConnection {
    desc: Descriptor,
    handler: Box<dyn StreamConnectionHandler>,
    stream_io: Box<dyn StreamIo>,
    read_buffer_size: usize,

    handshaking: HandshakingState,

    // Touched by the read worker only.
    read_state: Mutex<ReadState>,
    // Touched by the write worker only.
    write_state: Mutex<WriteState>,
    writing_buffers: WritingBufferList,
}

impl StreamConnection {
    /// Wraps a connected (or connecting) non-blocking socket.
    pub fn new(fd: OwnedFd, options: StreamConnectionOptions) -> Arc<StreamConnection> {
        assert!(
            options.read_buffer_size > 0,
            "read_buffer_size is required and must be positive"
        );
        let raw_fd = fd.as_raw_fd();
        let conn = Arc::new_cyclic(|weak: &Weak<StreamConnection>| {
            let desc = Descriptor::new(
                fd,
                Interest::READABLE | Interest::WRITABLE,
                "StreamConnection",
            );
            let pollable: Weak<dyn Pollable> = weak.clone();
            desc.bind(pollable);
            StreamConnection {
                desc,
                handler: options.handler,
                stream_io: options
                    .stream_io
                    .unwrap_or_else(|| Box::new(SystemStreamIo::new(raw_fd))),
                read_buffer_size: options.read_buffer_size,
                handshaking: HandshakingState {
                    done: AtomicBool::new(false),
                    lock: Mutex::new(HandshakingFlags {
                        need_restart_read: false,
                        pending_restart_writes: false,
                    }),
                },
                read_state: Mutex::new(ReadState {
                    buffer: ChainBuffer::new(),
                    limiter: options
                        .read_rate_limiter
                        .unwrap_or_else(|| Box::new(default_rx_rate_limiter())),
                }),
                write_state: Mutex::new(WriteState {
                    limiter: options
                        .write_rate_limiter
                        .unwrap_or_else(|| Box::new(default_tx_rate_limiter())),
                }),
                writing_buffers: WritingBufferList::new(),
            }
        });
        conn.handler.on_attach(&conn);
        conn
    }

    /// The embedded descriptor; use it to attach the connection:
    /// `group.attach(conn.clone(), true)`.
    pub fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    /// Starts handshaking with the remote peer. Must be called after the
    /// connection has been attached to an event loop. Failures surface
    /// through the handler's `on_error`.
    pub fn start_handshaking(&self) {
        let _ = self.do_handshake(HandshakeCaller::Start);
    }

    /// Queues `buffer` for writing. Consolidation or splitting across
    /// syscalls is allowed; this is a byte stream.
    ///
    /// Returns `false` (and does nothing) only if the connection is
    /// already terminal; the caller may then resend the data elsewhere
    /// without risking duplication.
    pub fn write(&self, buffer: impl Into<ChainBuffer>, ctx: u64) -> bool {
        if self.desc.cleanup_reason() != CleanupReason::None {
            return false;
        }
        if self.writing_buffers.append(buffer.into(), ctx) {
            // The list went empty -> non-empty, so the write side is
            // parked; kick it.
            if self.handshaking.done.load(Ordering::Acquire) {
                self.desc.restart_write_in(Duration::ZERO);
            } else {
                let mut flags = self.handshaking.lock.lock().unwrap();
                if self.handshaking.done.load(Ordering::Acquire) {
                    drop(flags);
                    self.desc.restart_write_in(Duration::ZERO);
                } else {
                    flags.pending_restart_writes = true;
                }
            }
        }
        true
    }

    /// Cancels a read suppression requested by `on_data_arrival`. Safe
    /// from any thread, including from inside `on_data_arrival` itself
    /// (before it returns `SuppressRead`).
    pub fn restart_read(&self) {
        if self.handshaking.done.load(Ordering::Acquire) {
            self.desc.restart_read_in(Duration::ZERO);
        } else {
            let mut flags = self.handshaking.lock.lock().unwrap();
            if self.handshaking.done.load(Ordering::Acquire) {
                drop(flags);
                self.desc.restart_read_in(Duration::ZERO);
            } else {
                // Replayed once the handshake completes.
                flags.need_restart_read = true;
            }
        }
    }

    /// Initiates shutdown. `on_close` is delivered through the handler
    /// once the connection is quiescent.
    pub fn stop(&self) {
        self.desc.kill(CleanupReason::UserInitiated);
    }

    /// Blocks until cleanup has completed. Call `stop` first.
    pub fn join(&self) {
        self.desc.wait_for_cleanup();
    }

    fn do_handshake(&self, caller: HandshakeCaller) -> HandshakeOutcome {
        let mut flags = self.handshaking.lock.lock().unwrap();
        if self.handshaking.done.load(Ordering::Relaxed) {
            return HandshakeOutcome::Done;
        }
        match self.stream_io.handshake() {
            Ok(HandshakeStatus::Success) => {
                self.handshaking.done.store(true, Ordering::Release);
                let need_read = std::mem::replace(&mut flags.need_restart_read, false);
                let pending_writes = std::mem::replace(&mut flags.pending_restart_writes, false);
                drop(flags);
                // Replay restarts deferred while handshaking.
                if need_read && caller != HandshakeCaller::Reader {
                    self.desc.restart_read_in(Duration::ZERO);
                }
                if pending_writes && caller != HandshakeCaller::Writer {
                    self.desc.restart_write_in(Duration::ZERO);
                }
                HandshakeOutcome::Done
            }
            Ok(HandshakeStatus::WantRead) => {
                if caller == HandshakeCaller::Writer {
                    // Nothing to write until the peer answers; the read
                    // side finishes the handshake and unparks us.
                    flags.pending_restart_writes = true;
                    HandshakeOutcome::Park
                } else {
                    HandshakeOutcome::Wait
                }
            }
            Ok(HandshakeStatus::WantWrite) => {
                if caller == HandshakeCaller::Reader
                    && std::mem::replace(&mut flags.pending_restart_writes, false)
                {
                    // The write side parked itself; wake it to push the
                    // next handshake message.
                    drop(flags);
                    self.desc.restart_write_in(Duration::ZERO);
                }
                HandshakeOutcome::Wait
            }
            Err(err) => {
                drop(flags);
                warn!("{}: handshake failed: {}", self.desc.name(), err);
                self.desc.kill(CleanupReason::HandshakeFailed);
                HandshakeOutcome::Failed
            }
        }
    }

    fn consume_read_buffer(&self, state: &mut ReadState) -> Consumed {
        while !state.buffer.is_empty() {
            match self.handler.on_data_arrival(&mut state.buffer) {
                DataConsumptionStatus::Ready => {
                    if state.buffer.len() >= self.read_buffer_size {
                        // The consumer claims readiness but refuses to
                        // consume; that is a protocol violation.
                        warn!(
                            "{}: read buffer overflow ({} bytes) with a Ready consumer",
                            self.desc.name(),
                            state.buffer.len()
                        );
                        self.desc.kill(CleanupReason::Error);
                        return Consumed::Killed;
                    }
                    break;
                }
                DataConsumptionStatus::SuppressRead => return Consumed::Suppressed,
                DataConsumptionStatus::Error => {
                    self.desc.kill(CleanupReason::Error);
                    return Consumed::Killed;
                }
            }
        }
        Consumed::Ready
    }

    fn flush_writing_buffer(&self, quota: usize) -> FlushStatus {
        let mut total = 0;
        let status = loop {
            let remaining = quota - total;
            if remaining == 0 {
                break FlushStatus::RateLimited;
            }
            match self.writing_buffers.flush_to(&*self.stream_io, remaining) {
                Ok(flush) => {
                    for ctx in flush.ctxs {
                        self.handler.on_data_written(ctx);
                    }
                    match flush.status {
                        ListFlushStatus::Empty => break FlushStatus::Flushed,
                        ListFlushStatus::Wrote {
                            written,
                            offered,
                            emptied,
                        } => {
                            total += written;
                            if emptied {
                                break FlushStatus::Flushed;
                            }
                            if written < offered {
                                break FlushStatus::SystemBufferSaturated;
                            }
                        }
                        ListFlushStatus::WantRead | ListFlushStatus::WantWrite => {
                            break FlushStatus::SystemBufferSaturated
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    break FlushStatus::SystemBufferSaturated
                }
                Err(err) => break FlushStatus::Error(err),
            }
        };
        self.write_state.lock().unwrap().limiter.consume_bytes(total);
        status
    }
}

impl Pollable for StreamConnection {
    fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    fn on_readable(&self) -> EventAction {
        if !self.handshaking.done.load(Ordering::Acquire) {
            match self.do_handshake(HandshakeCaller::Reader) {
                HandshakeOutcome::Done => {}
                HandshakeOutcome::Wait => return EventAction::Ready,
                HandshakeOutcome::Park => return EventAction::Suppress,
                HandshakeOutcome::Failed => return EventAction::Leaving,
            }
        }

        let mut state = self.read_state.lock().unwrap();
        let quota = state.limiter.get_quota();
        if quota == 0 {
            drop(state);
            self.desc.restart_read_in(DEFAULT_TICK);
            return EventAction::Suppress;
        }

        let mut total = 0;
        let mut drained = false;
        let mut eof = false;
        let mut fatal = None;
        while total < quota {
            let room = self.read_buffer_size.saturating_sub(state.buffer.len());
            let want = room.min(quota - total).min(READ_CHUNK);
            if want == 0 {
                // Buffer is full; the consumer below decides whether that
                // is back-pressure or a violation.
                break;
            }
            let mut chunk = BytesMut::zeroed(want);
            match self.stream_io.read_some(&mut chunk) {
                Ok(ReadStatus::ReadSome(n)) => {
                    chunk.truncate(n);
                    state.buffer.append(chunk.freeze());
                    total += n;
                }
                Ok(ReadStatus::EndOfStream) => {
                    eof = true;
                    break;
                }
                Ok(ReadStatus::WantRead) | Ok(ReadStatus::WantWrite) => {
                    drained = true;
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    drained = true;
                    break;
                }
                Err(err) => {
                    fatal = Some(err);
                    break;
                }
            }
        }
        state.limiter.consume_bytes(total);

        let action = self.consume_read_buffer(&mut state);
        drop(state);

        if let Consumed::Killed = action {
            return EventAction::Leaving;
        }
        if let Some(err) = fatal {
            warn!("{}: read failed: {}", self.desc.name(), err);
            self.desc.kill(CleanupReason::Error);
            return EventAction::Leaving;
        }
        if eof {
            self.desc.kill(CleanupReason::Disconnect);
            return EventAction::Leaving;
        }
        if let Consumed::Suppressed = action {
            return EventAction::Suppress;
        }
        if drained {
            return EventAction::Ready;
        }
        // Rate limit (or a still-full buffer) stopped the drain before the
        // kernel did; come back at the next replenishment tick.
        self.desc.restart_read_in(DEFAULT_TICK);
        EventAction::Suppress
    }

    fn on_writable(&self) -> EventAction {
        if !self.handshaking.done.load(Ordering::Acquire) {
            match self.do_handshake(HandshakeCaller::Writer) {
                HandshakeOutcome::Done => {}
                HandshakeOutcome::Wait => return EventAction::Ready,
                HandshakeOutcome::Park => return EventAction::Suppress,
                HandshakeOutcome::Failed => return EventAction::Leaving,
            }
        }

        let quota = self.write_state.lock().unwrap().limiter.get_quota();
        if quota == 0 {
            self.desc.restart_write_in(DEFAULT_TICK);
            return EventAction::Suppress;
        }

        match self.flush_writing_buffer(quota) {
            FlushStatus::Flushed => {
                self.handler.on_write_buffer_empty();
                EventAction::Suppress
            }
            FlushStatus::SystemBufferSaturated => EventAction::Ready,
            FlushStatus::RateLimited => {
                self.desc.restart_write_in(DEFAULT_TICK);
                EventAction::Suppress
            }
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
        if reason == CleanupReason::Disconnect || reason == CleanupReason::UserInitiated {
            // An orderly goodbye; TLS-style layers send their close
            // notification here.
            let _ = self.stream_io.shutdown();
            self.handler.on_close();
        } else {
            self.handler.on_error();
        }
        self.handler.on_detach();
    }
}

impl fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnection")
            .field("descriptor", &self.desc)
            .finish_non_exhaustive()
    }
}
