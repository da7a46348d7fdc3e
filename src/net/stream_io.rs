//! The pluggable stream I/O layer.
//!
//! `StreamIo` sits between a stream connection and its socket. The plain
//! TCP implementation forwards to read / write syscalls; a TLS-style
//! implementation additionally runs a handshake and may ask for the
//! opposite direction's readiness while (re)negotiating.

use std::io::{self, IoSlice};
use std::os::fd::RawFd;

/// Result of a handshake or shutdown step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    Success,
    /// Progress needs incoming data; retry on readability.
    WantRead,
    /// Progress needs outgoing buffer space; retry on writability.
    WantWrite,
}

/// Result of a non-blocking read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadStatus {
    ReadSome(usize),
    /// The layer needs more incoming bytes before producing data.
    WantRead,
    /// The layer must write before it can produce data.
    WantWrite,
    /// The peer closed the stream cleanly.
    EndOfStream,
}

/// Result of a non-blocking vectored write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    WroteSome(usize),
    WantRead,
    WantWrite,
}

/// Non-blocking byte transport under a stream connection.
///
/// Syscall-level failures surface as `io::Error`; `WouldBlock` ends a
/// drain and is not an error. The `Want*` statuses are for layers (TLS)
/// whose progress is coupled across directions; the plain TCP
/// implementation never returns them from `read_some` / `write_some`.
pub trait StreamIo: Send + Sync {
    /// Drives the handshake one step.
    fn handshake(&self) -> io::Result<HandshakeStatus>;

    /// Reads at most `buf.len()` bytes.
    fn read_some(&self, buf: &mut [u8]) -> io::Result<ReadStatus>;

    /// Writes from `bufs`, which must be non-empty.
    fn write_some(&self, bufs: &[IoSlice<'_>]) -> io::Result<WriteStatus>;

    /// Starts an orderly shutdown of the outgoing direction.
    fn shutdown(&self) -> io::Result<HandshakeStatus>;
}

/// Plain TCP: reads and writes are direct syscalls, there is no handshake.
#[derive(Debug)]
pub struct SystemStreamIo {
    fd: RawFd,
}

impl SystemStreamIo {
    pub fn new(fd: RawFd) -> SystemStreamIo {
        SystemStreamIo { fd }
    }
}

impl StreamIo for SystemStreamIo {
    fn handshake(&self) -> io::Result<HandshakeStatus> {
        // Nothing to negotiate.
        Ok(HandshakeStatus::Success)
    }

    fn read_some(&self, buf: &mut [u8]) -> io::Result<ReadStatus> {
        let n = syscall_eintr!(read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()))?;
        if n == 0 {
            Ok(ReadStatus::EndOfStream)
        } else {
            Ok(ReadStatus::ReadSome(n as usize))
        }
    }

    fn write_some(&self, bufs: &[IoSlice<'_>]) -> io::Result<WriteStatus> {
        debug_assert!(!bufs.is_empty());
        // `IoSlice` is ABI-compatible with `iovec`.
        let n = syscall_eintr!(writev(
            self.fd,
            bufs.as_ptr() as *const libc::iovec,
            bufs.len().min(libc::c_int::MAX as usize) as libc::c_int,
        ))?;
        Ok(WriteStatus::WroteSome(n as usize))
    }

    fn shutdown(&self) -> io::Result<HandshakeStatus> {
        match syscall!(shutdown(self.fd, libc::SHUT_WR)) {
            Ok(_) => Ok(HandshakeStatus::Success),
            // The peer may already be gone; that is still a shutdown.
            Err(ref err) if err.raw_os_error() == Some(libc::ENOTCONN) => {
                Ok(HandshakeStatus::Success)
            }
            Err(err) => Err(err),
        }
    }
}
