//! Outbound queues: append from many producers, drain from one consumer.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Mutex;

use bytes::{Buf, Bytes};

use crate::buffer::ChainBuffer;
use crate::net::stream_io::{StreamIo, WriteStatus};

/// Largest scatter vector handed to one `writev`.
const MAX_IOV: usize = 64;

/// Result of one drain batch on a stream list.
#[derive(Debug)]
pub(crate) enum ListFlushStatus {
    Wrote {
        written: usize,
        /// Bytes offered to the transport in this batch; `written` being
        /// short of this means the system buffer filled up.
        offered: usize,
        emptied: bool,
    },
    /// The transport needs readability to make progress (TLS).
    WantRead,
    /// The transport needs another writability edge.
    WantWrite,
    /// Nothing was pending.
    Empty,
}

pub(crate) struct ListFlush {
    pub(crate) status: ListFlushStatus,
    /// Contexts of chunks that became fully written, in append order.
    pub(crate) ctxs: Vec<u64>,
}

struct PendingWrite {
    buffer: ChainBuffer,
    ctx: u64,
}

/// The stream-connection outbound queue.
///
/// Producers append under the mutex; the single consumer (the write-side
/// event worker) drains batches bounded by the rate-limit quota and the
/// iovec limit. A short write leaves the tail in place; each fully
/// written chunk's context is reported exactly once, in append order.
#[derive(Default)]
pub(crate) struct WritingBufferList {
    buffers: Mutex<VecDeque<PendingWrite>>,
}

impl WritingBufferList {
    pub(crate) fn new() -> WritingBufferList {
        WritingBufferList::default()
    }

    /// Appends a buffer. Returns whether the list was empty before, in
    /// which case the caller is responsible for kicking the writer.
    pub(crate) fn append(&self, buffer: ChainBuffer, ctx: u64) -> bool {
        let mut buffers = self.buffers.lock().unwrap();
        let was_empty = buffers.is_empty();
        buffers.push_back(PendingWrite { buffer, ctx });
        was_empty
    }

    /// Writes one scatter batch of at most `max_bytes` through `io`.
    pub(crate) fn flush_to(&self, io: &dyn StreamIo, max_bytes: usize) -> io::Result<ListFlush> {
        let mut buffers = self.buffers.lock().unwrap();

        // Zero-length chunks carry no bytes but still owe their context
        // notification; retire them up front so the scatter vector below
        // is never empty.
        let mut ctxs = Vec::new();
        while let Some(front) = buffers.front() {
            if !front.buffer.is_empty() {
                break;
            }
            ctxs.push(front.ctx);
            buffers.pop_front();
        }
        if buffers.is_empty() {
            let status = if ctxs.is_empty() {
                ListFlushStatus::Empty
            } else {
                ListFlushStatus::Wrote {
                    written: 0,
                    offered: 0,
                    emptied: true,
                }
            };
            return Ok(ListFlush { status, ctxs });
        }

        let (status, offered) = {
            let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(MAX_IOV);
            let mut budget = max_bytes;
            'gather: for pending in buffers.iter() {
                for chunk in pending.buffer.chunk_iter() {
                    if budget == 0 || slices.len() == MAX_IOV {
                        break 'gather;
                    }
                    let take = chunk.len().min(budget);
                    slices.push(IoSlice::new(&chunk[..take]));
                    budget -= take;
                    if take < chunk.len() {
                        break 'gather;
                    }
                }
            }
            let offered = max_bytes - budget;
            debug_assert!(!slices.is_empty());
            (io.write_some(&slices)?, offered)
        };

        match status {
            WriteStatus::WroteSome(written) => {
                let mut left = written;
                loop {
                    let Some(front) = buffers.front_mut() else {
                        break;
                    };
                    if front.buffer.is_empty() {
                        // A zero-length chunk queued behind a completed
                        // one; it is done as well.
                        ctxs.push(front.ctx);
                        buffers.pop_front();
                        continue;
                    }
                    if left == 0 {
                        break;
                    }
                    let take = front.buffer.len().min(left);
                    front.buffer.advance(take);
                    left -= take;
                    if front.buffer.is_empty() {
                        ctxs.push(front.ctx);
                        buffers.pop_front();
                    }
                }
                debug_assert_eq!(left, 0, "wrote more than was queued");
                Ok(ListFlush {
                    status: ListFlushStatus::Wrote {
                        written,
                        offered,
                        emptied: buffers.is_empty(),
                    },
                    ctxs,
                })
            }
            WriteStatus::WantRead => Ok(ListFlush {
                status: ListFlushStatus::WantRead,
                ctxs,
            }),
            WriteStatus::WantWrite => Ok(ListFlush {
                status: ListFlushStatus::WantWrite,
                ctxs,
            }),
        }
    }
}

impl fmt::Debug for WritingBufferList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buffers = self.buffers.lock().unwrap();
        f.debug_struct("WritingBufferList")
            .field("pending", &buffers.len())
            .finish()
    }
}

/// Result of one datagram flush.
#[derive(Debug)]
pub(crate) enum DatagramFlush {
    Sent { ctx: u64, emptied: bool },
    Empty,
}

/// Like [`WritingBufferList`], specialized for datagrams: each element is
/// sent as one whole datagram, boundaries preserved.
#[derive(Default)]
pub(crate) struct WritingDatagramList {
    buffers: Mutex<VecDeque<(SocketAddr, Bytes, u64)>>,
}

impl WritingDatagramList {
    pub(crate) fn new() -> WritingDatagramList {
        WritingDatagramList::default()
    }

    /// Thread-safe. Returns whether the list was empty before the push.
    pub(crate) fn append(&self, to: SocketAddr, buffer: Bytes, ctx: u64) -> bool {
        let mut buffers = self.buffers.lock().unwrap();
        let was_empty = buffers.is_empty();
        buffers.push_back((to, buffer, ctx));
        was_empty
    }

    /// Sends the frontmost datagram to `fd`. A `WouldBlock` (or any other
    /// error) leaves the datagram queued for retry.
    pub(crate) fn flush_to(&self, fd: RawFd) -> io::Result<DatagramFlush> {
        let mut buffers = self.buffers.lock().unwrap();
        let Some((to, buffer, ctx)) = buffers.front() else {
            return Ok(DatagramFlush::Empty);
        };

        let addr = socket2::SockAddr::from(*to);
        syscall_eintr!(sendto(
            fd,
            buffer.as_ptr() as *const libc::c_void,
            buffer.len(),
            libc::MSG_NOSIGNAL,
            addr.as_ptr() as *const libc::sockaddr,
            addr.len(),
        ))?;

        let ctx = *ctx;
        buffers.pop_front();
        Ok(DatagramFlush::Sent {
            ctx,
            emptied: buffers.is_empty(),
        })
    }
}

impl fmt::Debug for WritingDatagramList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buffers = self.buffers.lock().unwrap();
        f.debug_struct("WritingDatagramList")
            .field("pending", &buffers.len())
            .finish()
    }
}
