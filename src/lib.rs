//! Event-loop driven non-blocking I/O with lock-free memory reclamation.
//!
//! evio is the I/O and concurrency substrate of an RPC stack: an
//! edge-triggered event loop, a per-descriptor event state machine that
//! tolerates concurrent killers, non-blocking stream / datagram
//! transceivers with rate limiting and ordered write completion, and the
//! lock-free leaves the read paths above it depend on (hazard pointers,
//! seqlocks and asymmetric memory barriers).
//!
//! # Layering
//!
//! The crate is built leaves-first:
//!
//! * [`barrier`] - compiler, read/write, full and asymmetric fences.
//! * [`Seqlocked`] - publish `Copy` snapshots to lock-free readers.
//! * [`hazptr`] - hazard-pointer domain for lock-free reclamation.
//! * [`TimeKeeper`] - a single worker thread driving one-shot and
//!   recurring timers.
//! * [`EventLoop`] / [`EventLoopGroup`] - edge-triggered readiness
//!   dispatch plus a posted-task queue.
//! * [`Descriptor`] - the per-fd event state machine; concrete
//!   descriptors live in [`net`].
//!
//! # Getting started
//!
//! ```no_run
//! use evio::EventLoopGroup;
//!
//! let group = EventLoopGroup::new(1).unwrap();
//! // ... attach acceptors / connections, then:
//! group.stop();
//! group.join();
//! ```
//!
//! # Notes
//!
//! evio is Unix-only and assumes an edge-triggered readiness notifier
//! (epoll). Descriptor callbacks run on a small worker pool owned by the
//! [`EventLoopGroup`]; at most one callback per descriptor direction is
//! in flight at any time.

#![deny(missing_debug_implementations)]
#![cfg(unix)]

#[macro_use]
mod macros;

mod sys;

mod token;
pub use token::Token;

mod interest;
pub use interest::Interest;

pub mod event;

pub mod barrier;

mod seqlock;
pub use seqlock::Seqlocked;

pub mod hazptr;

mod timer;
pub use timer::{TimeKeeper, TimerId};

mod pool;

mod buffer;
pub use buffer::ChainBuffer;

mod descriptor;
pub use descriptor::{CleanupReason, Descriptor, EventAction, Pollable};

mod event_loop;
pub use event_loop::{EventLoop, EventLoopGroup};

pub mod net;
