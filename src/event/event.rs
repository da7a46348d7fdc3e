use std::fmt;

use crate::{sys, Token};

/// A readiness event.
///
/// `Event` is a readiness state paired with a [`Token`]. It is returned by
/// [`EventLoop`] polling and consumed by the descriptor dispatch path.
///
/// [`EventLoop`]: crate::EventLoop
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Event {
    inner: sys::unix::Event,
}

impl Event {
    /// Returns the event's token.
    pub fn token(&self) -> Token {
        sys::unix::event::token(&self.inner)
    }

    /// Returns true if the event contains readable readiness.
    pub fn is_readable(&self) -> bool {
        sys::unix::event::is_readable(&self.inner)
    }

    /// Returns true if the event contains writable readiness.
    pub fn is_writable(&self) -> bool {
        sys::unix::event::is_writable(&self.inner)
    }

    /// Returns true if the event contains error readiness.
    ///
    /// Error events are delivered whether or not they were asked for.
    pub fn is_error(&self) -> bool {
        sys::unix::event::is_error(&self.inner)
    }

    /// Converts a system event.
    pub(crate) fn from_sys(sys_event: sys::unix::Event) -> Event {
        Event { inner: sys_event }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("token", &self.token())
            .field("readable", &self.is_readable())
            .field("writable", &self.is_writable())
            .field("error", &self.is_error())
            .finish()
    }
}
