use std::fmt;

use crate::{sys, Token};

/// A readiness event delivered by the selector.
///
/// Thin wrapper around the platform event exposing the accessors the
/// reactor dispatch loop needs. Error and hang-up conditions are folded
/// into both directions: an errored source must wake its reader and its
/// writer so the parked operations can observe the failure through the
/// system call itself.
#[derive(Copy, Clone)]
pub(crate) struct Event(sys::Event);

impl Event {
    pub(crate) fn token(&self) -> Token {
        sys::event::token(&self.0)
    }

    pub(crate) fn wakes_read(&self) -> bool {
        sys::event::is_readable(&self.0)
            || sys::event::is_error(&self.0)
            || sys::event::is_read_closed(&self.0)
    }

    pub(crate) fn wakes_write(&self) -> bool {
        sys::event::is_writable(&self.0)
            || sys::event::is_error(&self.0)
            || sys::event::is_write_closed(&self.0)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("token", &self.token())
            .field("read", &self.wakes_read())
            .field("write", &self.wakes_write())
            .finish()
    }
}

/// A buffer of readiness events filled by one reactor wait.
pub(crate) struct Events {
    inner: sys::Events,
}

impl Events {
    pub(crate) fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: sys::Events::with_capacity(capacity),
        }
    }

    pub(crate) fn sys(&mut self) -> &mut sys::Events {
        &mut self.inner
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.inner.iter().map(|ev| Event(*ev))
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events").field("len", &self.inner.len()).finish()
    }
}
