use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::task::Waker;
use std::time::Duration;

use log::trace;
use slab::Slab;

use crate::event::Events;
use crate::sys::{Selector, WakerInternal};
use crate::{Interest, Token};

/// Token reserved for the reactor's own wakeup object; slab keys grow
/// from zero and can never collide with it.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Which half of an I/O object an operation drives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Dir {
    Read,
    Write,
}

/// Per-registration state shared between an I/O object and the reactor's
/// source table.
///
/// Operations park their task waker in the direction they drive; the
/// dispatch loop takes the waker when the OS reports readiness. A parked
/// direction holds the fd registered with the selector; once both
/// directions are empty the fd is deregistered again (one-shot
/// semantics: the woken operation re-arms after its next `WouldBlock`).
pub(crate) struct Source {
    fd: RawFd,
    token: Token,
    state: Mutex<SourceState>,
}

#[derive(Default)]
struct SourceState {
    read: DirSlot,
    write: DirSlot,
    armed: Option<Interest>,
}

#[derive(Default)]
struct DirSlot {
    waker: Option<Waker>,
    canceled: bool,
}

impl SourceState {
    fn slot_mut(&mut self, dir: Dir) -> &mut DirSlot {
        match dir {
            Dir::Read => &mut self.read,
            Dir::Write => &mut self.write,
        }
    }

    fn needed(&self) -> Option<Interest> {
        match (self.read.waker.is_some(), self.write.waker.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Translates OS readiness into task wakeups.
pub(crate) struct Reactor {
    selector: Selector,
    waker: Arc<WakerInternal>,
    sources: Mutex<Slab<Arc<Source>>>,
}

impl Reactor {
    pub(crate) fn new() -> io::Result<Reactor> {
        let selector = Selector::new()?;
        let waker = Arc::new(WakerInternal::new()?);
        selector.register(waker.as_raw_fd(), WAKE_TOKEN, Interest::READABLE)?;
        Ok(Reactor {
            selector,
            waker,
            sources: Mutex::new(Slab::new()),
        })
    }

    /// The wakeup primitive, shared with the scheduler and the timer
    /// service.
    pub(crate) fn waker(&self) -> Arc<WakerInternal> {
        self.waker.clone()
    }

    /// Adds `fd` to the source table. The fd is not armed with the
    /// selector until an operation parks on it.
    pub(crate) fn register_source(&self, fd: RawFd) -> Arc<Source> {
        let mut sources = self.sources.lock().unwrap();
        let entry = sources.vacant_entry();
        let source = Arc::new(Source {
            fd,
            token: Token(entry.key()),
            state: Mutex::new(SourceState::default()),
        });
        entry.insert(source.clone());
        trace!("registered source fd={} token={:?}", fd, source.token);
        source
    }

    /// Cancels parked operations and removes `source` from the table.
    /// The caller closes the fd afterwards.
    pub(crate) fn remove_source(&self, source: &Arc<Source>) {
        self.cancel(source);
        let mut sources = self.sources.lock().unwrap();
        if sources.contains(source.token.0) {
            sources.remove(source.token.0);
        }
        trace!("removed source fd={} token={:?}", source.fd, source.token);
    }

    /// Marks parked operations cancelled and wakes them; they observe
    /// the flag through [`Reactor::take_cancel`] on their next poll.
    /// Idempotent: a direction with nothing parked is left untouched.
    pub(crate) fn cancel(&self, source: &Source) {
        let read;
        let write;
        {
            let mut state = source.state.lock().unwrap();
            read = state.read.waker.take();
            if read.is_some() {
                state.read.canceled = true;
            }
            write = state.write.waker.take();
            if write.is_some() {
                state.write.canceled = true;
            }
            if state.armed.take().is_some() {
                let _ = self.selector.deregister(source.fd);
            }
        }
        if let Some(waker) = read {
            waker.wake();
        }
        if let Some(waker) = write {
            waker.wake();
        }
    }

    /// Consumes a pending cancellation for one direction.
    pub(crate) fn take_cancel(&self, source: &Source, dir: Dir) -> bool {
        let mut state = source.state.lock().unwrap();
        let slot = state.slot_mut(dir);
        if slot.canceled {
            slot.canceled = false;
            true
        } else {
            false
        }
    }

    /// Parks `waker` for `dir` and arms the fd with the selector.
    pub(crate) fn arm(&self, source: &Source, dir: Dir, waker: &Waker) -> io::Result<()> {
        let mut state = source.state.lock().unwrap();
        {
            let slot = state.slot_mut(dir);
            debug_assert!(
                slot.waker.as_ref().map_or(true, |w| w.will_wake(waker)),
                "two concurrent operations in the same direction on one I/O object"
            );
            slot.waker = Some(waker.clone());
        }
        // `needed` cannot be `None`: a waker was just parked.
        if let Some(needed) = state.needed() {
            if state.armed != Some(needed) {
                match state.armed {
                    None => self.selector.register(source.fd, source.token, needed)?,
                    Some(_) => self.selector.reregister(source.fd, source.token, needed)?,
                }
                state.armed = Some(needed);
            }
        }
        Ok(())
    }

    /// Clears a parked waker without completing the operation; used when
    /// an operation future is dropped mid-flight.
    pub(crate) fn disarm(&self, source: &Source, dir: Dir) {
        let mut state = source.state.lock().unwrap();
        {
            let slot = state.slot_mut(dir);
            slot.waker = None;
            slot.canceled = false;
        }
        let needed = state.needed();
        if needed != state.armed {
            match needed {
                None => {
                    if state.armed.is_some() {
                        let _ = self.selector.deregister(source.fd);
                    }
                }
                Some(interest) => {
                    let _ = self.selector.reregister(source.fd, source.token, interest);
                }
            }
            state.armed = needed;
        }
    }

    /// Blocks until readiness, wakeup or timeout.
    pub(crate) fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.selector.select(events.sys(), timeout)
    }

    /// Converts readiness events into task wakeups. Returns the number
    /// of operations woken.
    pub(crate) fn dispatch(&self, events: &Events) -> usize {
        let mut woken = 0;
        for event in events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                // Wakeup-fd readiness is not I/O; drain and ignore.
                self.waker.drain();
                continue;
            }

            let source = {
                let sources = self.sources.lock().unwrap();
                sources.get(token.0).cloned()
            };
            // A missing entry means the object was dropped with an event
            // in flight; with slab key reuse a stale event can also reach
            // an unrelated new source. Both produce at most a spurious
            // wakeup, which operations absorb by retrying.
            let Some(source) = source else { continue };

            let mut read = None;
            let mut write = None;
            {
                let mut state = source.state.lock().unwrap();
                if event.wakes_read() {
                    read = state.read.waker.take();
                }
                if event.wakes_write() {
                    write = state.write.waker.take();
                }
                let needed = state.needed();
                if needed != state.armed {
                    // One-shot: deregister (or narrow) before the woken
                    // operation performs its system call.
                    match needed {
                        None => {
                            let _ = self.selector.deregister(source.fd);
                        }
                        Some(interest) => {
                            let _ =
                                self.selector.reregister(source.fd, source.token, interest);
                        }
                    }
                    state.armed = needed;
                }
            }
            if let Some(waker) = read {
                waker.wake();
                woken += 1;
            }
            if let Some(waker) = write {
                waker.wake();
                woken += 1;
            }
        }
        woken
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor").finish()
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("fd", &self.fd)
            .field("token", &self.token)
            .finish()
    }
}
