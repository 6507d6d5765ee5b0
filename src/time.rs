//! Timers.
//!
//! All timers of a context share one service: a min-heap of expiries
//! keyed by `(expiry, sequence)`. The reactor consults the nearest
//! expiry when computing its wait timeout and the service wakes a
//! blocked reactor whenever a newly scheduled expiry becomes the
//! soonest. Cancelled or replaced entries are deleted lazily: they stay
//! in the heap, invalidated by a generation bump, and are skipped when
//! they surface.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::context::Inner;
use crate::error::canceled;
use crate::sys::WakerInternal;
use crate::{Executor, IoContext, StopToken};

/// The per-context timer queue.
///
/// Lock order: a timer's own state lock is never held while taking the
/// heap lock; the service may take a timer lock while holding the heap
/// lock.
pub(crate) struct TimerService {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    seq: AtomicU64,
    waker: Arc<WakerInternal>,
}

struct HeapEntry {
    when: Instant,
    seq: u64,
    gen: u64,
    timer: Weak<TimerShared>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &HeapEntry) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &HeapEntry) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &HeapEntry) -> CmpOrdering {
        // Reversed: `BinaryHeap` is a max-heap, the earliest entry must
        // surface first. Ties break in schedule order.
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl TimerService {
    pub(crate) fn new(waker: Arc<WakerInternal>) -> TimerService {
        TimerService {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            waker,
        }
    }

    /// Queues an expiry for `timer`. Wakes the reactor when the new
    /// expiry is the soonest so a blocked wait can recompute its
    /// timeout.
    fn schedule(&self, when: Instant, gen: u64, timer: Weak<TimerShared>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let is_earliest = {
            let mut heap = self.heap.lock().unwrap();
            let is_earliest = heap.peek().map_or(true, |top| when < top.when);
            heap.push(HeapEntry {
                when,
                seq,
                gen,
                timer,
            });
            is_earliest
        };
        if is_earliest {
            let _ = self.waker.wake();
        }
    }

    /// The earliest live expiry, or `None` when no timer is pending.
    pub(crate) fn nearest_expiry(&self) -> Option<Instant> {
        let mut heap = self.heap.lock().unwrap();
        while let Some(top) = heap.peek() {
            let live = top
                .timer
                .upgrade()
                .map_or(false, |timer| timer.state.lock().unwrap().gen == top.gen);
            if live {
                return Some(top.when);
            }
            heap.pop();
        }
        None
    }

    /// Clamps a reactor timeout against the nearest expiry:
    /// `min(requested, max(0, nearest - now))`.
    pub(crate) fn clamp_timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        if requested == Some(Duration::ZERO) {
            return requested;
        }
        match self.nearest_expiry() {
            None => requested,
            Some(when) => {
                let remaining = when.saturating_duration_since(Instant::now());
                Some(match requested {
                    None => remaining,
                    Some(requested) => std::cmp::min(requested, remaining),
                })
            }
        }
    }

    /// Completes every wait whose expiry has passed, in `(expiry, seq)`
    /// order, which gives the posting-order guarantee between timers on
    /// one context.
    pub(crate) fn process_expired(&self) {
        let now = Instant::now();
        let mut fired: Vec<(Arc<TimerShared>, u64)> = Vec::new();
        {
            let mut heap = self.heap.lock().unwrap();
            while let Some(top) = heap.peek() {
                if top.when > now {
                    break;
                }
                let entry = heap.pop().expect("peeked entry");
                if let Some(timer) = entry.timer.upgrade() {
                    fired.push((timer, entry.gen));
                }
            }
        }
        for (timer, gen) in fired {
            timer.fire(gen);
        }
    }

    /// Drops all queued entries without completing their waits.
    pub(crate) fn shutdown(&self) {
        self.heap.lock().unwrap().clear();
    }
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerService").finish()
    }
}

pub(crate) struct TimerShared {
    state: Mutex<TimerState>,
}

struct TimerState {
    expiry: Option<Instant>,
    /// Bumped whenever the pending wait is invalidated (cancel, new
    /// expiry, dropped wait); heap entries carry the generation they
    /// were queued under and fire only when it is still current.
    gen: u64,
    queued_gen: Option<u64>,
    waiter: Option<Waker>,
    done: Option<io::Result<()>>,
}

impl TimerShared {
    fn fire(&self, gen: u64) {
        let waker;
        {
            let mut state = self.state.lock().unwrap();
            if state.gen != gen {
                return;
            }
            state.queued_gen = None;
            match state.waiter.take() {
                Some(parked) => {
                    state.done = Some(Ok(()));
                    waker = parked;
                }
                None => return,
            }
        }
        waker.wake();
    }

    /// Completes a pending wait with canceled and invalidates queued
    /// entries. Returns the waker to wake outside the lock.
    fn invalidate(&self) -> Option<Waker> {
        let mut state = self.state.lock().unwrap();
        state.gen += 1;
        state.queued_gen = None;
        match state.waiter.take() {
            Some(waker) => {
                state.done = Some(Err(canceled()));
                Some(waker)
            }
            None => None,
        }
    }
}

/// A monotonic-clock timer.
///
/// A timer carries one expiry and admits one pending [`wait`] at a time.
/// Setting a new expiry while a wait is pending cancels that wait with
/// [`Cond::Canceled`]; waiting on an expiry already in the past
/// completes successfully on the next poll.
///
/// [`wait`]: Timer::wait
/// [`Cond::Canceled`]: crate::Cond::Canceled
///
/// # Examples
///
/// ```
/// use corio::time::Timer;
/// use corio::IoContext;
/// use std::time::Duration;
///
/// # fn main() -> std::io::Result<()> {
/// let ioc = IoContext::new()?;
/// let timer = Timer::new(&ioc);
/// timer.expires_after(Duration::from_millis(10));
/// ioc.spawn(async move {
///     timer.wait().await.unwrap();
/// })
/// .detach();
/// ioc.run();
/// # Ok(())
/// # }
/// ```
pub struct Timer {
    ctx: Arc<Inner>,
    shared: Arc<TimerShared>,
}

impl Timer {
    /// Creates a timer with no expiry set; an immediate [`wait`] on it
    /// completes successfully.
    ///
    /// [`wait`]: Timer::wait
    pub fn new(ctx: &IoContext) -> Timer {
        Timer::with_inner(ctx.inner().clone())
    }

    /// Creates a timer on the executor's context.
    pub fn from_executor(ex: &Executor) -> Timer {
        Timer::with_inner(ex.inner.clone())
    }

    fn with_inner(ctx: Arc<Inner>) -> Timer {
        Timer {
            ctx,
            shared: Arc::new(TimerShared {
                state: Mutex::new(TimerState {
                    expiry: None,
                    gen: 0,
                    queued_gen: None,
                    waiter: None,
                    done: None,
                }),
            }),
        }
    }

    /// Sets the expiry `duration` from now, cancelling a pending wait.
    pub fn expires_after(&self, duration: Duration) {
        self.expires_at(Instant::now() + duration);
    }

    /// Sets an absolute expiry, cancelling a pending wait.
    pub fn expires_at(&self, when: Instant) {
        let waker = self.shared.invalidate();
        self.shared.state.lock().unwrap().expiry = Some(when);
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// The current expiry, if one has been set.
    pub fn expiry(&self) -> Option<Instant> {
        self.shared.state.lock().unwrap().expiry
    }

    /// Cancels a pending wait; it completes with [`Cond::Canceled`].
    /// Idempotent, and a no-op without a pending wait.
    ///
    /// [`Cond::Canceled`]: crate::Cond::Canceled
    pub fn cancel(&self) {
        if let Some(waker) = self.shared.invalidate() {
            waker.wake();
        }
    }

    /// Waits for the timer to expire.
    pub fn wait(&self) -> Wait<'_> {
        Wait {
            timer: self,
            stop: None,
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer").field("expiry", &self.expiry()).finish()
    }
}

/// Future returned by [`Timer::wait`].
#[must_use = "futures do nothing unless awaited"]
pub struct Wait<'a> {
    timer: &'a Timer,
    stop: Option<StopToken>,
}

impl Wait<'_> {
    /// Attaches a stop token. A token signalled before the first poll
    /// completes the wait with canceled without queueing anything.
    pub fn with_stop_token(mut self, token: StopToken) -> Self {
        self.stop = Some(token);
        self
    }
}

impl Future for Wait<'_> {
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let shared = &this.timer.shared;

        let mut schedule = None;
        let ready = {
            let mut state = shared.state.lock().unwrap();
            if let Some(done) = state.done.take() {
                Some(done)
            } else if this.stop.as_ref().map_or(false, |t| t.stop_requested()) {
                state.waiter = None;
                state.gen += 1;
                state.queued_gen = None;
                Some(Err(canceled()))
            } else {
                match state.expiry {
                    Some(when) if when > Instant::now() => {
                        state.waiter = Some(cx.waker().clone());
                        if state.queued_gen != Some(state.gen) {
                            state.queued_gen = Some(state.gen);
                            schedule = Some((when, state.gen));
                        }
                        None
                    }
                    // No expiry, or an expiry already in the past.
                    _ => Some(Ok(())),
                }
            }
        };

        match ready {
            Some(result) => Poll::Ready(result),
            None => {
                // Outside the timer lock; the service may take timer
                // locks while holding the heap lock.
                if let Some((when, gen)) = schedule {
                    this.timer
                        .ctx
                        .timers
                        .schedule(when, gen, Arc::downgrade(shared));
                }
                if let Some(token) = &this.stop {
                    token.register(cx.waker());
                }
                Poll::Pending
            }
        }
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        let mut state = self.timer.shared.state.lock().unwrap();
        state.waiter = None;
        state.done = None;
        state.gen += 1;
        state.queued_gen = None;
    }
}

impl fmt::Debug for Wait<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_stored() {
        let ioc = IoContext::new().unwrap();
        let timer = Timer::new(&ioc);
        assert_eq!(timer.expiry(), None);
        let when = Instant::now() + Duration::from_millis(100);
        timer.expires_at(when);
        assert_eq!(timer.expiry(), Some(when));
    }

    #[test]
    fn nearest_expiry_skips_stale_entries() {
        let ioc = IoContext::new().unwrap();
        let timers = &ioc.inner().timers;
        let timer = Timer::new(&ioc);
        timer.expires_after(Duration::from_millis(50));

        let when = timer.expiry().unwrap();
        let gen = timer.shared.state.lock().unwrap().gen;
        timers.schedule(when, gen, Arc::downgrade(&timer.shared));
        assert_eq!(timers.nearest_expiry(), Some(when));

        // Cancelling bumps the generation; the queued entry is stale.
        timer.cancel();
        assert_eq!(timers.nearest_expiry(), None);
    }
}
