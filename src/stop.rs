use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Waker;

/// Owner side of a cooperative cancellation channel.
///
/// Requesting a stop marks every associated [`StopToken`] and wakes the
/// operations observing them. Stopping is cooperative: the operation
/// itself completes with [`Cond::Canceled`] the next time it runs; no OS
/// state is torn down by the token alone.
///
/// [`Cond::Canceled`]: crate::Cond::Canceled
///
/// # Examples
///
/// ```
/// use corio::StopSource;
///
/// let source = StopSource::new();
/// let token = source.token();
/// assert!(!token.stop_requested());
/// source.request_stop();
/// assert!(token.stop_requested());
/// ```
#[derive(Clone)]
pub struct StopSource {
    inner: Arc<StopInner>,
}

/// Observer side of a cooperative cancellation channel.
///
/// Obtained from [`StopSource::token`] and attached to operation futures
/// with their `with_stop_token` builder. A token signalled before an
/// operation first runs makes it complete with canceled without touching
/// the OS at all.
#[derive(Clone)]
pub struct StopToken {
    inner: Arc<StopInner>,
}

struct StopInner {
    stopped: AtomicBool,
    wakers: Mutex<Vec<Waker>>,
}

impl StopSource {
    /// Creates a new stop source with its own stop state.
    pub fn new() -> StopSource {
        StopSource {
            inner: Arc::new(StopInner {
                stopped: AtomicBool::new(false),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> StopToken {
        StopToken {
            inner: self.inner.clone(),
        }
    }

    /// Requests a stop, waking every parked observer.
    ///
    /// Returns `true` the first time a stop is requested on this state,
    /// `false` on later calls.
    pub fn request_stop(&self) -> bool {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        let wakers = std::mem::take(&mut *self.inner.wakers.lock().unwrap());
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Returns `true` once a stop has been requested.
    pub fn stop_requested(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

impl Default for StopSource {
    fn default() -> StopSource {
        StopSource::new()
    }
}

impl StopToken {
    /// Returns `true` once the associated source requested a stop.
    pub fn stop_requested(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Parks `waker` to be woken when a stop is requested.
    ///
    /// If the stop already happened the waker is woken immediately.
    pub(crate) fn register(&self, waker: &Waker) {
        if self.stop_requested() {
            waker.wake_by_ref();
            return;
        }
        let mut wakers = self.inner.wakers.lock().unwrap();
        // Late check under the lock so a concurrent `request_stop` cannot
        // miss this registration.
        if self.inner.stopped.load(Ordering::Acquire) {
            drop(wakers);
            waker.wake_by_ref();
            return;
        }
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }
}

impl fmt::Debug for StopSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSource")
            .field("stop_requested", &self.stop_requested())
            .finish()
    }
}

impl fmt::Debug for StopToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopToken")
            .field("stop_requested", &self.stop_requested())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_is_sticky_and_idempotent() {
        let source = StopSource::new();
        let token = source.token();
        assert!(!token.stop_requested());
        assert!(source.request_stop());
        assert!(!source.request_stop());
        assert!(token.stop_requested());
        assert!(token.clone().stop_requested());
    }
}
