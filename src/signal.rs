//! POSIX signal sets.
//!
//! Signal state is process-wide: a per-signal registration count decides
//! when this crate's handler is installed via `sigaction(2)` and when
//! the default disposition is restored. The handler itself is
//! async-signal-safe — it bumps an atomic pending counter and writes
//! each registered context's wakeup descriptor — and all delivery
//! bookkeeping happens later on scheduler threads: every registered set
//! in every context either completes its pending wait or accumulates an
//! undelivered count that resolves the next wait immediately.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

use log::{trace, warn};

use crate::context::{Inner, Service};
use crate::error::canceled;
use crate::{Executor, IoContext, StopToken};

/// Highest observable signal number (exclusive).
const MAX_SIGNAL_NUMBER: usize = 32;
/// Capacity of the wakeup-descriptor table the handler writes.
const MAX_CONTEXTS: usize = 64;

#[allow(clippy::declare_interior_mutable_const)]
const PENDING_ZERO: AtomicUsize = AtomicUsize::new(0);
#[allow(clippy::declare_interior_mutable_const)]
const FD_NONE: AtomicI32 = AtomicI32::new(-1);

/// Set by the handler, consumed by [`dispatch_pending`].
static PENDING_ANY: AtomicBool = AtomicBool::new(false);
/// Per-signal raise counts not yet dispatched.
static PENDING: [AtomicUsize; MAX_SIGNAL_NUMBER] = [PENDING_ZERO; MAX_SIGNAL_NUMBER];
/// Wakeup descriptors of live contexts, written from the handler.
static WAKER_FDS: [AtomicI32; MAX_CONTEXTS] = [FD_NONE; MAX_CONTEXTS];

struct GlobalState {
    counts: [usize; MAX_SIGNAL_NUMBER],
    services: Vec<Weak<SignalService>>,
}

/// Registration bookkeeping. Lock order: `GLOBAL` before any service or
/// set lock, never after.
static GLOBAL: Mutex<GlobalState> = Mutex::new(GlobalState {
    counts: [0; MAX_SIGNAL_NUMBER],
    services: Vec::new(),
});

// Only async-signal-safe operations: atomics and write(2).
extern "C" fn signal_handler(signo: libc::c_int) {
    let index = signo as usize;
    if index == 0 || index >= MAX_SIGNAL_NUMBER {
        return;
    }
    PENDING[index].fetch_add(1, Ordering::SeqCst);
    PENDING_ANY.store(true, Ordering::SeqCst);

    let payload = 1u64.to_ne_bytes();
    for slot in WAKER_FDS.iter() {
        let fd = slot.load(Ordering::SeqCst);
        if fd >= 0 {
            let _ = unsafe {
                libc::write(fd, payload.as_ptr() as *const libc::c_void, payload.len())
            };
        }
    }
}

fn install_handler(signo: usize) -> io::Result<()> {
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = signal_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
        act.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut act.sa_mask);
        if libc::sigaction(signo as libc::c_int, &act, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    trace!("installed handler for signal {}", signo);
    Ok(())
}

fn restore_default(signo: usize) {
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut act.sa_mask);
        let _ = libc::sigaction(signo as libc::c_int, &act, std::ptr::null_mut());
    }
    trace!("restored default disposition for signal {}", signo);
}

/// Drains raises recorded by the handler and delivers them to every
/// registered set in every context. Called once per scheduler cycle;
/// cheap when nothing is pending.
pub(crate) fn dispatch_pending() {
    if !PENDING_ANY.swap(false, Ordering::SeqCst) {
        return;
    }

    let services: Vec<Arc<SignalService>> = {
        let mut global = GLOBAL.lock().unwrap();
        global.services.retain(|weak| weak.strong_count() > 0);
        global.services.iter().filter_map(Weak::upgrade).collect()
    };

    for signo in 1..MAX_SIGNAL_NUMBER {
        let mut raises = PENDING[signo].swap(0, Ordering::SeqCst);
        while raises > 0 {
            raises -= 1;
            for service in &services {
                service.deliver(signo as i32);
            }
        }
    }
}

/// The per-context signal service: the list of live sets plus this
/// context's slot in the process-wide wakeup table.
pub(crate) struct SignalService {
    sets: Mutex<Vec<Weak<SignalSetShared>>>,
    slot: usize,
    /// Keeps the wakeup descriptor alive for as long as the handler may
    /// find it in the table; the slot is cleared before this drops.
    #[allow(dead_code)]
    wake: Arc<crate::sys::WakerInternal>,
}

impl SignalService {
    fn create(inner: &Arc<Inner>) -> Arc<SignalService> {
        let wake = inner.reactor.waker();
        let mut slot = MAX_CONTEXTS;
        for (index, entry) in WAKER_FDS.iter().enumerate() {
            if entry
                .compare_exchange(-1, wake.wake_fd(), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                slot = index;
                break;
            }
        }
        if slot == MAX_CONTEXTS {
            // Delivery still happens on the next natural reactor pass.
            warn!("signal wakeup table full; delivery to this context may lag");
        }
        let service = Arc::new(SignalService {
            sets: Mutex::new(Vec::new()),
            slot,
            wake,
        });
        GLOBAL
            .lock()
            .unwrap()
            .services
            .push(Arc::downgrade(&service));
        service
    }

    fn adopt(&self, set: &Arc<SignalSetShared>) {
        let mut sets = self.sets.lock().unwrap();
        sets.retain(|weak| weak.strong_count() > 0);
        sets.push(Arc::downgrade(set));
    }

    fn deliver(&self, signo: i32) {
        let sets: Vec<Arc<SignalSetShared>> = {
            let sets = self.sets.lock().unwrap();
            sets.iter().filter_map(Weak::upgrade).collect()
        };
        for set in sets {
            set.deliver(signo);
        }
    }
}

impl Service for SignalService {
    fn shutdown(&self) {
        // Pending waits are destroyed without resuming user code;
        // registrations are released so other processes' state (handler
        // install counts) stays balanced.
        let sets = std::mem::take(&mut *self.sets.lock().unwrap());
        let mut global = GLOBAL.lock().unwrap();
        for weak in sets {
            if let Some(set) = weak.upgrade() {
                let mut state = set.state.lock().unwrap();
                state.waiter = None;
                state.done = None;
                release_registrations(&mut global, &mut state);
            }
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

impl Drop for SignalService {
    fn drop(&mut self) {
        if self.slot < MAX_CONTEXTS {
            WAKER_FDS[self.slot].store(-1, Ordering::SeqCst);
        }
        let mut global = GLOBAL.lock().unwrap();
        global.services.retain(|weak| weak.strong_count() > 0);
    }
}

fn release_registrations(global: &mut GlobalState, state: &mut SetState) {
    for (&signo, _) in state.signals.iter() {
        let index = signo as usize;
        global.counts[index] -= 1;
        if global.counts[index] == 0 {
            restore_default(index);
        }
    }
    state.signals.clear();
}

pub(crate) struct SignalSetShared {
    state: Mutex<SetState>,
}

struct SetState {
    /// Registered signal numbers with their undelivered counts.
    signals: BTreeMap<i32, u64>,
    waiter: Option<Waker>,
    done: Option<io::Result<i32>>,
}

impl SignalSetShared {
    fn deliver(&self, signo: i32) {
        let waker = {
            let mut state = self.state.lock().unwrap();
            if !state.signals.contains_key(&signo) {
                return;
            }
            match state.waiter.take() {
                Some(waker) => {
                    state.done = Some(Ok(signo));
                    Some(waker)
                }
                None => {
                    if let Some(count) = state.signals.get_mut(&signo) {
                        *count += 1;
                    }
                    None
                }
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn cancel(&self) {
        let waker = {
            let mut state = self.state.lock().unwrap();
            match state.waiter.take() {
                Some(waker) => {
                    state.done = Some(Err(canceled()));
                    Some(waker)
                }
                None => None,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// A set of signals delivered to one execution context.
///
/// Raising a registered signal completes exactly one pending [`wait`]
/// per set with the signal number; without a pending wait the delivery
/// is queued and the next wait resolves immediately. At most one wait
/// may be pending per set.
///
/// [`wait`]: SignalSet::wait
///
/// # Examples
///
/// ```
/// use corio::signal::SignalSet;
/// use corio::IoContext;
///
/// # fn main() -> std::io::Result<()> {
/// let ioc = IoContext::new()?;
/// let signals = SignalSet::new(&ioc);
/// signals.add(libc::SIGUSR1)?;
/// # Ok(())
/// # }
/// ```
pub struct SignalSet {
    service: Arc<SignalService>,
    shared: Arc<SignalSetShared>,
}

impl SignalSet {
    /// Creates an empty signal set on `ctx`.
    pub fn new(ctx: &IoContext) -> SignalSet {
        SignalSet::with_inner(ctx.inner())
    }

    /// Creates an empty signal set on the executor's context.
    pub fn from_executor(ex: &Executor) -> SignalSet {
        SignalSet::with_inner(&ex.inner)
    }

    fn with_inner(inner: &Arc<Inner>) -> SignalSet {
        let service = inner.use_service(SignalService::create);
        let shared = Arc::new(SignalSetShared {
            state: Mutex::new(SetState {
                signals: BTreeMap::new(),
                waiter: None,
                done: None,
            }),
        });
        service.adopt(&shared);
        SignalSet { service, shared }
    }

    /// Adds `signo` to the set, installing the process handler on the
    /// first registration of that signal anywhere in the process.
    /// Adding a signal twice is a no-op.
    pub fn add(&self, signo: i32) -> io::Result<()> {
        validate(signo)?;
        let index = signo as usize;
        let mut global = GLOBAL.lock().unwrap();
        let mut state = self.shared.state.lock().unwrap();
        if state.signals.contains_key(&signo) {
            return Ok(());
        }
        if global.counts[index] == 0 {
            install_handler(index)?;
        }
        global.counts[index] += 1;
        state.signals.insert(signo, 0);
        Ok(())
    }

    /// Removes `signo` from the set, restoring the default disposition
    /// on the last registration in the process. Removing an absent
    /// signal is a no-op.
    pub fn remove(&self, signo: i32) -> io::Result<()> {
        validate(signo)?;
        let index = signo as usize;
        let mut global = GLOBAL.lock().unwrap();
        let mut state = self.shared.state.lock().unwrap();
        if state.signals.remove(&signo).is_none() {
            return Ok(());
        }
        global.counts[index] -= 1;
        if global.counts[index] == 0 {
            restore_default(index);
        }
        Ok(())
    }

    /// Removes every signal from the set.
    pub fn clear(&self) {
        let mut global = GLOBAL.lock().unwrap();
        let mut state = self.shared.state.lock().unwrap();
        release_registrations(&mut global, &mut state);
    }

    /// Cancels a pending wait; it completes with [`Cond::Canceled`].
    /// Idempotent, a no-op without a pending wait.
    ///
    /// [`Cond::Canceled`]: crate::Cond::Canceled
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Waits for any signal in the set, yielding its number.
    pub fn wait(&self) -> SignalWait<'_> {
        SignalWait {
            set: self,
            stop: None,
        }
    }
}

impl Drop for SignalSet {
    fn drop(&mut self) {
        self.cancel();
        self.clear();
        let mut sets = self.service.sets.lock().unwrap();
        sets.retain(|weak| weak.strong_count() > 0);
    }
}

impl fmt::Debug for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock().unwrap();
        f.debug_struct("SignalSet")
            .field("signals", &state.signals.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn validate(signo: i32) -> io::Result<()> {
    if signo <= 0 || signo as usize >= MAX_SIGNAL_NUMBER {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "signal number out of range",
        ));
    }
    Ok(())
}

/// Future returned by [`SignalSet::wait`].
#[must_use = "futures do nothing unless awaited"]
pub struct SignalWait<'a> {
    set: &'a SignalSet,
    stop: Option<StopToken>,
}

impl SignalWait<'_> {
    /// Attaches a stop token; a token signalled before the first poll
    /// completes with canceled without registering anything.
    pub fn with_stop_token(mut self, token: StopToken) -> Self {
        self.stop = Some(token);
        self
    }
}

impl Future for SignalWait<'_> {
    type Output = io::Result<i32>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<i32>> {
        let this = self.get_mut();
        {
            let mut state = this.set.shared.state.lock().unwrap();
            if let Some(done) = state.done.take() {
                return Poll::Ready(done);
            }
            if this.stop.as_ref().map_or(false, |t| t.stop_requested()) {
                state.waiter = None;
                return Poll::Ready(Err(canceled()));
            }
            // A queued delivery resolves the wait immediately.
            if let Some((&signo, count)) =
                state.signals.iter_mut().find(|(_, count)| **count > 0)
            {
                *count -= 1;
                return Poll::Ready(Ok(signo));
            }
            state.waiter = Some(cx.waker().clone());
        }
        if let Some(token) = &this.stop {
            token.register(cx.waker());
        }
        Poll::Pending
    }
}

impl Drop for SignalWait<'_> {
    fn drop(&mut self) {
        let mut state = self.set.shared.state.lock().unwrap();
        state.waiter = None;
        // A delivery that raced this drop is pushed back as undelivered
        // rather than lost.
        if let Some(Ok(signo)) = state.done.take() {
            if let Some(count) = state.signals.get_mut(&signo) {
                *count += 1;
            }
        }
    }
}

impl fmt::Debug for SignalWait<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalWait").finish()
    }
}
