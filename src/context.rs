use std::any::Any;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::event::Events;
use crate::reactor::Reactor;
use crate::scheduler::{RunGuard, Runnable, Scheduler, WorkFinishGuard};
use crate::task::{spawn_on, JoinHandle};
use crate::time::TimerService;
use crate::signal;

/// Readiness events fetched per reactor pass.
const EVENTS_CAPACITY: usize = 64;

/// Bounded runs are sliced into epochs of at most one second so the
/// reactor stays responsive to external stops and wakeups.
const RUN_EPOCH: Duration = Duration::from_secs(1);

/// Shared state behind one execution context: scheduler, reactor, timer
/// heap and the on-demand service registry.
pub(crate) struct Inner {
    pub(crate) sched: Scheduler,
    pub(crate) reactor: Reactor,
    pub(crate) timers: TimerService,
    services: Mutex<Vec<Arc<dyn Service>>>,
}

/// A per-context, per-kind singleton owning all implementations of one
/// I/O object kind. Services participate in context teardown: `shutdown`
/// must destroy pending state without resuming user code and must not
/// panic.
pub(crate) trait Service: Any + Send + Sync {
    fn shutdown(&self);
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl Inner {
    /// Returns the context's `T` service, creating and registering it on
    /// first use. Services are stored in creation order and shut down in
    /// reverse order.
    pub(crate) fn use_service<T, F>(self: &Arc<Self>, make: F) -> Arc<T>
    where
        T: Service,
        F: FnOnce(&Arc<Inner>) -> Arc<T>,
    {
        let mut services = self.services.lock().unwrap();
        for service in services.iter() {
            if let Ok(found) = service.clone().as_any_arc().downcast::<T>() {
                return found;
            }
        }
        let service = make(self);
        services.push(service.clone());
        service
    }

    /// Runs at most one handler. `timeout` of `None` blocks until work
    /// arrives; a bounded timeout returns 0 once it elapses.
    fn do_one(&self, timeout: Option<Duration>, events: &mut Events) -> usize {
        loop {
            if self.sched.stopped() {
                // Cascade: on edge-triggered wakeup backends one wake
                // rouses one waiter, so every leaving runner passes the
                // wakeup on to the next blocked thread.
                self.sched.wakeup();
                return 0;
            }

            if let Some(runnable) = self.sched.pop() {
                // The queue-entry work unit is released around the call,
                // also when the handler panics.
                let _work = WorkFinishGuard { sched: &self.sched };
                runnable.run();
                return 1;
            }

            if self.sched.outstanding() == 0 {
                self.sched.wakeup();
                return 0;
            }

            let effective = self.timers.clamp_timeout(timeout);
            match self.reactor.wait(events, effective) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                    // EINTR: retry for unbounded waits, report no
                    // progress for bounded ones.
                    if timeout.is_none() {
                        continue;
                    }
                    return 0;
                }
                Err(err) => panic!("reactor wait failed: {}", err),
            }

            self.timers.process_expired();
            self.reactor.dispatch(events);
            signal::dispatch_pending();

            if self.sched.stopped() {
                self.sched.wakeup();
                return 0;
            }

            if let Some(runnable) = self.sched.pop() {
                let _work = WorkFinishGuard { sched: &self.sched };
                runnable.run();
                return 1;
            }

            if timeout.is_some() {
                return 0;
            }
        }
    }

    /// Entry check shared by all run variants: a stopped context runs
    /// nothing, an idle context stops itself.
    fn ready_to_run(&self) -> bool {
        if self.sched.stopped() {
            return false;
        }
        if self.sched.outstanding() == 0 {
            self.sched.stop();
            return false;
        }
        true
    }
}

/// An event-driven execution context.
///
/// The context owns the scheduler, the reactor and the per-context
/// services. User code spawns tasks through an [`Executor`] handle and
/// donates threads with one of the `run` variants; every handler runs on
/// a donated thread.
///
/// A context whose outstanding work reaches zero stops itself and `run`
/// returns; [`restart`] must be called before running again, also after
/// an explicit [`stop`].
///
/// [`restart`]: IoContext::restart
/// [`stop`]: IoContext::stop
///
/// # Thread safety
///
/// All methods take `&self`; several threads may donate to `run`
/// concurrently on one context.
pub struct IoContext {
    inner: Arc<Inner>,
    concurrency_hint: usize,
}

impl IoContext {
    /// Creates a context for single-threaded use.
    pub fn new() -> io::Result<IoContext> {
        IoContext::with_concurrency_hint(1)
    }

    /// Creates a context expected to be run by up to `hint` threads.
    ///
    /// The hint does not limit anything; it exists so callers can record
    /// intent and future backends can specialize.
    pub fn with_concurrency_hint(hint: usize) -> io::Result<IoContext> {
        let reactor = Reactor::new()?;
        let waker = reactor.waker();
        Ok(IoContext {
            inner: Arc::new(Inner {
                sched: Scheduler::new(waker.clone()),
                reactor,
                timers: TimerService::new(waker),
                services: Mutex::new(Vec::new()),
            }),
            concurrency_hint: hint,
        })
    }

    /// Returns an executor handle for this context.
    pub fn executor(&self) -> Executor {
        Executor {
            inner: self.inner.clone(),
        }
    }

    /// Spawns a task on this context. See [`Executor::spawn`].
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        spawn_on(&self.inner, future)
    }

    /// Runs handlers until the context is stopped or runs out of work.
    /// Returns the number of handlers executed.
    pub fn run(&self) -> usize {
        if !self.inner.ready_to_run() {
            return 0;
        }
        let _guard = RunGuard::new(&self.inner.sched);
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut n: usize = 0;
        while self.inner.do_one(None, &mut events) > 0 {
            n = n.saturating_add(1);
        }
        n
    }

    /// Runs exactly one handler, blocking until one is available, the
    /// context is stopped, or it runs out of work. Returns 0 or 1.
    pub fn run_one(&self) -> usize {
        if !self.inner.ready_to_run() {
            return 0;
        }
        let _guard = RunGuard::new(&self.inner.sched);
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        self.inner.do_one(None, &mut events)
    }

    /// Runs handlers for at most `duration`.
    pub fn run_for(&self, duration: Duration) -> usize {
        self.run_until(Instant::now() + duration)
    }

    /// Runs handlers until `deadline`.
    pub fn run_until(&self, deadline: Instant) -> usize {
        let mut n: usize = 0;
        while self.run_one_until(deadline) > 0 {
            n = n.saturating_add(1);
        }
        n
    }

    /// Runs at most one handler within `duration`. A zero duration
    /// returns 0 immediately.
    pub fn run_one_for(&self, duration: Duration) -> usize {
        self.run_one_until(Instant::now() + duration)
    }

    /// Runs at most one handler, waiting no later than `deadline`.
    pub fn run_one_until(&self, deadline: Instant) -> usize {
        let mut now = Instant::now();
        while now < deadline {
            let slice = std::cmp::min(deadline - now, RUN_EPOCH);
            if !self.inner.ready_to_run() {
                return 0;
            }
            let n = {
                let _guard = RunGuard::new(&self.inner.sched);
                let mut events = Events::with_capacity(EVENTS_CAPACITY);
                self.inner.do_one(Some(slice), &mut events)
            };
            if n > 0 || self.stopped() {
                return n;
            }
            now = Instant::now();
        }
        0
    }

    /// Runs all handlers that are ready without blocking.
    pub fn poll(&self) -> usize {
        if !self.inner.ready_to_run() {
            return 0;
        }
        let _guard = RunGuard::new(&self.inner.sched);
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut n: usize = 0;
        while self.inner.do_one(Some(Duration::ZERO), &mut events) > 0 {
            n = n.saturating_add(1);
        }
        n
    }

    /// Runs at most one ready handler without blocking.
    pub fn poll_one(&self) -> usize {
        if !self.inner.ready_to_run() {
            return 0;
        }
        let _guard = RunGuard::new(&self.inner.sched);
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        self.inner.do_one(Some(Duration::ZERO), &mut events)
    }

    /// Signals the context to stop; `run` returns as soon as possible.
    /// Pending work stays queued.
    pub fn stop(&self) {
        self.inner.sched.stop();
    }

    /// Whether [`stop`](IoContext::stop) has been requested (or the
    /// context ran out of work) and [`restart`](IoContext::restart) has
    /// not been called since.
    pub fn stopped(&self) -> bool {
        self.inner.sched.stopped()
    }

    /// Clears the stopped flag so the context can run again.
    pub fn restart(&self) {
        self.inner.sched.restart();
    }

    /// The concurrency hint the context was built with.
    pub fn concurrency_hint(&self) -> usize {
        self.concurrency_hint
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        self.inner.sched.stop();
        // Reverse creation order; shutdown never panics and must not
        // resume user code.
        let services: Vec<Arc<dyn Service>> = {
            let mut services = self.inner.services.lock().unwrap();
            services.drain(..).collect()
        };
        for service in services.iter().rev() {
            service.shutdown();
        }
        self.inner.timers.shutdown();
        self.inner.sched.drain_for_shutdown();
    }
}

impl fmt::Debug for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoContext")
            .field("stopped", &self.stopped())
            .field("concurrency_hint", &self.concurrency_hint)
            .finish()
    }
}

/// A lightweight handle dispatching work to an [`IoContext`].
///
/// Executors are cheap to clone and compare equal when they refer to the
/// same context. The executor outlives its context gracefully: work
/// submitted after teardown is destroyed without running.
#[derive(Clone)]
pub struct Executor {
    pub(crate) inner: Arc<Inner>,
}

impl Executor {
    /// Spawns `future` as a task on this executor's context.
    ///
    /// Tasks are lazy: nothing runs until a thread donates itself to one
    /// of the context's `run` variants. The returned [`JoinHandle`]
    /// yields the task's output; dropping it detaches the task.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        spawn_on(&self.inner, future)
    }

    /// Enqueues `f` for deferred execution on this context.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.sched.enqueue(Runnable::Post(Box::new(f)));
    }

    /// Runs `f` inline when called from a thread inside this context's
    /// `run`, otherwise posts it.
    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.running_in_this_thread() {
            f();
        } else {
            self.post(f);
        }
    }

    /// Whether the calling thread is currently running this context.
    pub fn running_in_this_thread(&self) -> bool {
        self.inner.sched.running_in_this_thread()
    }

    /// Pins the context's `run` open for the guard's lifetime, even when
    /// no task or handler is outstanding.
    pub fn work_guard(&self) -> WorkGuard {
        self.inner.sched.on_work_started();
        WorkGuard {
            ex: self.clone(),
        }
    }

}

impl PartialEq for Executor {
    fn eq(&self, other: &Executor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Executor {}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor").finish()
    }
}

/// Keeps a context's `run` from returning while alive.
///
/// Created by [`Executor::work_guard`]. Dropping the guard releases the
/// work unit; when it was the last one the context stops.
#[must_use = "dropping a WorkGuard immediately releases the work it represents"]
pub struct WorkGuard {
    ex: Executor,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.ex.inner.sched.on_work_finished();
    }
}

impl fmt::Debug for WorkGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkGuard").finish()
    }
}
