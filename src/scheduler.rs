use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;

use crate::sys::WakerInternal;
use crate::task::TaskCell;

/// One unit of queued work: a task to poll or a posted closure.
///
/// A runnable moves queued → running → completed-and-released; the
/// scheduler holds one work-count unit for it from enqueue until the run
/// returns.
pub(crate) enum Runnable {
    Task(Arc<TaskCell>),
    Post(Box<dyn FnOnce() + Send>),
}

impl Runnable {
    pub(crate) fn run(self) {
        match self {
            Runnable::Task(task) => TaskCell::run(&task),
            Runnable::Post(f) => f(),
        }
    }
}

/// The per-context ready queue and its lifecycle state.
///
/// Holds the FIFO of runnables, the outstanding-work count, the stopped
/// flag and the wakeup primitive. The reactor-driven `do_one` loop lives
/// on the execution context; everything here is the state it drives.
pub(crate) struct Scheduler {
    queue: Mutex<VecDeque<Runnable>>,
    outstanding_work: AtomicUsize,
    stopped: AtomicBool,
    shutdown: AtomicBool,
    waker: Arc<WakerInternal>,
}

impl Scheduler {
    pub(crate) fn new(waker: Arc<WakerInternal>) -> Scheduler {
        Scheduler {
            queue: Mutex::new(VecDeque::new()),
            outstanding_work: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            waker,
        }
    }

    /// Pushes a runnable and wakes a blocked runner thread.
    ///
    /// After shutdown the runnable is destroyed without running; user
    /// code must not be resumed into a context being torn down.
    pub(crate) fn enqueue(&self, runnable: Runnable) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.work_started();
        {
            let mut queue = self.queue.lock().unwrap();
            queue.push_back(runnable);
        }
        self.wakeup();
    }

    pub(crate) fn pop(&self) -> Option<Runnable> {
        self.queue.lock().unwrap().pop_front()
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding_work.load(Ordering::Acquire)
    }

    /// Executor-facing work accounting: reaching zero stops the context.
    pub(crate) fn on_work_started(&self) {
        self.outstanding_work.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_work_finished(&self) {
        if self.outstanding_work.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.stop();
        }
    }

    /// Service-facing work accounting: tracks pending work without
    /// stopping the context when it reaches zero. Reaching zero still
    /// wakes blocked runners so they can observe the idle context and
    /// return.
    pub(crate) fn work_started(&self) {
        self.outstanding_work.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn work_finished(&self) {
        if self.outstanding_work.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.wakeup();
        }
    }

    pub(crate) fn stop(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            trace!("scheduler stopped");
            self.wakeup();
        }
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn restart(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    /// Wakes one (level-triggered: every) thread blocked in the reactor.
    pub(crate) fn wakeup(&self) {
        if let Err(err) = self.waker.wake() {
            log::error!("failed to wake reactor: {}", err);
        }
    }

    /// Destroys all queued work without running it and resets the work
    /// count. Called once from context teardown.
    pub(crate) fn drain_for_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        loop {
            let runnable = self.queue.lock().unwrap().pop_front();
            match runnable {
                // Dropped outside the lock: dropping a task frame can
                // release I/O objects whose cleanup takes other locks.
                Some(runnable) => drop(runnable),
                None => break,
            }
        }
        self.outstanding_work.store(0, Ordering::Release);
        self.stop();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Whether the calling thread is currently inside `run` (or one of
    /// its variants) on this scheduler.
    pub(crate) fn running_in_this_thread(&self) -> bool {
        let key = self as *const Scheduler as usize;
        CONTEXT_STACK.with(|stack| stack.borrow().iter().any(|entry| *entry == key))
    }
}

thread_local! {
    /// Stack of schedulers the current thread is running. A stack rather
    /// than a single pointer: a handler may run another context's `run`
    /// reentrantly.
    static CONTEXT_STACK: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks the current thread as running `sched` for the guard's lifetime.
pub(crate) struct RunGuard {
    key: usize,
}

impl RunGuard {
    pub(crate) fn new(sched: &Scheduler) -> RunGuard {
        let key = sched as *const Scheduler as usize;
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(key));
        RunGuard { key }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let pos = stack.iter().rposition(|entry| *entry == self.key);
            if let Some(pos) = pos {
                stack.remove(pos);
            }
        });
    }
}

/// Balances one queue-entry work unit around a handler invocation, also
/// on unwind.
pub(crate) struct WorkFinishGuard<'a> {
    pub(crate) sched: &'a Scheduler,
}

impl Drop for WorkFinishGuard<'_> {
    fn drop(&mut self) {
        self.sched.work_finished();
    }
}
