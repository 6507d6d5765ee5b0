use std::cell::UnsafeCell;
use std::fmt;
use std::future::Future;
use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::thread;

use crate::context::Inner;
use crate::frame::FrameBox;
use crate::scheduler::Runnable;
use crate::Executor;

// Task run states. A task is lazy: it sits QUEUED from spawn until the
// scheduler polls it, then bounces between IDLE (suspended) and QUEUED
// (woken) until its frame completes.
const IDLE: u8 = 0;
const QUEUED: u8 = 1;
const RUNNING: u8 = 2;
const WOKEN: u8 = 3;
const COMPLETE: u8 = 4;

/// A spawned task: the type-erased frame plus the run-state machine.
///
/// The waker handed to every poll is built over an `Arc<TaskCell>`; it
/// is the type-erased dispatcher of this runtime. Waking from any thread
/// re-enqueues the task on its home scheduler, which is how completions
/// always resume on the correct context.
pub(crate) struct TaskCell {
    ctx: Weak<Inner>,
    state: AtomicU8,
    frame: UnsafeCell<Option<FrameBox>>,
}

// The frame is only touched by the thread that owns the RUNNING state,
// or after all other references are gone.
unsafe impl Send for TaskCell {}
unsafe impl Sync for TaskCell {}

impl TaskCell {
    pub(crate) fn wake(cell: &Arc<TaskCell>) {
        let mut state = cell.state.load(Ordering::Acquire);
        loop {
            match state {
                IDLE => {
                    match cell.state.compare_exchange(
                        IDLE,
                        QUEUED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            if let Some(inner) = cell.ctx.upgrade() {
                                inner.sched.enqueue(Runnable::Task(cell.clone()));
                            }
                            return;
                        }
                        Err(actual) => state = actual,
                    }
                }
                RUNNING => {
                    match cell.state.compare_exchange(
                        RUNNING,
                        WOKEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        // The runner observes WOKEN and requeues.
                        Ok(_) => return,
                        Err(actual) => state = actual,
                    }
                }
                // Already queued or finished; nothing to do.
                _ => return,
            }
        }
    }

    pub(crate) fn run(cell: &Arc<TaskCell>) {
        if cell
            .state
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let waker = waker_for(cell.clone());
        let mut cx = Context::from_waker(&waker);

        // A detached task rethrows its panic out of `run`; make sure the
        // task still finishes its lifecycle on that path.
        let mut guard = PanicGuard { cell, armed: true };

        // Safety: holding RUNNING gives this thread exclusive access to
        // the frame slot.
        let done = {
            let frame = unsafe { &mut *cell.frame.get() };
            match frame.as_mut() {
                None => true,
                Some(frame) => frame.poll(&mut cx).is_ready(),
            }
        };
        guard.armed = false;

        if done {
            // Safety: still RUNNING; drop the frame before announcing
            // completion so I/O objects owned by the task are released.
            let frame = unsafe { (*cell.frame.get()).take() };
            drop(frame);
            cell.state.store(COMPLETE, Ordering::Release);
            if let Some(inner) = cell.ctx.upgrade() {
                inner.sched.on_work_finished();
            }
        } else if cell
            .state
            .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Woken while running: go around again.
            cell.state.store(QUEUED, Ordering::Release);
            if let Some(inner) = cell.ctx.upgrade() {
                inner.sched.enqueue(Runnable::Task(cell.clone()));
            }
        }
    }
}

struct PanicGuard<'a> {
    cell: &'a Arc<TaskCell>,
    armed: bool,
}

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // The frame stays in the cell and is dropped with it; dropping a
        // mid-unwind future here could double-panic.
        self.cell.state.store(COMPLETE, Ordering::Release);
        if let Some(inner) = self.cell.ctx.upgrade() {
            inner.sched.on_work_finished();
        }
    }
}

fn waker_for(cell: Arc<TaskCell>) -> Waker {
    unsafe { Waker::from_raw(RawWaker::new(Arc::into_raw(cell) as *const (), &VTABLE)) }
}

static VTABLE: RawWakerVTable =
    RawWakerVTable::new(clone_waker, wake_waker, wake_by_ref_waker, drop_waker);

unsafe fn clone_waker(data: *const ()) -> RawWaker {
    Arc::increment_strong_count(data as *const TaskCell);
    RawWaker::new(data, &VTABLE)
}

unsafe fn wake_waker(data: *const ()) {
    let cell = Arc::from_raw(data as *const TaskCell);
    TaskCell::wake(&cell);
}

unsafe fn wake_by_ref_waker(data: *const ()) {
    let cell = ManuallyDrop::new(Arc::from_raw(data as *const TaskCell));
    TaskCell::wake(&cell);
}

unsafe fn drop_waker(data: *const ()) {
    drop(Arc::from_raw(data as *const TaskCell));
}

/// Launches `future` as a task on `inner`'s scheduler.
pub(crate) fn spawn_on<F>(inner: &Arc<Inner>, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let shared = Arc::new(JoinShared {
        inner: Mutex::new(JoinInner {
            result: None,
            waker: None,
            detached: false,
        }),
    });

    let completion = shared.clone();
    let wrapped = async move {
        completion.complete(CatchUnwind { inner: future }.await);
    };

    if !inner.sched.is_shutdown() {
        let cell = Arc::new(TaskCell {
            ctx: Arc::downgrade(inner),
            state: AtomicU8::new(QUEUED),
            frame: UnsafeCell::new(Some(FrameBox::new(wrapped))),
        });
        // One work unit for the task's lifetime, released on completion;
        // the queue entry itself carries another.
        inner.sched.on_work_started();
        inner.sched.enqueue(Runnable::Task(cell));
    }

    JoinHandle { shared }
}

/// Runs `future` on another executor and resumes the caller on its own.
///
/// The spawned future and everything it awaits dispatch through `ex`;
/// the calling task's executor is untouched and later awaits continue to
/// resume where they always did.
///
/// # Panics
///
/// Rethrows a panic of the inner future into the caller.
pub async fn run_on<F>(ex: &Executor, future: F) -> F::Output
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    ex.spawn(future).await
}

struct CatchUnwind<F> {
    inner: F,
}

impl<F: Future> Future for CatchUnwind<F> {
    type Output = thread::Result<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: structural pinning of the only field.
        let inner = unsafe { self.map_unchecked_mut(|s| &mut s.inner) };
        match panic::catch_unwind(AssertUnwindSafe(|| inner.poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}

/// Completion slot for one spawned task.
///
/// Awaiting the handle yields the task's output once it completes; the
/// awaiting task is resumed through its own executor. Dropping the
/// handle detaches the task.
#[must_use = "dropping a JoinHandle detaches the task"]
pub struct JoinHandle<T> {
    shared: Arc<JoinShared<T>>,
}

struct JoinShared<T> {
    inner: Mutex<JoinInner<T>>,
}

struct JoinInner<T> {
    result: Option<thread::Result<T>>,
    waker: Option<Waker>,
    detached: bool,
}

impl<T> JoinShared<T> {
    fn complete(&self, result: thread::Result<T>) {
        let waker;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.detached {
                drop(inner);
                if let Err(payload) = result {
                    // Default handler semantics: discard the value,
                    // rethrow the error. Propagates out of `run`.
                    panic::resume_unwind(payload);
                }
                return;
            }
            inner.result = Some(result);
            waker = inner.waker.take();
        }
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> JoinHandle<T> {
    /// Releases interest in the task's result.
    ///
    /// The task keeps running. If it later panics, the panic is rethrown
    /// out of the context's `run`.
    pub fn detach(self) {}

    /// Whether the task has already completed.
    pub fn is_finished(&self) -> bool {
        self.shared.inner.lock().unwrap().result.is_some()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut inner = self.shared.inner.lock().unwrap();
        match inner.result.take() {
            Some(Ok(value)) => Poll::Ready(value),
            Some(Err(payload)) => {
                drop(inner);
                panic::resume_unwind(payload);
            }
            None => {
                match &mut inner.waker {
                    Some(waker) if waker.will_wake(cx.waker()) => {}
                    slot => *slot = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.detached = true;
        inner.waker = None;
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}
