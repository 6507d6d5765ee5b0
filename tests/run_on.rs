use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use corio::{run_on, IoContext};

mod util;
use util::{block_on, init};

#[test]
fn spawn_returns_the_task_output() {
    init();
    let ioc = IoContext::new().unwrap();
    let handle = ioc.spawn(async { 6 * 7 });
    assert_eq!(block_on(&ioc, async move { handle.await }), 42);
}

#[test]
fn run_on_executes_on_the_other_context() {
    init();
    let ioc = IoContext::new().unwrap();
    let other = IoContext::new().unwrap();
    let other_ex = other.executor();

    // Pin the other context open and donate a background thread to it;
    // it runs until the work guard drops.
    let guard = other_ex.work_guard();
    let other_thread = thread::spawn(move || {
        other.run();
        other
    });

    let my_ex = ioc.executor();
    let inner_ex = other_ex.clone();
    let (inner_thread, resumed_here) = block_on(&ioc, async move {
        let inner_thread = run_on(&inner_ex, async { thread::current().id() }).await;
        // After the await the outer task resumes through its own
        // executor again.
        let resumed_here = my_ex.running_in_this_thread();
        (inner_thread, resumed_here)
    });

    drop(guard);
    let other = other_thread.join().unwrap();
    drop(other);

    assert_ne!(inner_thread, thread::current().id());
    assert!(resumed_here);
}

#[test]
fn detached_panic_rethrows_out_of_run() {
    init();
    let ioc = IoContext::new().unwrap();
    ioc.spawn(async { panic!("task exploded") }).detach();

    let result = panic::catch_unwind(AssertUnwindSafe(|| ioc.run()));
    let payload = result.unwrap_err();
    let msg = payload.downcast_ref::<&str>().copied().unwrap_or_default();
    assert_eq!(msg, "task exploded");
}

#[test]
fn posts_run_in_fifo_order() {
    init();
    let ioc = IoContext::new().unwrap();
    let ex = ioc.executor();
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..3 {
        let order = order.clone();
        ex.post(move || order.lock().unwrap().push(i));
    }
    assert_eq!(ioc.run(), 3);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn dispatch_is_inline_on_a_runner_thread() {
    init();
    let ioc = IoContext::new().unwrap();
    let ex = ioc.executor();
    let order = Arc::new(Mutex::new(Vec::new()));

    // From outside `run`, dispatch defers.
    {
        let order = order.clone();
        ex.dispatch(move || order.lock().unwrap().push("deferred"));
    }
    assert!(order.lock().unwrap().is_empty());

    let inner_ex = ex.clone();
    let inner_order = order.clone();
    ex.post(move || {
        let nested = inner_order.clone();
        inner_ex.dispatch(move || nested.lock().unwrap().push("inline"));
        inner_order.lock().unwrap().push("after-dispatch");
    });

    ioc.run();
    assert_eq!(
        *order.lock().unwrap(),
        vec!["deferred", "inline", "after-dispatch"]
    );
}

#[test]
fn many_tasks_on_two_donated_threads() {
    init();
    let ioc = IoContext::new().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    const TASKS: usize = 100;
    for _ in 0..TASKS {
        let counter = counter.clone();
        ioc.spawn(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .detach();
    }

    thread::scope(|scope| {
        scope.spawn(|| ioc.run());
        scope.spawn(|| ioc.run());
    });

    assert_eq!(counter.load(Ordering::SeqCst), TASKS);
}
