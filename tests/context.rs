use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use corio::IoContext;

mod util;
use util::init;

#[test]
fn empty_context_runs_nothing_and_stops() {
    init();
    let ioc = IoContext::new().unwrap();
    assert!(!ioc.stopped());
    assert_eq!(ioc.run(), 0);
    assert!(ioc.stopped());

    ioc.restart();
    assert!(!ioc.stopped());
    assert_eq!(ioc.run_one(), 0);
    assert!(ioc.stopped());
}

#[test]
fn stop_is_sticky_until_restart() {
    init();
    let ioc = IoContext::new().unwrap();
    let ex = ioc.executor();

    ex.post(|| {});
    ioc.stop();
    assert_eq!(ioc.run(), 0);

    ioc.restart();
    assert_eq!(ioc.run(), 1);
}

#[test]
fn poll_runs_only_ready_work() {
    init();
    let ioc = IoContext::new().unwrap();
    let ex = ioc.executor();

    for _ in 0..3 {
        ex.post(|| {});
    }
    assert_eq!(ioc.poll(), 3);

    ioc.restart();
    ex.post(|| {});
    ex.post(|| {});
    assert_eq!(ioc.poll_one(), 1);
    assert_eq!(ioc.poll_one(), 1);
    assert_eq!(ioc.poll_one(), 0);
}

#[test]
fn run_one_processes_a_single_handler() {
    init();
    let ioc = IoContext::new().unwrap();
    let ex = ioc.executor();
    ex.post(|| {});
    ex.post(|| {});
    assert_eq!(ioc.run_one(), 1);
    assert_eq!(ioc.run_one(), 1);
    assert_eq!(ioc.run_one(), 0);
}

#[test]
fn run_for_returns_after_the_deadline() {
    init();
    let ioc = IoContext::new().unwrap();
    let _guard = ioc.executor().work_guard();

    let start = Instant::now();
    let n = ioc.run_for(Duration::from_millis(50));
    let elapsed = start.elapsed();
    assert_eq!(n, 0);
    assert!(elapsed >= Duration::from_millis(50), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "elapsed {:?}", elapsed);
}

#[test]
fn work_guard_keeps_run_alive_until_released() {
    init();
    let ioc = IoContext::new().unwrap();
    let guard = ioc.executor().work_guard();

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        drop(guard);
    });

    let start = Instant::now();
    ioc.run();
    assert!(start.elapsed() >= Duration::from_millis(40));
    releaser.join().unwrap();
}

#[test]
fn executors_compare_by_context() {
    init();
    let ioc = IoContext::new().unwrap();
    let other = IoContext::new().unwrap();

    let a = ioc.executor();
    let b = ioc.executor();
    let c = other.executor();
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert!(!a.running_in_this_thread());
}

#[test]
fn work_count_is_balanced_across_run() {
    init();
    let ioc = IoContext::new().unwrap();
    let ex = ioc.executor();

    // Handlers posted from handlers extend the same run.
    let inner_ex = ex.clone();
    ex.post(move || inner_ex.post(|| {}));
    assert_eq!(ioc.run(), 2);

    // Once drained, nothing remains and a fresh run is a no-op.
    ioc.restart();
    assert_eq!(ioc.run(), 0);
}

#[test]
fn endpoint_text_round_trips() {
    init();
    for text in [
        "127.0.0.1:8080",
        "0.0.0.0:0",
        "[::1]:443",
        "[2001:db8::1]:443",
        "[fe80::1%7]:22",
    ] {
        let addr: SocketAddr = text.parse().unwrap();
        assert_eq!(addr.to_string(), text);
    }
}
