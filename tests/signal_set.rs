use std::sync::Arc;
use std::time::Duration;

use corio::signal::SignalSet;
use corio::time::Timer;
use corio::{Cond, IoContext};

mod util;
use util::{block_on, init};

// Each test uses its own signal number: signal state is process-wide
// and the test harness runs these in parallel.

#[test]
fn raised_signal_completes_wait() {
    init();
    let ioc = IoContext::new().unwrap();

    let signals = SignalSet::new(&ioc);
    signals.add(libc::SIGUSR1).unwrap();

    let timer = Timer::new(&ioc);
    timer.expires_after(Duration::from_millis(10));
    ioc.spawn(async move {
        timer.wait().await.unwrap();
        unsafe { libc::raise(libc::SIGUSR1) };
    })
    .detach();

    let signo = block_on(&ioc, async move { signals.wait().await }).unwrap();
    assert_eq!(signo, libc::SIGUSR1);
}

#[test]
fn interrupt_delivery() {
    init();
    let ioc = IoContext::new().unwrap();

    let signals = SignalSet::new(&ioc);
    signals.add(libc::SIGINT).unwrap();

    let timer = Timer::new(&ioc);
    timer.expires_after(Duration::from_millis(10));
    ioc.spawn(async move {
        timer.wait().await.unwrap();
        unsafe { libc::raise(libc::SIGINT) };
    })
    .detach();

    let signo = block_on(&ioc, async move { signals.wait().await }).unwrap();
    assert_eq!(signo, libc::SIGINT);
}

#[test]
fn undelivered_signal_resolves_next_wait() {
    init();
    let ioc = IoContext::new().unwrap();

    let signals = SignalSet::new(&ioc);
    signals.add(libc::SIGUSR2).unwrap();

    // Two raises with no wait pending: both are queued, one completes
    // each of the next two waits.
    unsafe {
        libc::raise(libc::SIGUSR2);
        libc::raise(libc::SIGUSR2);
    }

    let signals = Arc::new(signals);
    let first = signals.clone();
    let signo = block_on(&ioc, async move { first.wait().await }).unwrap();
    assert_eq!(signo, libc::SIGUSR2);

    let second = signals.clone();
    let signo = block_on(&ioc, async move { second.wait().await }).unwrap();
    assert_eq!(signo, libc::SIGUSR2);
}

#[test]
fn cancel_completes_wait_with_canceled() {
    init();
    let ioc = IoContext::new().unwrap();

    let signals = SignalSet::new(&ioc);
    signals.add(libc::SIGHUP).unwrap();
    let signals = Arc::new(signals);

    let waiter = signals.clone();
    let pending = ioc.spawn(async move { waiter.wait().await });

    let timer = Timer::new(&ioc);
    timer.expires_after(Duration::from_millis(10));
    let cancelled = signals.clone();
    ioc.spawn(async move {
        timer.wait().await.unwrap();
        cancelled.cancel();
    })
    .detach();

    let result = block_on(&ioc, async move { pending.await });
    assert!(Cond::Canceled == result.unwrap_err());
}

#[test]
fn add_rejects_out_of_range_signals() {
    init();
    let ioc = IoContext::new().unwrap();
    let signals = SignalSet::new(&ioc);
    let err = signals.add(0).unwrap_err();
    assert!(Cond::InvalidArgument == err);
    let err = signals.add(4096).unwrap_err();
    assert!(Cond::InvalidArgument == err);
}

#[test]
fn add_and_remove_are_idempotent() {
    init();
    let ioc = IoContext::new().unwrap();
    let signals = SignalSet::new(&ioc);
    signals.add(libc::SIGWINCH).unwrap();
    signals.add(libc::SIGWINCH).unwrap();
    signals.remove(libc::SIGWINCH).unwrap();
    signals.remove(libc::SIGWINCH).unwrap();
    signals.clear();
}
