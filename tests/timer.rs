use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use corio::time::Timer;
use corio::{Cond, IoContext, StopSource};

mod util;
use util::{block_on, init};

#[test]
fn earlier_timer_fires_first() {
    init();
    let ioc = IoContext::new().unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let start = Instant::now();

    let t2 = Timer::new(&ioc);
    t2.expires_after(Duration::from_millis(20));
    let order2 = order.clone();
    ioc.spawn(async move {
        t2.wait().await.unwrap();
        order2.lock().unwrap().push(2);
    })
    .detach();

    let t1 = Timer::new(&ioc);
    t1.expires_after(Duration::from_millis(10));
    let order1 = order.clone();
    ioc.spawn(async move {
        t1.wait().await.unwrap();
        order1.lock().unwrap().push(1);
    })
    .detach();

    ioc.run();

    let elapsed = start.elapsed();
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    assert!(elapsed >= Duration::from_millis(20), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "elapsed {:?}", elapsed);
}

#[test]
fn expiry_in_the_past_completes_immediately() {
    init();
    let ioc = IoContext::new().unwrap();

    let timer = Timer::new(&ioc);
    timer.expires_at(Instant::now() - Duration::from_millis(1));
    let result = block_on(&ioc, async move { timer.wait().await });
    assert!(result.is_ok());
}

#[test]
fn default_timer_completes_immediately() {
    init();
    let ioc = IoContext::new().unwrap();

    let timer = Timer::new(&ioc);
    assert_eq!(timer.expiry(), None);
    let result = block_on(&ioc, async move { timer.wait().await });
    assert!(result.is_ok());
}

#[test]
fn reschedule_cancels_pending_wait() {
    init();
    let ioc = IoContext::new().unwrap();

    let timer = Arc::new(Timer::new(&ioc));
    timer.expires_after(Duration::from_secs(60));

    let waiter = timer.clone();
    let pending = ioc.spawn(async move { waiter.wait().await });

    let kicker = Timer::new(&ioc);
    kicker.expires_after(Duration::from_millis(10));
    let rescheduled = timer.clone();
    ioc.spawn(async move {
        kicker.wait().await.unwrap();
        rescheduled.expires_after(Duration::from_millis(1));
    })
    .detach();

    let result = block_on(&ioc, async move { pending.await });
    let err = result.unwrap_err();
    assert!(Cond::Canceled == err, "unexpected error: {}", err);
}

#[test]
fn cancel_completes_wait_with_canceled() {
    init();
    let ioc = IoContext::new().unwrap();

    let timer = Arc::new(Timer::new(&ioc));
    timer.expires_after(Duration::from_secs(60));

    let waiter = timer.clone();
    let pending = ioc.spawn(async move { waiter.wait().await });

    let kicker = Timer::new(&ioc);
    kicker.expires_after(Duration::from_millis(10));
    let cancelled = timer.clone();
    ioc.spawn(async move {
        kicker.wait().await.unwrap();
        cancelled.cancel();
        // Repeated cancels do not produce additional completions.
        cancelled.cancel();
    })
    .detach();

    let result = block_on(&ioc, async move { pending.await });
    assert!(Cond::Canceled == result.unwrap_err());
}

#[test]
fn wait_after_cancel_succeeds() {
    init();
    let ioc = IoContext::new().unwrap();

    let timer = Arc::new(Timer::new(&ioc));
    timer.expires_after(Duration::from_secs(60));
    timer.cancel();

    timer.expires_after(Duration::from_millis(5));
    let waiter = timer.clone();
    let result = block_on(&ioc, async move { waiter.wait().await });
    assert!(result.is_ok());
}

#[test]
fn stop_token_signalled_before_wait() {
    init();
    let ioc = IoContext::new().unwrap();

    let source = StopSource::new();
    source.request_stop();
    let token = source.token();

    let timer = Timer::new(&ioc);
    timer.expires_after(Duration::from_secs(60));
    let result = block_on(&ioc, async move {
        timer.wait().with_stop_token(token).await
    });
    assert!(Cond::Canceled == result.unwrap_err());
}

#[test]
fn stop_token_signalled_during_wait() {
    init();
    let ioc = IoContext::new().unwrap();

    let source = StopSource::new();
    let token = source.token();

    let timer = Timer::new(&ioc);
    timer.expires_after(Duration::from_secs(60));
    let pending = ioc.spawn(async move { timer.wait().with_stop_token(token).await });

    let kicker = Timer::new(&ioc);
    kicker.expires_after(Duration::from_millis(10));
    ioc.spawn(async move {
        kicker.wait().await.unwrap();
        source.request_stop();
    })
    .detach();

    let result = block_on(&ioc, async move { pending.await });
    assert!(Cond::Canceled == result.unwrap_err());
}

#[test]
fn run_one_for_zero_duration_returns_immediately() {
    init();
    let ioc = IoContext::new().unwrap();
    // Keep work outstanding so the call would otherwise block.
    let _guard = ioc.executor().work_guard();
    assert_eq!(ioc.run_one_for(Duration::ZERO), 0);
}
