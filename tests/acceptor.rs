use std::sync::Arc;
use std::time::Duration;

use corio::net::{Acceptor, Socket};
use corio::time::Timer;
use corio::{Cond, IoContext, StopSource};

mod util;
use util::{any_local_address, block_on, init};

#[test]
fn listen_assigns_ephemeral_port() {
    init();
    let ioc = IoContext::new().unwrap();
    let mut acceptor = Acceptor::new(&ioc);
    acceptor.listen(any_local_address(), 16).unwrap();
    assert!(acceptor.is_open());
    assert_ne!(acceptor.local_addr().unwrap().port(), 0);
}

#[test]
fn accept_replaces_peer_implementation() {
    init();
    let ioc = IoContext::new().unwrap();

    let mut acceptor = Acceptor::new(&ioc);
    acceptor.listen(any_local_address(), 16).unwrap();
    let addr = acceptor.local_addr().unwrap();

    let server = ioc.spawn(async move {
        // The peer starts out open; accept closes it first and installs
        // the accepted stream.
        let mut peer = Socket::from_executor(&acceptor.executor());
        peer.open().unwrap();
        acceptor.accept(&mut peer).await.unwrap();
        peer.peer_addr().unwrap()
    });

    let ex = ioc.executor();
    let client = ioc.spawn(async move {
        let mut socket = Socket::from_executor(&ex);
        socket.open().unwrap();
        socket.connect(addr).await.unwrap();
        socket.local_addr().unwrap()
    });

    let (seen_by_server, client_addr) =
        block_on(&ioc, async move { (server.await, client.await) });
    assert_eq!(seen_by_server, client_addr);
}

#[test]
fn cancel_pending_accept() {
    init();
    let ioc = IoContext::new().unwrap();

    let mut acceptor = Acceptor::new(&ioc);
    acceptor.listen(any_local_address(), 16).unwrap();
    let acceptor = Arc::new(acceptor);

    let accepting = acceptor.clone();
    let ex = ioc.executor();
    let pending = ioc.spawn(async move {
        let mut peer = Socket::from_executor(&ex);
        accepting.accept(&mut peer).await
    });

    let timer = Timer::new(&ioc);
    timer.expires_after(Duration::from_millis(20));
    let cancelled = acceptor.clone();
    ioc.spawn(async move {
        timer.wait().await.unwrap();
        cancelled.cancel();
    })
    .detach();

    let result = block_on(&ioc, async move { pending.await });
    assert!(Cond::Canceled == result.unwrap_err());
}

#[test]
fn stop_token_cancels_accept_before_any_io() {
    init();
    let ioc = IoContext::new().unwrap();

    let mut acceptor = Acceptor::new(&ioc);
    acceptor.listen(any_local_address(), 16).unwrap();

    let source = StopSource::new();
    source.request_stop();
    let token = source.token();

    let ex = ioc.executor();
    let result = block_on(&ioc, async move {
        let mut peer = Socket::from_executor(&ex);
        acceptor.accept(&mut peer).with_stop_token(token).await
    });
    assert!(Cond::Canceled == result.unwrap_err());
}

#[test]
#[should_panic(expected = "not listening")]
fn accept_on_closed_acceptor_is_a_contract_violation() {
    init();
    let ioc = IoContext::new().unwrap();
    let acceptor = Acceptor::new(&ioc);
    let mut peer = Socket::new(&ioc);
    let _ = acceptor.accept(&mut peer);
}
