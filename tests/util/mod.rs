//! Shared test support.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Once;

use corio::net::{Acceptor, Socket};
use corio::IoContext;

/// Initialise logging once per test binary; run tests with
/// `RUST_LOG=trace` to get the tracepoints.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Any ephemeral loopback address.
pub fn any_local_address() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Spawns `future` on `ioc` and runs the context until it completes,
/// returning its output.
pub fn block_on<F>(ioc: &IoContext, future: F) -> F::Output
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    ioc.restart();
    let (tx, rx) = mpsc::channel();
    ioc.spawn(async move {
        let _ = tx.send(future.await);
    })
    .detach();
    ioc.run();
    rx.try_recv().expect("task did not run to completion")
}

/// Builds a connected loopback socket pair on `ioc`:
/// `(accepted, connected)`.
pub fn socket_pair(ioc: &IoContext) -> (Socket, Socket) {
    let mut acceptor = Acceptor::new(ioc);
    acceptor.listen(any_local_address(), 128).unwrap();
    let addr = acceptor.local_addr().unwrap();

    let accepted = ioc.spawn(async move {
        let mut peer = Socket::from_executor(&acceptor.executor());
        acceptor.accept(&mut peer).await.unwrap();
        peer
    });

    let ex = ioc.executor();
    let connected = ioc.spawn(async move {
        let mut socket = Socket::from_executor(&ex);
        socket.open().unwrap();
        socket.connect(addr).await.unwrap();
        socket
    });

    block_on(ioc, async move { (accepted.await, connected.await) })
}
