use std::net::Shutdown;
use std::sync::Arc;
use std::time::{Duration, Instant};

use corio::net::{Acceptor, Socket};
use corio::time::Timer;
use corio::{Cond, IoContext, StopSource};

mod util;
use util::{any_local_address, block_on, init, socket_pair};

#[test]
fn echo_round_trip() {
    init();
    let ioc = IoContext::new().unwrap();

    let mut acceptor = Acceptor::new(&ioc);
    acceptor.listen(any_local_address(), 128).unwrap();
    let addr = acceptor.local_addr().unwrap();
    assert_ne!(addr.port(), 0);

    let server = ioc.spawn(async move {
        let mut peer = Socket::from_executor(&acceptor.executor());
        acceptor.accept(&mut peer).await.unwrap();
        let mut buf = [0u8; 32];
        let n = peer.read_some(&mut buf[..]).await.unwrap();
        (n, buf)
    });

    let ex = ioc.executor();
    let client = ioc.spawn(async move {
        let mut socket = Socket::from_executor(&ex);
        socket.open().unwrap();
        socket.connect(addr).await.unwrap();
        socket.write_some(&b"ABCDE"[..]).await.unwrap()
    });

    let (written, (n, buf)) = block_on(&ioc, async move { (client.await, server.await) });
    assert_eq!(written, 5);
    assert_eq!(n, 5);
    assert_eq!(&buf[..n], b"ABCDE");
}

#[test]
fn peer_shutdown_reads_eof() {
    init();
    let ioc = IoContext::new().unwrap();
    let (peer, connected) = socket_pair(&ioc);

    connected.shutdown(Shutdown::Write);

    let result = block_on(&ioc, async move {
        let mut buf = [0u8; 16];
        let result = peer.read_some(&mut buf[..]).await;
        drop(connected);
        result
    });
    let err = result.unwrap_err();
    assert!(Cond::Eof == err, "unexpected error: {}", err);
}

#[test]
fn cancel_pending_read() {
    init();
    let ioc = IoContext::new().unwrap();
    let (peer, connected) = socket_pair(&ioc);
    let peer = Arc::new(peer);

    let reader = peer.clone();
    let started = Instant::now();
    let pending = ioc.spawn(async move {
        let mut buf = [0u8; 16];
        reader.read_some(&mut buf[..]).await
    });

    let timer = Timer::new(&ioc);
    timer.expires_after(Duration::from_millis(50));
    let cancelled = peer.clone();
    ioc.spawn(async move {
        timer.wait().await.unwrap();
        cancelled.cancel();
        // Idempotent: no second completion is produced.
        cancelled.cancel();
    })
    .detach();

    let result = block_on(&ioc, async move { pending.await });
    drop(connected);
    let err = result.unwrap_err();
    assert!(Cond::Canceled == err, "unexpected error: {}", err);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn stop_token_cancels_before_any_io() {
    init();
    let ioc = IoContext::new().unwrap();
    let (peer, connected) = socket_pair(&ioc);

    let source = StopSource::new();
    source.request_stop();
    let token = source.token();

    let result = block_on(&ioc, async move {
        let mut buf = [0u8; 16];
        let result = peer.read_some(&mut buf[..]).with_stop_token(token).await;
        drop(connected);
        result
    });
    assert!(Cond::Canceled == result.unwrap_err());
}

#[test]
fn zero_length_transfers_complete_synchronously() {
    init();
    let ioc = IoContext::new().unwrap();
    let (peer, connected) = socket_pair(&ioc);

    let (read, written) = block_on(&ioc, async move {
        let mut empty = [0u8; 0];
        let read = peer.read_some(&mut empty[..]).await.unwrap();
        let written = connected.write_some(&b""[..]).await.unwrap();
        (read, written)
    });
    assert_eq!(read, 0);
    assert_eq!(written, 0);
}

#[test]
fn scatter_gather_transfer() {
    init();
    let ioc = IoContext::new().unwrap();
    let (peer, connected) = socket_pair(&ioc);

    let (n, buf) = block_on(&ioc, async move {
        let parts: [&[u8]; 4] = [b"scat", b"", b"ter-", b"gather"];
        let written = connected.write_some(parts).await.unwrap();
        assert_eq!(written, 14);

        let mut buf = vec![0u8; 32];
        let n = peer.read_some(&mut buf).await.unwrap();
        (n, buf)
    });
    assert_eq!(&buf[..n], b"scatter-gather");
}

#[test]
fn read_and_write_may_be_pending_together() {
    init();
    let ioc = IoContext::new().unwrap();
    let (peer, connected) = socket_pair(&ioc);
    let peer = Arc::new(peer);

    let reader = peer.clone();
    let read_task = ioc.spawn(async move {
        let mut buf = [0u8; 8];
        let n = reader.read_some(&mut buf[..]).await.unwrap();
        (n, buf)
    });

    let writer = peer.clone();
    let write_task = ioc.spawn(async move { writer.write_some(&b"pong"[..]).await.unwrap() });

    let timer = Timer::new(&ioc);
    timer.expires_after(Duration::from_millis(10));
    let feeder = ioc.spawn(async move {
        timer.wait().await.unwrap();
        connected.write_some(&b"ping"[..]).await.unwrap();
        let mut buf = [0u8; 8];
        let n = connected.read_some(&mut buf[..]).await.unwrap();
        (n, buf)
    });

    let ((rn, rbuf), wn, (fn_, fbuf)) =
        block_on(&ioc, async move { (read_task.await, write_task.await, feeder.await) });
    assert_eq!(&rbuf[..rn], b"ping");
    assert_eq!(wn, 4);
    assert_eq!(&fbuf[..fn_], b"pong");
}

#[test]
fn bulk_transfer_round_trips() {
    use rand::RngCore;

    init();
    let ioc = IoContext::new().unwrap();
    let (peer, connected) = socket_pair(&ioc);

    const LEN: usize = 64 * 1024;
    let mut payload = vec![0u8; LEN];
    rand::rng().fill_bytes(&mut payload[..]);
    let expected = payload.clone();

    let writer = ioc.spawn(async move {
        let mut sent = 0;
        while sent < payload.len() {
            sent += connected.write_some(&payload[sent..]).await.unwrap();
        }
        sent
    });

    let reader = ioc.spawn(async move {
        let mut data = Vec::with_capacity(LEN);
        let mut buf = vec![0u8; 8192];
        while data.len() < LEN {
            let n = peer.read_some(&mut buf[..]).await.unwrap();
            data.extend_from_slice(&buf[..n]);
        }
        data
    });

    let (sent, data) = block_on(&ioc, async move { (writer.await, reader.await) });
    assert_eq!(sent, LEN);
    assert_eq!(data, expected);
}

#[test]
fn connect_refused_is_portable() {
    init();
    let ioc = IoContext::new().unwrap();

    // Grab an ephemeral port and free it again; connecting there is
    // refused.
    let addr = {
        let listener = std::net::TcpListener::bind(any_local_address()).unwrap();
        listener.local_addr().unwrap()
    };

    let ex = ioc.executor();
    let result = block_on(&ioc, async move {
        let mut socket = Socket::from_executor(&ex);
        socket.open().unwrap();
        socket.connect(addr).await
    });
    let err = result.unwrap_err();
    assert!(Cond::ConnectionRefused == err, "unexpected error: {}", err);
}

#[test]
fn socket_options_round_trip() {
    init();
    let ioc = IoContext::new().unwrap();
    let mut socket = Socket::new(&ioc);
    socket.open().unwrap();

    socket.set_no_delay(true).unwrap();
    assert!(socket.no_delay().unwrap());
    socket.set_no_delay(false).unwrap();
    assert!(!socket.no_delay().unwrap());

    socket.set_keep_alive(true).unwrap();
    assert!(socket.keep_alive().unwrap());

    socket.set_receive_buffer_size(64 * 1024).unwrap();
    assert!(socket.receive_buffer_size().unwrap() > 0);
    socket.set_send_buffer_size(64 * 1024).unwrap();
    assert!(socket.send_buffer_size().unwrap() > 0);

    socket.set_linger(Some(Duration::from_secs(3))).unwrap();
    assert_eq!(socket.linger().unwrap(), Some(Duration::from_secs(3)));
    socket.set_linger(None).unwrap();
    assert_eq!(socket.linger().unwrap(), None);
}

#[test]
#[should_panic(expected = "not open")]
fn connect_on_closed_socket_is_a_contract_violation() {
    init();
    let ioc = IoContext::new().unwrap();
    let socket = Socket::new(&ioc);
    let _ = socket.connect(any_local_address());
}

#[test]
fn close_is_always_safe() {
    init();
    let ioc = IoContext::new().unwrap();
    let mut socket = Socket::new(&ioc);
    socket.close();
    socket.open().unwrap();
    socket.close();
    socket.close();
    assert!(!socket.is_open());
}
