use std::fmt;
use std::future::Future;
use std::io::{self, IoSlice, IoSliceMut};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use log::trace;
use socket2::{Domain, Protocol, Socket as SysSocket, Type};

use crate::buf::{ConstBufferSequence, MutBufferSequence, MAX_BUFFER_CHUNKS};
use crate::context::Inner;
use crate::error::{canceled, eof};
use crate::reactor::{Dir, Source};
use crate::{sys, Executor, IoContext, StopToken};

/// Creates a non-blocking TCP stream socket for `domain`.
pub(crate) fn new_tcp_socket(domain: Domain) -> io::Result<SysSocket> {
    let ty = Type::STREAM;
    // Use `SOCK_NONBLOCK` where the OS supports it.
    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "illumos",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    let ty = ty.nonblocking();
    let socket = SysSocket::new(domain, ty, Some(Protocol::TCP))?;
    #[cfg(not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "illumos",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd"
    )))]
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// The service-managed state behind an open socket or acceptor: the OS
/// handle plus its reactor registration.
pub(crate) struct SocketImpl {
    pub(crate) socket: SysSocket,
    pub(crate) source: Arc<Source>,
}

/// An asynchronous TCP stream socket.
///
/// The socket must be [opened](Socket::open) (or filled in by
/// [`Acceptor::accept`]) before initiating I/O. Each operation returns a
/// future completing with an `io::Result`; protocol conditions such as
/// end-of-stream and cancellation travel through the same channel and
/// are matched with [`Cond`].
///
/// At most one read-direction and one write-direction operation may be
/// in flight at a time; `connect` excludes both. Violations are
/// detected in debug builds.
///
/// [`Acceptor::accept`]: crate::net::Acceptor::accept
/// [`Cond`]: crate::Cond
///
/// # Examples
///
/// ```no_run
/// use corio::net::Socket;
/// use corio::IoContext;
///
/// # fn main() -> std::io::Result<()> {
/// let ioc = IoContext::new()?;
/// let ex = ioc.executor();
/// ioc.spawn(async move {
///     let mut s = Socket::from_executor(&ex);
///     s.open().unwrap();
///     if s.connect("127.0.0.1:8080".parse().unwrap()).await.is_ok() {
///         s.write_some(&b"hello"[..]).await.unwrap();
///     }
/// })
/// .detach();
/// ioc.run();
/// # Ok(())
/// # }
/// ```
pub struct Socket {
    ctx: Arc<Inner>,
    inner: Option<SocketImpl>,
}

impl Socket {
    /// Creates a closed socket owned by `ctx`.
    pub fn new(ctx: &IoContext) -> Socket {
        Socket {
            ctx: ctx.inner().clone(),
            inner: None,
        }
    }

    /// Creates a closed socket on the executor's context.
    pub fn from_executor(ex: &Executor) -> Socket {
        Socket {
            ctx: ex.inner.clone(),
            inner: None,
        }
    }

    /// Opens the socket: creates an IPv4 TCP socket in non-blocking
    /// mode and registers it with the context's reactor. An already
    /// open socket is closed first.
    pub fn open(&mut self) -> io::Result<()> {
        self.close();
        let socket = new_tcp_socket(Domain::IPV4)?;
        let source = self.ctx.reactor.register_source(socket.as_raw_fd());
        self.inner = Some(SocketImpl { socket, source });
        Ok(())
    }

    /// Whether the socket is open.
    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Closes the socket. Pending operations complete with
    /// [`Cond::Canceled`]; the OS handle is released. Always safe, also
    /// on a closed socket.
    ///
    /// [`Cond::Canceled`]: crate::Cond::Canceled
    pub fn close(&mut self) {
        if let Some(imp) = self.inner.take() {
            trace!("closing socket fd={}", imp.socket.as_raw_fd());
            self.ctx.reactor.remove_source(&imp.source);
        }
    }

    /// Cancels pending operations; each completes with
    /// [`Cond::Canceled`]. Idempotent: repeated calls do not produce
    /// additional completions.
    ///
    /// [`Cond::Canceled`]: crate::Cond::Canceled
    pub fn cancel(&self) {
        if let Some(imp) = &self.inner {
            self.ctx.reactor.cancel(&imp.source);
        }
    }

    /// Initiates an asynchronous connect to `endpoint`.
    ///
    /// Completes with success or a system error such as
    /// [`Cond::ConnectionRefused`], [`Cond::TimedOut`],
    /// [`Cond::NetworkUnreachable`] or [`Cond::Canceled`].
    ///
    /// [`Cond::ConnectionRefused`]: crate::Cond::ConnectionRefused
    /// [`Cond::TimedOut`]: crate::Cond::TimedOut
    /// [`Cond::NetworkUnreachable`]: crate::Cond::NetworkUnreachable
    /// [`Cond::Canceled`]: crate::Cond::Canceled
    ///
    /// # Panics
    ///
    /// Panics if the socket is not open.
    pub fn connect(&self, endpoint: SocketAddr) -> Connect<'_> {
        assert!(self.is_open(), "connect: socket is not open");
        Connect {
            socket: self,
            endpoint,
            started: false,
            done: false,
            parked: false,
            stop: None,
        }
    }

    /// Reads into `bufs`, completing with at least one byte, an
    /// [`Cond::Eof`] error when the peer half-closed, or a system or
    /// cancellation error. A sequence unrolling to no descriptors
    /// completes with `Ok(0)` without touching the OS.
    ///
    /// [`Cond::Eof`]: crate::Cond::Eof
    ///
    /// # Panics
    ///
    /// Panics if the socket is not open.
    pub fn read_some<B>(&self, bufs: B) -> ReadSome<'_, B>
    where
        B: MutBufferSequence,
    {
        assert!(self.is_open(), "read_some: socket is not open");
        ReadSome {
            socket: self,
            bufs,
            done: false,
            parked: false,
            stop: None,
        }
    }

    /// Writes from `bufs`, completing with the number of bytes
    /// transferred. [`Cond::BrokenPipe`] reports a peer that stopped
    /// reading. A sequence unrolling to no descriptors completes with
    /// `Ok(0)` without touching the OS.
    ///
    /// [`Cond::BrokenPipe`]: crate::Cond::BrokenPipe
    ///
    /// # Panics
    ///
    /// Panics if the socket is not open.
    pub fn write_some<B>(&self, bufs: B) -> WriteSome<'_, B>
    where
        B: ConstBufferSequence,
    {
        assert!(self.is_open(), "write_some: socket is not open");
        WriteSome {
            socket: self,
            bufs,
            done: false,
            parked: false,
            stop: None,
        }
    }

    /// Disables sends, receives or both on the socket. `shutdown(2)`
    /// errors are discarded; they are unlikely to be actionable.
    ///
    /// After the peer shuts down its send direction, this side's next
    /// read completes with [`Cond::Eof`].
    ///
    /// [`Cond::Eof`]: crate::Cond::Eof
    ///
    /// # Panics
    ///
    /// Panics if the socket is not open.
    pub fn shutdown(&self, how: Shutdown) {
        let _ = self.get().socket.shutdown(how);
    }

    /// The local endpoint of the socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.get()
            .socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::ErrorKind::InvalidInput.into())
    }

    /// The remote endpoint of a connected socket.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.get()
            .socket
            .peer_addr()?
            .as_socket()
            .ok_or_else(|| io::ErrorKind::InvalidInput.into())
    }

    /// Sets `TCP_NODELAY`.
    pub fn set_no_delay(&self, value: bool) -> io::Result<()> {
        self.get().socket.set_nodelay(value)
    }

    /// Gets `TCP_NODELAY`.
    pub fn no_delay(&self) -> io::Result<bool> {
        self.get().socket.nodelay()
    }

    /// Sets `SO_KEEPALIVE`.
    pub fn set_keep_alive(&self, value: bool) -> io::Result<()> {
        self.get().socket.set_keepalive(value)
    }

    /// Gets `SO_KEEPALIVE`.
    pub fn keep_alive(&self) -> io::Result<bool> {
        self.get().socket.keepalive()
    }

    /// Sets `SO_RCVBUF`. The OS may adjust the effective size.
    pub fn set_receive_buffer_size(&self, size: usize) -> io::Result<()> {
        self.get().socket.set_recv_buffer_size(size)
    }

    /// Gets `SO_RCVBUF`.
    pub fn receive_buffer_size(&self) -> io::Result<usize> {
        self.get().socket.recv_buffer_size()
    }

    /// Sets `SO_SNDBUF`. The OS may adjust the effective size.
    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        self.get().socket.set_send_buffer_size(size)
    }

    /// Gets `SO_SNDBUF`.
    pub fn send_buffer_size(&self) -> io::Result<usize> {
        self.get().socket.send_buffer_size()
    }

    /// Sets `SO_LINGER`: `Some(timeout)` makes close block until unsent
    /// data is flushed or the timeout expires, `None` disables
    /// lingering.
    pub fn set_linger(&self, linger: Option<Duration>) -> io::Result<()> {
        self.get().socket.set_linger(linger)
    }

    /// Gets `SO_LINGER`.
    pub fn linger(&self) -> io::Result<Option<Duration>> {
        self.get().socket.linger()
    }

    fn get(&self) -> &SocketImpl {
        self.inner.as_ref().expect("socket is not open")
    }

    pub(crate) fn ctx(&self) -> &Arc<Inner> {
        &self.ctx
    }

    /// Replaces the implementation with an accepted one.
    pub(crate) fn install(&mut self, imp: SocketImpl) {
        self.close();
        self.inner = Some(imp);
    }

    /// One scatter-read attempt against non-empty descriptors; arms the
    /// reactor on `WouldBlock`.
    pub(crate) fn poll_readv(
        &self,
        cx: &mut Context<'_>,
        chunks: &mut [IoSliceMut<'_>],
    ) -> Poll<io::Result<usize>> {
        let imp = self.get();
        // A sequence unrolling to nothing completes without touching
        // the OS and without consuming a pending cancellation.
        if chunks.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if self.ctx.reactor.take_cancel(&imp.source, Dir::Read) {
            return Poll::Ready(Err(canceled()));
        }
        loop {
            match sys::readv(imp.socket.as_raw_fd(), chunks) {
                Ok(0) => return Poll::Ready(Err(eof())),
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
        if let Err(err) = self.ctx.reactor.arm(&imp.source, Dir::Read, cx.waker()) {
            return Poll::Ready(Err(err));
        }
        Poll::Pending
    }

    /// One gather-write attempt against non-empty descriptors; arms the
    /// reactor on `WouldBlock`.
    pub(crate) fn poll_writev(
        &self,
        cx: &mut Context<'_>,
        chunks: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let imp = self.get();
        if chunks.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if self.ctx.reactor.take_cancel(&imp.source, Dir::Write) {
            return Poll::Ready(Err(canceled()));
        }
        loop {
            match sys::writev(imp.socket.as_raw_fd(), chunks) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
        if let Err(err) = self.ctx.reactor.arm(&imp.source, Dir::Write, cx.waker()) {
            return Poll::Ready(Err(err));
        }
        Poll::Pending
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsRawFd for Socket {
    /// The native handle, or `-1` when the socket is closed.
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_ref().map_or(-1, |imp| imp.socket.as_raw_fd())
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket").field("fd", &self.as_raw_fd()).finish()
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS)
        || err.kind() == io::ErrorKind::WouldBlock
}

/// Future returned by [`Socket::connect`].
#[must_use = "futures do nothing unless awaited"]
pub struct Connect<'a> {
    socket: &'a Socket,
    endpoint: SocketAddr,
    started: bool,
    done: bool,
    parked: bool,
    stop: Option<StopToken>,
}

impl Connect<'_> {
    /// Attaches a stop token; a token signalled before the first poll
    /// completes with canceled without starting the OS connect.
    pub fn with_stop_token(mut self, token: StopToken) -> Self {
        self.stop = Some(token);
        self
    }
}

impl Future for Connect<'_> {
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        assert!(!this.done, "connect polled after completion");
        let imp = this.socket.get();

        if this.stop.as_ref().map_or(false, |t| t.stop_requested()) {
            this.done = true;
            return Poll::Ready(Err(canceled()));
        }
        if this.socket.ctx.reactor.take_cancel(&imp.source, Dir::Write) {
            this.done = true;
            return Poll::Ready(Err(canceled()));
        }

        if !this.started {
            this.started = true;
            match imp.socket.connect(&this.endpoint.into()) {
                Ok(()) => {
                    this.done = true;
                    return Poll::Ready(Ok(()));
                }
                Err(ref err) if connect_in_progress(err) => {}
                Err(err) => {
                    this.done = true;
                    return Poll::Ready(Err(err));
                }
            }
        } else {
            // Woken: either the connect finished (check SO_ERROR) or the
            // wakeup was spurious and the attempt is still in flight.
            match imp.socket.take_error() {
                Ok(Some(err)) => {
                    this.done = true;
                    return Poll::Ready(Err(err));
                }
                Ok(None) => match imp.socket.connect(&this.endpoint.into()) {
                    Ok(()) => {
                        this.done = true;
                        return Poll::Ready(Ok(()));
                    }
                    Err(ref err) if err.raw_os_error() == Some(libc::EISCONN) => {
                        this.done = true;
                        return Poll::Ready(Ok(()));
                    }
                    Err(ref err)
                        if connect_in_progress(err)
                            || err.raw_os_error() == Some(libc::EALREADY) => {}
                    Err(err) => {
                        this.done = true;
                        return Poll::Ready(Err(err));
                    }
                },
                Err(err) => {
                    this.done = true;
                    return Poll::Ready(Err(err));
                }
            }
        }

        if let Err(err) = this
            .socket
            .ctx
            .reactor
            .arm(&imp.source, Dir::Write, cx.waker())
        {
            this.done = true;
            return Poll::Ready(Err(err));
        }
        this.parked = true;
        if let Some(token) = &this.stop {
            token.register(cx.waker());
        }
        Poll::Pending
    }
}

impl Drop for Connect<'_> {
    fn drop(&mut self) {
        if self.parked && !self.done {
            if let Some(imp) = &self.socket.inner {
                self.socket.ctx.reactor.disarm(&imp.source, Dir::Write);
            }
        }
    }
}

impl fmt::Debug for Connect<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connect").field("endpoint", &self.endpoint).finish()
    }
}

/// Future returned by [`Socket::read_some`].
#[must_use = "futures do nothing unless awaited"]
pub struct ReadSome<'a, B> {
    socket: &'a Socket,
    bufs: B,
    done: bool,
    parked: bool,
    stop: Option<StopToken>,
}

impl<B> ReadSome<'_, B> {
    /// Attaches a stop token; a token signalled before the first poll
    /// completes with canceled without touching the OS.
    pub fn with_stop_token(mut self, token: StopToken) -> Self {
        self.stop = Some(token);
        self
    }
}

impl<B: MutBufferSequence + Unpin> Future for ReadSome<'_, B> {
    type Output = io::Result<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        assert!(!this.done, "read_some polled after completion");

        if this.stop.as_ref().map_or(false, |t| t.stop_requested()) {
            this.done = true;
            return Poll::Ready(Err(canceled()));
        }

        let mut chunks: [IoSliceMut<'_>; MAX_BUFFER_CHUNKS] =
            std::array::from_fn(|_| IoSliceMut::new(&mut []));
        let filled = this.bufs.chunks_vectored_mut(&mut chunks);
        match this.socket.poll_readv(cx, &mut chunks[..filled]) {
            Poll::Ready(result) => {
                this.done = true;
                Poll::Ready(result)
            }
            Poll::Pending => {
                this.parked = true;
                if let Some(token) = &this.stop {
                    token.register(cx.waker());
                }
                Poll::Pending
            }
        }
    }
}

impl<B> Drop for ReadSome<'_, B> {
    fn drop(&mut self) {
        if self.parked && !self.done {
            if let Some(imp) = &self.socket.inner {
                self.socket.ctx.reactor.disarm(&imp.source, Dir::Read);
            }
        }
    }
}

impl<B> fmt::Debug for ReadSome<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadSome").finish()
    }
}

/// Future returned by [`Socket::write_some`].
#[must_use = "futures do nothing unless awaited"]
pub struct WriteSome<'a, B> {
    socket: &'a Socket,
    bufs: B,
    done: bool,
    parked: bool,
    stop: Option<StopToken>,
}

impl<B> WriteSome<'_, B> {
    /// Attaches a stop token; a token signalled before the first poll
    /// completes with canceled without touching the OS.
    pub fn with_stop_token(mut self, token: StopToken) -> Self {
        self.stop = Some(token);
        self
    }
}

impl<B: ConstBufferSequence + Unpin> Future for WriteSome<'_, B> {
    type Output = io::Result<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        assert!(!this.done, "write_some polled after completion");

        if this.stop.as_ref().map_or(false, |t| t.stop_requested()) {
            this.done = true;
            return Poll::Ready(Err(canceled()));
        }

        let mut chunks: [IoSlice<'_>; MAX_BUFFER_CHUNKS] = [IoSlice::new(&[]); MAX_BUFFER_CHUNKS];
        let filled = this.bufs.chunks_vectored(&mut chunks);
        match this.socket.poll_writev(cx, &chunks[..filled]) {
            Poll::Ready(result) => {
                this.done = true;
                Poll::Ready(result)
            }
            Poll::Pending => {
                this.parked = true;
                if let Some(token) = &this.stop {
                    token.register(cx.waker());
                }
                Poll::Pending
            }
        }
    }
}

impl<B> Drop for WriteSome<'_, B> {
    fn drop(&mut self) {
        if self.parked && !self.done {
            if let Some(imp) = &self.socket.inner {
                self.socket.ctx.reactor.disarm(&imp.source, Dir::Write);
            }
        }
    }
}

impl<B> fmt::Debug for WriteSome<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteSome").finish()
    }
}
