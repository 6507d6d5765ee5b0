use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use log::trace;
use socket2::Domain;

use crate::context::Inner;
use crate::error::canceled;
use crate::net::{new_tcp_socket, Socket, SocketImpl};
use crate::reactor::Dir;
use crate::{Executor, IoContext, StopToken};

/// A listening TCP socket accepting connections into caller-provided
/// [`Socket`]s.
///
/// At most one accept may be pending at a time.
///
/// # Examples
///
/// ```
/// use corio::net::{Acceptor, Socket};
/// use corio::IoContext;
///
/// # fn main() -> std::io::Result<()> {
/// let ioc = IoContext::new()?;
/// let mut acceptor = Acceptor::new(&ioc);
/// acceptor.listen("127.0.0.1:0".parse().unwrap(), 128)?;
/// let port = acceptor.local_addr()?.port();
/// assert_ne!(port, 0);
/// # Ok(())
/// # }
/// ```
pub struct Acceptor {
    ctx: Arc<Inner>,
    inner: Option<SocketImpl>,
}

impl Acceptor {
    /// Creates a closed acceptor owned by `ctx`.
    pub fn new(ctx: &IoContext) -> Acceptor {
        Acceptor {
            ctx: ctx.inner().clone(),
            inner: None,
        }
    }

    /// Creates a closed acceptor on the executor's context.
    pub fn from_executor(ex: &Executor) -> Acceptor {
        Acceptor {
            ctx: ex.inner.clone(),
            inner: None,
        }
    }

    /// Opens, binds and listens on `endpoint` with the given backlog.
    /// `SO_REUSEADDR` is set before binding. An already listening
    /// acceptor is closed first.
    pub fn listen(&mut self, endpoint: SocketAddr, backlog: u32) -> io::Result<()> {
        self.close();
        let socket = new_tcp_socket(Domain::for_address(endpoint))?;
        socket.set_reuse_address(true)?;
        socket.bind(&endpoint.into())?;
        socket.listen(backlog as i32)?;
        trace!("listening on {} fd={}", endpoint, socket.as_raw_fd());
        let source = self.ctx.reactor.register_source(socket.as_raw_fd());
        self.inner = Some(SocketImpl { socket, source });
        Ok(())
    }

    /// Whether the acceptor is listening.
    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// The bound local endpoint; reports the assigned port after
    /// listening on port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.get()
            .socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::ErrorKind::InvalidInput.into())
    }

    /// Stops listening. A pending accept completes with
    /// [`Cond::Canceled`]. Always safe.
    ///
    /// [`Cond::Canceled`]: crate::Cond::Canceled
    pub fn close(&mut self) {
        if let Some(imp) = self.inner.take() {
            trace!("closing acceptor fd={}", imp.socket.as_raw_fd());
            self.ctx.reactor.remove_source(&imp.source);
        }
    }

    /// Cancels a pending accept; it completes with [`Cond::Canceled`].
    /// Idempotent.
    ///
    /// [`Cond::Canceled`]: crate::Cond::Canceled
    pub fn cancel(&self) {
        if let Some(imp) = &self.inner {
            self.ctx.reactor.cancel(&imp.source);
        }
    }

    /// The executor of the owning context.
    pub fn executor(&self) -> Executor {
        Executor {
            inner: self.ctx.clone(),
        }
    }

    /// Awaits an incoming connection and transfers the accepted stream
    /// into `peer`. Whatever `peer` held before is closed first; on
    /// success it holds the connected, non-blocking, reactor-registered
    /// stream.
    ///
    /// # Panics
    ///
    /// Panics if the acceptor is not listening, or if `peer` belongs to
    /// a different execution context.
    pub fn accept<'a>(&'a self, peer: &'a mut Socket) -> Accept<'a> {
        assert!(self.is_open(), "accept: acceptor is not listening");
        assert!(
            Arc::ptr_eq(&self.ctx, peer.ctx()),
            "accept: peer socket belongs to a different context"
        );
        Accept {
            acceptor: self,
            peer,
            done: false,
            parked: false,
            stop: None,
        }
    }

    fn get(&self) -> &SocketImpl {
        self.inner.as_ref().expect("acceptor is not listening")
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsRawFd for Acceptor {
    /// The native handle, or `-1` when closed.
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_ref().map_or(-1, |imp| imp.socket.as_raw_fd())
    }
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor").field("fd", &self.as_raw_fd()).finish()
    }
}

/// Future returned by [`Acceptor::accept`].
#[must_use = "futures do nothing unless awaited"]
pub struct Accept<'a> {
    acceptor: &'a Acceptor,
    peer: &'a mut Socket,
    done: bool,
    parked: bool,
    stop: Option<StopToken>,
}

impl Accept<'_> {
    /// Attaches a stop token; a token signalled before the first poll
    /// completes with canceled without touching the OS.
    pub fn with_stop_token(mut self, token: StopToken) -> Self {
        self.stop = Some(token);
        self
    }
}

impl Future for Accept<'_> {
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        assert!(!this.done, "accept polled after completion");
        let imp = this.acceptor.get();

        if this.stop.as_ref().map_or(false, |t| t.stop_requested()) {
            this.done = true;
            return Poll::Ready(Err(canceled()));
        }
        if this
            .acceptor
            .ctx
            .reactor
            .take_cancel(&imp.source, Dir::Read)
        {
            this.done = true;
            return Poll::Ready(Err(canceled()));
        }

        loop {
            match imp.socket.accept() {
                Ok((stream, _addr)) => {
                    this.done = true;
                    if let Err(err) = stream.set_nonblocking(true) {
                        return Poll::Ready(Err(err));
                    }
                    let source = this
                        .acceptor
                        .ctx
                        .reactor
                        .register_source(stream.as_raw_fd());
                    this.peer.install(SocketImpl {
                        socket: stream,
                        source,
                    });
                    return Poll::Ready(Ok(()));
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                // The connection died between the OS queue and our
                // accept; wait for the next one.
                Err(ref err) if err.raw_os_error() == Some(libc::ECONNABORTED) => continue,
                Err(err) => {
                    this.done = true;
                    return Poll::Ready(Err(err));
                }
            }
        }

        if let Err(err) = this
            .acceptor
            .ctx
            .reactor
            .arm(&imp.source, Dir::Read, cx.waker())
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

impl Drop for Accept<'_> {
    fn drop(&mut self) {
        if self.parked && !self.done {
            if let Some(imp) = &self.acceptor.inner {
                self.acceptor.ctx.reactor.disarm(&imp.source, Dir::Read);
            }
        }
    }
}

impl fmt::Debug for Accept<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accept").finish()
    }
}
