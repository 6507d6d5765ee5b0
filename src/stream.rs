//! The byte-stream contract layered transports build on.
//!
//! A TLS implementation (or any other stream transform) lives outside
//! this crate: it wraps a type implementing [`IoStream`], performs its
//! handshake over it, and exposes [`IoStream`] itself. Two conventions
//! bind such backends:
//!
//! * configuration problems (bad certificate material, unusable cipher
//!   lists) must surface when the stream is constructed, not later at
//!   handshake time;
//! * a transport closed without the protocol's own closing exchange is
//!   reported through [`stream_truncated`](crate::stream_truncated),
//!   matched by [`Cond::StreamTruncated`](crate::Cond::StreamTruncated).

use std::io;
use std::net::Shutdown;
use std::task::{Context, Poll};

use crate::net::Socket;

/// A non-blocking byte stream driven by polling.
///
/// The methods mirror the crate's operation futures one level down:
/// each attempts the transfer and either completes or parks the calling
/// task's waker for the next readiness edge. End-of-stream is reported
/// as the [`Cond::Eof`](crate::Cond::Eof) error condition; an empty
/// buffer completes with `Ok(0)` immediately.
pub trait IoStream {
    /// Attempts to read into `buf`, completing with at least one byte.
    fn poll_read_some(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>>;

    /// Attempts to write from `buf`, completing with the number of
    /// bytes transferred.
    fn poll_write_some(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>>;

    /// Performs an orderly shutdown of the sending direction.
    fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl IoStream for Socket {
    fn poll_read_some(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut chunks = [io::IoSliceMut::new(buf)];
        self.poll_readv(cx, &mut chunks)
    }

    fn poll_write_some(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let chunks = [io::IoSlice::new(buf)];
        self.poll_writev(cx, &chunks)
    }

    fn poll_shutdown(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Socket::shutdown(self, Shutdown::Write);
        Poll::Ready(Ok(()))
    }
}
