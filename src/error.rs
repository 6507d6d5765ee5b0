use std::error;
use std::fmt;
use std::io;

/// Portable error conditions for branching on I/O failures.
///
/// Operations report failures as [`io::Error`] values carrying the raw
/// platform code where one exists. `Cond` classifies those errors into a
/// platform-neutral taxonomy so callers can branch portably:
///
/// ```
/// use corio::Cond;
/// use std::io;
///
/// fn handle(err: io::Error) {
///     if Cond::Canceled == err {
///         // the operation was cancelled, not failed
///     }
/// }
/// ```
///
/// Protocol-level conditions (`Eof`, `Canceled`, `StreamTruncated`) flow
/// through the same channel as OS errors and must be matched through this
/// type rather than by comparing raw codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Cond {
    /// The operation was cancelled via `cancel()`, a stop token, or
    /// object teardown.
    Canceled,
    /// The peer closed its sending direction; no more data will arrive.
    Eof,
    /// A TLS peer closed the transport without a `close_notify`.
    StreamTruncated,
    /// No listener at the remote endpoint.
    ConnectionRefused,
    /// The connection was forcibly closed by the peer.
    ConnectionReset,
    /// A write on a connection already closed by the peer.
    BrokenPipe,
    /// The operation did not complete within the OS-imposed time limit.
    TimedOut,
    /// No route to the remote network.
    NetworkUnreachable,
    /// The local endpoint is already in use.
    AddrInUse,
    /// An argument was rejected by the OS or by this crate.
    InvalidArgument,
    /// The OS does not support the requested operation.
    NotSupported,
    /// The operation was denied by the OS.
    PermissionDenied,
    /// Reserved for test doubles that need a recognizable failure.
    TestFailure,
    /// Any other system error; inspect the raw code for details.
    SystemError,
}

impl Cond {
    /// Classify an I/O error.
    pub fn of(err: &io::Error) -> Cond {
        if let Some(cond) = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<CondError>())
        {
            return cond.0;
        }
        if let Some(code) = err.raw_os_error() {
            return match code {
                libc::ECANCELED => Cond::Canceled,
                libc::ECONNREFUSED => Cond::ConnectionRefused,
                libc::ECONNRESET => Cond::ConnectionReset,
                libc::EPIPE => Cond::BrokenPipe,
                libc::ETIMEDOUT => Cond::TimedOut,
                libc::ENETUNREACH | libc::EHOSTUNREACH => Cond::NetworkUnreachable,
                libc::EADDRINUSE => Cond::AddrInUse,
                libc::EINVAL => Cond::InvalidArgument,
                libc::EOPNOTSUPP => Cond::NotSupported,
                libc::EACCES | libc::EPERM => Cond::PermissionDenied,
                _ => Cond::SystemError,
            };
        }
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Cond::Eof,
            io::ErrorKind::ConnectionRefused => Cond::ConnectionRefused,
            io::ErrorKind::ConnectionReset => Cond::ConnectionReset,
            io::ErrorKind::BrokenPipe => Cond::BrokenPipe,
            io::ErrorKind::TimedOut => Cond::TimedOut,
            io::ErrorKind::AddrInUse => Cond::AddrInUse,
            io::ErrorKind::InvalidInput => Cond::InvalidArgument,
            io::ErrorKind::PermissionDenied => Cond::PermissionDenied,
            _ => Cond::SystemError,
        }
    }

    /// Returns `true` when `err` matches this condition.
    pub fn matches(self, err: &io::Error) -> bool {
        Cond::of(err) == self
    }
}

impl PartialEq<io::Error> for Cond {
    fn eq(&self, err: &io::Error) -> bool {
        self.matches(err)
    }
}

impl PartialEq<Cond> for io::Error {
    fn eq(&self, cond: &Cond) -> bool {
        cond.matches(self)
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Cond::Canceled => "operation canceled",
            Cond::Eof => "end of stream",
            Cond::StreamTruncated => "stream truncated",
            Cond::ConnectionRefused => "connection refused",
            Cond::ConnectionReset => "connection reset",
            Cond::BrokenPipe => "broken pipe",
            Cond::TimedOut => "timed out",
            Cond::NetworkUnreachable => "network unreachable",
            Cond::AddrInUse => "address in use",
            Cond::InvalidArgument => "invalid argument",
            Cond::NotSupported => "operation not supported",
            Cond::PermissionDenied => "permission denied",
            Cond::TestFailure => "test failure",
            Cond::SystemError => "system error",
        };
        f.write_str(msg)
    }
}

/// Payload carried inside `io::Error` for conditions that have no
/// faithful errno representation.
#[derive(Debug)]
struct CondError(Cond);

impl fmt::Display for CondError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl error::Error for CondError {}

fn cond_error(kind: io::ErrorKind, cond: Cond) -> io::Error {
    io::Error::new(kind, CondError(cond))
}

/// The error all cancelled operations complete with.
pub(crate) fn canceled() -> io::Error {
    io::Error::from_raw_os_error(libc::ECANCELED)
}

/// End-of-stream, reported when a peer half-closes its sending side.
pub(crate) fn eof() -> io::Error {
    cond_error(io::ErrorKind::UnexpectedEof, Cond::Eof)
}

/// Truncated TLS stream. Public constructor for external stream
/// backends layered over [`crate::stream::IoStream`].
pub fn stream_truncated() -> io::Error {
    cond_error(io::ErrorKind::UnexpectedEof, Cond::StreamTruncated)
}

/// Recognizable failure for test doubles.
pub fn test_failure() -> io::Error {
    cond_error(io::ErrorKind::Other, Cond::TestFailure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canceled_matches() {
        let err = canceled();
        assert!(Cond::Canceled == err);
        assert!(err == Cond::Canceled);
        assert!(Cond::Eof != err);
    }

    #[test]
    fn eof_and_truncated_are_distinct() {
        assert_eq!(Cond::of(&eof()), Cond::Eof);
        assert_eq!(Cond::of(&stream_truncated()), Cond::StreamTruncated);
        assert_ne!(Cond::of(&eof()), Cond::StreamTruncated);
    }

    #[test]
    fn errno_classification() {
        let refused = io::Error::from_raw_os_error(libc::ECONNREFUSED);
        assert_eq!(Cond::of(&refused), Cond::ConnectionRefused);
        let unreachable = io::Error::from_raw_os_error(libc::ENETUNREACH);
        assert_eq!(Cond::of(&unreachable), Cond::NetworkUnreachable);
        let other = io::Error::from_raw_os_error(libc::EIO);
        assert_eq!(Cond::of(&other), Cond::SystemError);
    }
}
