use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

/// Waker backed by `eventfd`.
///
/// `eventfd` is effectively a 64 bit counter. All writes must be of 8
/// bytes (64 bits) and are converted (native endian) into a 64 bit
/// unsigned integer and added to the count. Reads must also be 8 bytes
/// and reset the count to 0, returning the count.
#[derive(Debug)]
pub(crate) struct WakerInternal {
    fd: File,
}

impl WakerInternal {
    pub(crate) fn new() -> io::Result<WakerInternal> {
        let flags = libc::EFD_CLOEXEC | libc::EFD_NONBLOCK;
        let fd = syscall!(eventfd(0, flags))?;

        let file = unsafe { File::from_raw_fd(fd) };
        Ok(WakerInternal { fd: file })
    }

    #[allow(clippy::unused_io_amount)] // Don't care about partial writes.
    pub(crate) fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Writing only blocks if the counter is about to overflow.
                // Reset the counter to 0 and wake again.
                self.drain();
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    /// The descriptor a raw 8-byte write must target to trigger a wakeup.
    /// Exposed for the process signal handler, which may only call
    /// async-signal-safe functions.
    pub(crate) fn wake_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Reset the eventfd counter after the selector reported it readable.
    #[allow(clippy::unused_io_amount)] // Don't care about partial reads.
    pub(crate) fn drain(&self) {
        let mut buf: [u8; 8] = 0u64.to_ne_bytes();
        // A `WouldBlock` error means the waker was not actually awoken,
        // which is fine.
        let _ = (&self.fd).read(&mut buf);
    }
}

impl AsRawFd for WakerInternal {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
