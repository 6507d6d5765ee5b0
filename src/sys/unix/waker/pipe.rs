use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

/// Waker backed by a unix pipe.
///
/// The waker controls both the sending and receiving ends and empties
/// the pipe if writing to it (waking) fails.
#[derive(Debug)]
pub(crate) struct WakerInternal {
    sender: File,
    receiver: File,
}

impl WakerInternal {
    pub(crate) fn new() -> io::Result<WakerInternal> {
        let mut fds: [RawFd; 2] = [-1, -1];
        #[cfg(not(any(target_os = "ios", target_os = "macos")))]
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
        // Darwin has no `pipe2(2)`; set the flags after the fact.
        #[cfg(any(target_os = "ios", target_os = "macos"))]
        {
            syscall!(pipe(fds.as_mut_ptr()))?;
            for fd in &fds {
                syscall!(fcntl(*fd, libc::F_SETFL, libc::O_NONBLOCK))?;
                syscall!(fcntl(*fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
            }
        }
        let receiver = unsafe { File::from_raw_fd(fds[0]) };
        let sender = unsafe { File::from_raw_fd(fds[1]) };
        Ok(WakerInternal { sender, receiver })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        // Matches the eventfd payload so the same write works from the
        // process signal handler on every platform.
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.sender).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // The reading end is full; empty the buffer and try again.
                self.drain();
                self.wake()
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.wake(),
            Err(err) => Err(err),
        }
    }

    /// The descriptor a raw 8-byte write must target to trigger a wakeup.
    /// Exposed for the process signal handler, which may only call
    /// async-signal-safe functions.
    pub(crate) fn wake_fd(&self) -> RawFd {
        self.sender.as_raw_fd()
    }

    /// Empty the pipe's buffer after the selector reported it readable.
    pub(crate) fn drain(&self) {
        let mut buf = [0; 4096];
        loop {
            match (&self.receiver).read(&mut buf) {
                Ok(n) if n > 0 => continue,
                _ => return,
            }
        }
    }
}

impl AsRawFd for WakerInternal {
    fn as_raw_fd(&self) -> RawFd {
        self.receiver.as_raw_fd()
    }
}
