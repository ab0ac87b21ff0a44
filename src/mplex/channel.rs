//! Self-pipe used to wake a thread blocked in a multiplexor wait
//!
//! The read end is registered with the waiter's multiplexor; any other
//! thread calls [`Channel::notify`] to make that end readable, which causes
//! a pending or the next `wait` to return. Only the arrival of a byte
//! matters, never its value.

use log::{debug, error};
use std::io::{Error, ErrorKind};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{ChatError, Result};

const WAKE_BYTE: u8 = b's';

#[derive(Debug)]
pub struct Channel {
    read_pipe: OwnedFd,
    write_pipe: OwnedFd,
}

impl Channel {
    /// Allocate a connected pipe. Both ends are close-on-exec and
    /// non-blocking.
    pub fn new() -> Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc < 0 {
            let err = Error::last_os_error();
            error!("Unable to create channel: {}", err);
            return Err(ChatError::ChannelCreate(err));
        }

        // SAFETY: pipe(2) returned two fresh descriptors owned by nobody else.
        let (read_pipe, write_pipe) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        for fd in [&read_pipe, &write_pipe] {
            configure(fd.as_raw_fd()).map_err(ChatError::ChannelCreate)?;
        }

        Ok(Self {
            read_pipe,
            write_pipe,
        })
    }

    /// Write raw bytes into the pipe, retrying interrupted calls.
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        loop {
            let n = unsafe {
                libc::write(
                    self.write_pipe.as_raw_fd(),
                    bytes.as_ptr() as *const libc::c_void,
                    bytes.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(ChatError::Io(err));
            }
        }
    }

    /// Wake the thread waiting on the read end.
    pub fn notify(&self) -> Result<()> {
        match self.write(&[WAKE_BYTE]) {
            Ok(_) => Ok(()),
            // A full pipe is already readable
            Err(ChatError::Io(e)) if e.kind() == ErrorKind::WouldBlock => {
                debug!("Channel already signalled");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_pipe.as_raw_fd()
    }

    pub fn write_fd(&self) -> RawFd {
        self.write_pipe.as_raw_fd()
    }

    pub fn read_end(&self) -> BorrowedFd<'_> {
        self.read_pipe.as_fd()
    }
}

/// Consume every pending wake-up byte on a non-blocking read end.
///
/// Returns the number of bytes discarded.
pub fn drain_wakeups(fd: BorrowedFd<'_>) -> usize {
    let mut buf = [0u8; 64];
    let mut drained = 0;
    loop {
        let n = unsafe {
            libc::read(
                fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n > 0 {
            drained += n as usize;
            continue;
        }
        if n < 0 && Error::last_os_error().kind() == ErrorKind::Interrupted {
            continue;
        }
        return drained;
    }
}

fn configure(fd: RawFd) -> std::io::Result<()> {
    unsafe {
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(Error::last_os_error());
        }
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_creation() {
        let channel = Channel::new().expect("Failed to create channel");
        assert_ne!(channel.read_fd(), channel.write_fd());
    }

    #[test]
    fn test_notify_then_drain() {
        let channel = Channel::new().expect("Failed to create channel");
        channel.notify().unwrap();
        channel.notify().unwrap();
        assert_eq!(drain_wakeups(channel.read_end()), 2);
        assert_eq!(drain_wakeups(channel.read_end()), 0);
    }

    #[test]
    fn test_write_reports_count() {
        let channel = Channel::new().expect("Failed to create channel");
        assert_eq!(channel.write(b"akko").unwrap(), 4);
        assert_eq!(drain_wakeups(channel.read_end()), 4);
    }
}
