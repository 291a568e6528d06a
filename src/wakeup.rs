//! Self-pipe wakeup channel.
//!
//! Grounded on the source's `write_notif_pipe`/`mqtt_wss_wakeup`: a
//! one-way pipe whose read end is armed in the poll set alongside the
//! socket, so any producer thread can force `service`'s `poll(2)` call to
//! return early by writing a single filler byte. The read end is
//! non-blocking so a spurious or coalesced wakeup can never block the
//! loop thread; failures to write (a full pipe, `EAGAIN`) are ignored,
//! since the loop only cares that *a* byte arrived, not how many.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{close, pipe2, read, write};

/// Drain scratch size, matching the source's `THROWAWAY_BUF_SIZE`. Kept as
/// a stack-local buffer in the port rather than the source's file-global
/// static.
const DRAIN_BUF_SIZE: usize = 32;

#[derive(Debug)]
pub struct Wakeup {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Wakeup {
    pub fn new() -> io::Result<Self> {
        let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
        let read_fd = read_fd.into_raw_fd_shim();
        let write_fd = write_fd.into_raw_fd_shim();
        let flags = fcntl(read_fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
        fcntl(
            read_fd,
            FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
        )
        .map_err(io::Error::from)?;
        Ok(Self { read_fd, write_fd })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Wakes the loop thread. Best-effort: a full or already-signaled pipe
    /// is not an error, it just means the loop hasn't drained yet.
    pub fn wakeup(&self) {
        let _ = write(self.write_fd, &[0u8]);
    }

    /// Drains up to [`DRAIN_BUF_SIZE`] bytes from the read end. Called once
    /// the poll set reports the read end readable; coalesces any number of
    /// pending wakeups into one drain per `service` iteration.
    pub fn drain(&self) {
        let mut buf = [0u8; DRAIN_BUF_SIZE];
        loop {
            match read(self.read_fd, &mut buf) {
                Ok(0) => break,
                Ok(n) if n < buf.len() => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }
}

impl AsRawFd for Wakeup {
    fn as_raw_fd(&self) -> RawFd {
        self.read_fd
    }
}

impl Drop for Wakeup {
    fn drop(&mut self) {
        let _ = close(self.read_fd);
        let _ = close(self.write_fd);
    }
}

/// `nix` 0.29's `pipe2` returns `OwnedFd`; the rest of this module (and the
/// `poll` module it's paired with) works in terms of raw fds to keep the
/// type shared with `PollFd::from(RawFd)` call sites simple.
trait IntoRawFdShim {
    fn into_raw_fd_shim(self) -> RawFd;
}

impl IntoRawFdShim for std::os::fd::OwnedFd {
    fn into_raw_fd_shim(self) -> RawFd {
        std::os::fd::IntoRawFd::into_raw_fd(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakeup_then_drain_observes_readiness() {
        let w = Wakeup::new().unwrap();
        w.wakeup();
        w.wakeup();
        w.wakeup();
        // Multiple wakeups coalesce; drain should not block and should
        // leave the pipe empty.
        w.drain();

        let mut buf = [0u8; 1];
        let err = read(w.read_fd, &mut buf).unwrap_err();
        assert_eq!(err, nix::errno::Errno::EAGAIN);
    }
}
