//! Two-descriptor poll scheduler and keep-alive clamp arithmetic.
//!
//! Grounded on the source's `set_socket_pollfds` (rebuilding the socket's
//! event mask every iteration from the TLS want-bits and the
//! `didnt_finish_write` flag) and `t_till_next_keep_alive_ms` (clamping the
//! caller's requested timeout to whatever's left before a PING is due).

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

/// What the socket side of the poll set should watch for this iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketInterest {
    pub read: bool,
    pub write: bool,
}

impl SocketInterest {
    pub fn to_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.read {
            flags |= PollFlags::POLLIN;
        }
        if self.write {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }
}

/// Result of one `poll(2)` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub socket_readable: bool,
    pub socket_writable: bool,
    pub wakeup_readable: bool,
    /// True when poll timed out with nothing ready — the service routine's
    /// cue to check whether a keep-alive PING is due.
    pub timed_out: bool,
}

/// Blocks until the socket or wakeup fd is ready, or `timeout` elapses.
/// Retries transparently on `EINTR` with the remaining portion of the
/// timeout — a deliberate improvement over the source, which has no
/// equivalent retry and would surface `EINTR` as a hard poll failure.
pub fn poll_once(
    socket_fd: RawFd,
    wakeup_fd: RawFd,
    interest: SocketInterest,
    timeout: Option<Duration>,
) -> nix::Result<Readiness> {
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        let remaining = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    Duration::ZERO
                } else {
                    d - now
                }
            }
            None => Duration::from_millis(u32::MAX as u64),
        };

        let mut fds = [
            PollFd::new(unsafe { std::os::fd::BorrowedFd::borrow_raw(socket_fd) }, interest.to_flags()),
            PollFd::new(
                unsafe { std::os::fd::BorrowedFd::borrow_raw(wakeup_fd) },
                PollFlags::POLLIN,
            ),
        ];

        // PollTimeout is backed by a single c_int of milliseconds, so a
        // remaining duration longer than u16::MAX ms is split into several
        // poll() calls rather than risking truncation; only the call that
        // actually reaches the deadline reports `timed_out`.
        let remaining_ms = remaining.as_millis();
        let (ptimeout, call_reaches_deadline) = if timeout.is_none() {
            (PollTimeout::NONE, false)
        } else if remaining_ms > u16::MAX as u128 {
            (PollTimeout::from(u16::MAX), false)
        } else {
            (PollTimeout::from(remaining_ms as u16), true)
        };

        match poll(&mut fds, ptimeout) {
            Ok(0) => {
                if call_reaches_deadline {
                    return Ok(Readiness {
                        timed_out: true,
                        ..Default::default()
                    });
                }
                continue;
            }
            Ok(_) => {
                let socket_revents = fds[0].revents().unwrap_or(PollFlags::empty());
                let wakeup_revents = fds[1].revents().unwrap_or(PollFlags::empty());
                return Ok(Readiness {
                    socket_readable: socket_revents.contains(PollFlags::POLLIN),
                    socket_writable: socket_revents.contains(PollFlags::POLLOUT),
                    wakeup_readable: wakeup_revents.contains(PollFlags::POLLIN),
                    timed_out: false,
                });
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Clamps `requested` (the caller's `service(timeout_ms)` argument) to the
/// time remaining before a keep-alive PING is due, per the source's
/// `if (client->mqtt_connected && t_till_next_keep_alive_ms(...) < timeout_ms)`.
/// Before a session is connected there's no keep-alive deadline to honor
/// yet, so `requested` passes through unclamped — otherwise a `connect`
/// loop's indefinite wait for CONNACK would get clamped to an already-past
/// deadline and spin on zero-timeout polls instead of blocking.
pub fn clamp_to_keepalive(
    requested: Option<Duration>,
    connected: bool,
    last_send: Instant,
    keep_alive: Duration,
    now: Instant,
) -> Option<Duration> {
    if !connected {
        return requested;
    }
    let due_at = last_send + keep_alive.mul_f64(0.75);
    let till_due = due_at.saturating_duration_since(now);
    match requested {
        None => Some(till_due),
        Some(req) => Some(req.min(till_due)),
    }
}
