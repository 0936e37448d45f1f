//! Bounded waits on raw file descriptors.
//!
//! The standard library has no accept timeout and no way to wait on a FIFO
//! without blocking in `open`/`read`, so both the stream listener and the
//! FIFO reply reader go through [`wait_readable`].

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

/// Waits until `fd` is readable or `timeout` elapses.
///
/// Returns `Ok(true)` when data (or a hangup) is pending, `Ok(false)` on
/// timeout. `EINTR` is reported as a timeout so callers re-check their own
/// cancellation state before waiting again.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

    // SAFETY: `pollfd` is a valid, exclusively borrowed pollfd array of length 1.
    let rc = unsafe { libc::poll(&mut pollfd, 1, millis) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    if rc == 0 {
        return Ok(false);
    }
    if pollfd.revents & libc::POLLNVAL != 0 {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    Ok(pollfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn times_out_without_data() {
        let (a, _b) = UnixStream::pair().unwrap();
        let start = Instant::now();
        let ready = wait_readable(a.as_fd(), Duration::from_millis(50)).unwrap();
        assert!(!ready);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn reports_pending_data() {
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();
        assert!(wait_readable(a.as_fd(), Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn reports_hangup_as_readable() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        assert!(wait_readable(a.as_fd(), Duration::from_secs(1)).unwrap());
    }
}
