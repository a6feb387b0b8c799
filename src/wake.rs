//! Self-pipe wake channel.
//!
//! A pair of connected descriptors whose only job is making a blocking
//! descriptor wait return promptly. Any context, including a signal
//! handler interrupting the loop thread, may post a wake; the loop side
//! drains the pipe once per iteration, so any number of pending wakes
//! coalesce into a single observation. The bytes themselves carry no
//! meaning.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// The reactor-owned side of the wake channel.
///
/// Both descriptors are created once, configured non-blocking and
/// close-on-exec, and live for the owning reactor's lifetime. External
/// code must never close them directly; cloneable [`WakeNotifier`]s keep
/// the write end alive for posting contexts.
#[derive(Debug)]
pub struct WakeChannel {
    read: OwnedFd,
    write: Arc<OwnedFd>,
}

impl WakeChannel {
    /// Creates the channel. Failure here is unrecoverable for a reactor:
    /// without the pipe, a signal arriving between a poll and the next
    /// blocking wait would go unnoticed until the wait times out.
    pub fn new() -> io::Result<Self> {
        let mut fds = [-1 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }

        // Wrap immediately so the descriptors are released on any
        // configuration failure below.
        let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        // Non-blocking on both ends: posting must never stall the caller
        // when the pipe is full, and draining must stop at empty.
        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            set_nonblock(fd)?;
            set_cloexec(fd)?;
        }

        Ok(Self {
            read,
            write: Arc::new(write),
        })
    }

    /// The read end, for inclusion in the reactor's read set.
    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Returns a handle for posting wakes from other contexts.
    pub fn notifier(&self) -> WakeNotifier {
        WakeNotifier {
            write: Arc::clone(&self.write),
        }
    }

    /// Discards every byte currently buffered in the pipe.
    ///
    /// Returns whether at least one wake was pending. K pending wakes and
    /// one pending wake are indistinguishable after this call; deciding
    /// what actually happened is the job of the poll steps that follow.
    pub fn drain(&self) -> bool {
        let mut buf = [0u8; 64];
        let mut woken = false;
        loop {
            let n = unsafe {
                libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if n > 0 {
                woken = true;
                continue;
            }
            if n == 0 {
                // Write end closed; cannot happen while we hold it.
                return woken;
            }
            match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                _ => return woken,
            }
        }
    }
}

/// Posting side of a [`WakeChannel`]. Cloneable, `Send`, and `Sync`.
#[derive(Debug, Clone)]
pub struct WakeNotifier {
    write: Arc<OwnedFd>,
}

impl WakeNotifier {
    /// Makes the next (or current) blocking wait on the owning reactor
    /// return promptly.
    ///
    /// Safe to call from arbitrary asynchronous contexts including signal
    /// handlers: the only syscall involved is a single `write(2)`. A full
    /// pipe means a wake is already pending, which is success.
    pub fn post_wake(&self) {
        let buf = [0u8; 1];
        loop {
            let n = unsafe {
                libc::write(self.write.as_raw_fd(), buf.as_ptr().cast(), buf.len())
            };
            if n >= 0 {
                return;
            }
            match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                // EAGAIN: the pipe is full, so the wake coalesces.
                _ => return,
            }
        }
    }
}

fn set_nonblock(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
