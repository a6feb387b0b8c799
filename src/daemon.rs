//! Double-fork daemonization.
//!
//! Preferable to libc's `daemon(3)` because the surviving process is
//! guaranteed not to be a session leader, so a later `open(2)` on a tty
//! can never make that tty its controlling terminal.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::process;

use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{self, ForkResult};
use tracing::warn;

use crate::error::DaemonizeError;
use crate::pidfile::PidFile;

/// Device bound to stdin/stdout/stderr after detaching.
pub const DEV_NULL: &str = "/dev/null";

/// Detaches the calling process into a daemon.
///
/// Returns only in the final, fully detached process; every intermediate
/// process exits with status 0, so a caller that needs to know whether
/// the daemon came up must consult the pid file, not this helper's exit
/// code. The intermediate parent writes the final pid through `pid_file`
/// best-effort: by then nothing is attached that could receive a
/// synchronous failure report, so a failed write is only logged.
///
/// On return the process is not a session leader, its working directory
/// is `/`, its file-creation mask is cleared, and its standard streams
/// are bound to [`DEV_NULL`].
pub fn daemonize(pid_file: &PidFile) -> Result<(), DaemonizeError> {
    // First fork: the original invoker exits immediately, so whatever
    // started us sees a prompt, successful return.
    match unsafe { unistd::fork() }.map_err(DaemonizeError::Fork)? {
        ForkResult::Parent { .. } => process::exit(0),
        ForkResult::Child => {}
    }

    // Session and process-group leader with no controlling terminal.
    unistd::setsid().map_err(DaemonizeError::NewSession)?;

    // When a session leader dies, SIGHUP is sent to every process in its
    // group. The intermediate parent below terminates as exactly such a
    // leader, so the signal must already be ignored before the fork.
    unsafe { signal::signal(Signal::SIGHUP, SigHandler::SigIgn) }
        .map_err(DaemonizeError::IgnoreHangup)?;

    // Second fork: the survivor cannot be a session leader, even by
    // accident.
    match unsafe { unistd::fork() }.map_err(DaemonizeError::Fork)? {
        ForkResult::Parent { child } => {
            if let Err(err) = pid_file.write(child.as_raw() as u32) {
                warn!("unable to write pid file: {err}");
            }
            process::exit(0);
        }
        ForkResult::Child => {}
    }

    // A daemon must not pin the directory it happened to start in, and
    // inherits no business with the caller's umask.
    let _ = std::env::set_current_dir("/");
    unsafe { libc::umask(0) };

    rebind_stdio();
    Ok(())
}

/// Points fds 0, 1, and 2 at the null device.
fn rebind_stdio() {
    match OpenOptions::new().read(true).write(true).open(DEV_NULL) {
        Ok(null) => {
            let null_fd = null.as_raw_fd();
            for fd in 0..3 {
                if fd != null_fd {
                    // dup2 atomically closes the inherited descriptor.
                    unsafe { libc::dup2(null_fd, fd) };
                }
            }
            // If a standard descriptor was already closed, open() handed
            // us one of 0..=2; that descriptor is now a bound stream and
            // must survive the drop of `null`.
            if null_fd <= 2 {
                std::mem::forget(null);
            }
        }
        Err(err) => {
            warn!("unable to open {DEV_NULL}: {err}");
            for fd in 0..3 {
                unsafe { libc::close(fd) };
            }
        }
    }
}
