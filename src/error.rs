//! Error handling for vigil.
use std::path::PathBuf;

use thiserror::Error;

/// Defines all possible errors raised while setting up or driving a reactor.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// Error creating the wake channel during reactor initialization.
    ///
    /// The reactor cannot run without its wake channel, so this aborts
    /// startup rather than being retried.
    #[error("Failed to create wake channel: {0}")]
    WakeChannel(#[source] std::io::Error),
}

/// Error type for pid-file operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// An explicitly configured pid-file path was not absolute.
    #[error("Pid file path must be absolute: {}", .0.display())]
    RelativePath(PathBuf),

    /// Error writing the pid file. The previous file, if any, is left
    /// untouched and the temporary sibling has been removed.
    #[error("Failed to write pid file '{}': {source}", .path.display())]
    Write {
        /// The pid-file path the write was aimed at.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

/// Error type for the daemonization sequence.
///
/// Any of these is fatal to startup; by the time they can occur the caller
/// may already be running in a forked child.
#[derive(Debug, Error)]
pub enum DaemonizeError {
    /// One of the two forks failed.
    #[error("Failed to fork: {0}")]
    Fork(#[source] nix::errno::Errno),

    /// Becoming a session leader failed.
    #[error("Failed to create new session: {0}")]
    NewSession(#[source] nix::errno::Errno),

    /// Setting the hang-up signal to be ignored failed.
    #[error("Failed to ignore SIGHUP: {0}")]
    IgnoreHangup(#[source] nix::errno::Errno),
}
