//! Vigil is a lightweight event-loop core for building Unix service and
//! daemon processes. It provides a single-threaded reactor that multiplexes
//! readiness-based I/O, interval timers, POSIX signal delivery, and child
//! termination in one deterministic cycle, along with double-fork
//! daemonization and atomic pid-file persistence.

/// Double-fork daemonization.
pub mod daemon;

/// Error handling.
pub mod error;

/// Program identity taken from the argument array.
pub mod identity;

/// Atomic pid-file persistence.
pub mod pidfile;

/// The reactor loop and its collaborator seams.
pub mod reactor;

/// Handle-addressed per-iteration callback registry.
pub mod registry;

/// Self-pipe wake channel.
pub mod wake;
