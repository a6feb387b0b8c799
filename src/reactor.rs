//! The reactor loop and its collaborator seams.
//!
//! One reactor instance drives a single logical thread of control: in each
//! iteration it computes a timeout from the nearest timer deadline, blocks
//! in a multiplexed descriptor wait that always includes the wake channel's
//! read end, dispatches ready descriptors, drains the wake channel, polls
//! signals, children, and timers in that order, and finally runs every
//! registered per-iteration callback. The loop exits cooperatively: any
//! context may call [`LoopControl::request_exit`], and the loop returns the
//! recorded status at the next iteration boundary.
//!
//! The collaborators owning actual watches, handlers, deadlines, and child
//! reaping live behind the [`TimerSource`], [`IoSource`], [`SignalSource`],
//! and [`ChildSource`] traits; the reactor only sequences them.

use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::ReactorError;
use crate::registry::{CallbackId, Registry};
use crate::wake::{WakeChannel, WakeNotifier};

/// Supplies timer deadlines and fires elapsed timers.
pub trait TimerSource {
    /// Earliest absolute due time of any pending timer, on the monotonic
    /// clock, or `None` when no timer is pending.
    fn next_due(&mut self) -> Option<Instant>;

    /// Fires every timer that has come due. Called once per iteration.
    fn poll(&mut self);
}

/// Owns the fd-to-watch mapping and its dispatch.
pub trait IoSource {
    /// Adds every currently watched descriptor to `watches`.
    fn collect_fds(&mut self, watches: &mut FdSets);

    /// Matches ready descriptors to their watches and invokes them.
    /// `ready` holds the subset of collected descriptors that the wait
    /// reported ready, per set.
    fn dispatch(&mut self, ready: &FdSets);
}

/// Converts asynchronous signal delivery into a pollable queue.
pub trait SignalSource {
    /// Called once before the first iteration. Implementations installing
    /// process signal handlers should capture `control` so the handlers
    /// can interrupt a wait in progress.
    fn attach(&mut self, _control: &LoopControl) {}

    /// Runs handlers for every signal delivered since the last poll.
    /// Called once per iteration, strictly after the wake-channel drain.
    fn poll(&mut self);
}

/// Waits on terminated child processes.
pub trait ChildSource {
    /// Reaps and handles any children that exited since the last poll.
    fn poll(&mut self);
}

/// Read, write, and exceptional descriptor sets for one wait.
///
/// Descriptors above `FD_SETSIZE` cannot be represented by `select(2)` and
/// are rejected at insertion.
#[derive(Debug, Default, Clone)]
pub struct FdSets {
    read: Vec<RawFd>,
    write: Vec<RawFd>,
    except: Vec<RawFd>,
}

impl FdSets {
    /// Adds `fd` to the read set.
    pub fn watch_read(&mut self, fd: RawFd) {
        Self::push(&mut self.read, fd);
    }

    /// Adds `fd` to the write set.
    pub fn watch_write(&mut self, fd: RawFd) {
        Self::push(&mut self.write, fd);
    }

    /// Adds `fd` to the exceptional set.
    pub fn watch_except(&mut self, fd: RawFd) {
        Self::push(&mut self.except, fd);
    }

    fn push(set: &mut Vec<RawFd>, fd: RawFd) {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE {
            warn!(fd, "descriptor outside fd_set range, not watched");
            return;
        }
        if !set.contains(&fd) {
            set.push(fd);
        }
    }

    /// Descriptors ready (or watched) for reading.
    pub fn readable(&self) -> &[RawFd] {
        &self.read
    }

    /// Descriptors ready (or watched) for writing.
    pub fn writable(&self) -> &[RawFd] {
        &self.write
    }

    /// Descriptors with exceptional conditions.
    pub fn exceptional(&self) -> &[RawFd] {
        &self.except
    }

    /// Whether all three sets are empty.
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty() && self.except.is_empty()
    }

    fn max_fd(&self) -> RawFd {
        self.read
            .iter()
            .chain(&self.write)
            .chain(&self.except)
            .copied()
            .max()
            .unwrap_or(-1)
    }
}

/// Safe wrapper over `libc::fd_set`.
#[derive(Clone, Copy)]
struct RawFdSet(libc::fd_set);

impl RawFdSet {
    fn new() -> Self {
        let mut set = std::mem::MaybeUninit::<libc::fd_set>::zeroed();
        // SAFETY: FD_ZERO fully initializes the set.
        unsafe {
            libc::FD_ZERO(set.as_mut_ptr());
            Self(set.assume_init())
        }
    }

    fn insert(&mut self, fd: RawFd) {
        debug_assert!(fd >= 0 && (fd as usize) < libc::FD_SETSIZE);
        // SAFETY: fd is within fd_set range, checked at FdSets insertion.
        unsafe { libc::FD_SET(fd, &mut self.0) }
    }

    fn contains(&self, fd: RawFd) -> bool {
        // SAFETY: same range invariant as insert.
        unsafe { libc::FD_ISSET(fd, &self.0) }
    }
}

/// Blocks until a watched descriptor or `wake_fd` is ready, or `timeout`
/// elapses (`None` waits indefinitely). Returns the ready subset of
/// `watches`; readiness of `wake_fd` itself is not reported because the
/// caller drains the wake channel unconditionally afterwards.
fn wait(watches: &FdSets, wake_fd: RawFd, timeout: Option<Duration>) -> io::Result<FdSets> {
    let mut read_set = RawFdSet::new();
    let mut write_set = RawFdSet::new();
    let mut except_set = RawFdSet::new();

    // The wake channel's read end is always watched.
    read_set.insert(wake_fd);
    let mut nfds = wake_fd + 1;

    for &fd in watches.readable() {
        read_set.insert(fd);
    }
    for &fd in watches.writable() {
        write_set.insert(fd);
    }
    for &fd in watches.exceptional() {
        except_set.insert(fd);
    }
    nfds = nfds.max(watches.max_fd() + 1);

    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    let tv_ptr = match timeout {
        Some(duration) => {
            tv.tv_sec = duration.as_secs().min(libc::time_t::MAX as u64) as libc::time_t;
            tv.tv_usec = duration.subsec_micros() as libc::suseconds_t;
            &mut tv as *mut libc::timeval
        }
        None => std::ptr::null_mut(),
    };

    let ret = unsafe {
        libc::select(
            nfds,
            &mut read_set.0,
            &mut write_set.0,
            &mut except_set.0,
            tv_ptr,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut ready = FdSets::default();
    if ret > 0 {
        for &fd in watches.readable() {
            if read_set.contains(fd) {
                ready.read.push(fd);
            }
        }
        for &fd in watches.writable() {
            if write_set.contains(fd) {
                ready.write.push(fd);
            }
        }
        for &fd in watches.exceptional() {
            if except_set.contains(fd) {
                ready.except.push(fd);
            }
        }
    }
    Ok(ready)
}

/// Relative wait bound for the nearest deadline, clamped to zero when the
/// deadline has already passed. `None` means wait indefinitely.
fn relative_timeout(next_due: Option<Instant>, now: Instant) -> Option<Duration> {
    next_due.map(|due| due.saturating_duration_since(now))
}

#[derive(Debug, Default)]
struct ExitState {
    requested: AtomicBool,
    status: AtomicI32,
}

/// Cheap, cloneable, thread- and signal-safe control surface of a reactor.
///
/// A control handle can outlive `run()`; an exit requested while the loop
/// is not running is honored before the first iteration of the next run.
#[derive(Debug, Clone)]
pub struct LoopControl {
    exit: Arc<ExitState>,
    wake: WakeNotifier,
}

impl LoopControl {
    /// Interrupts the current (or next) blocking wait without any other
    /// effect. Any number of interrupts before the next drain coalesce.
    pub fn interrupt(&self) {
        self.wake.post_wake();
    }

    /// Asks the loop to exit with `status` once the current iteration's
    /// remaining steps finish. Callable from loop callbacks, other
    /// threads, and signal handlers; latency is at most one full
    /// iteration.
    pub fn request_exit(&self, status: i32) {
        self.exit.status.store(status, Ordering::Relaxed);
        self.exit.requested.store(true, Ordering::Release);
        self.wake.post_wake();
    }

    fn take_exit(&self) -> Option<i32> {
        if self.exit.requested.swap(false, Ordering::Acquire) {
            Some(self.exit.status.load(Ordering::Relaxed))
        } else {
            None
        }
    }
}

/// Boxed per-iteration callback.
pub type LoopCallback = Box<dyn FnMut(&LoopHandle)>;

type SharedRegistry = Rc<RefCell<Registry<LoopCallback>>>;

/// Handle for the loop thread: registry access plus the control surface.
///
/// Cloneable but not `Send`; callbacks receive a reference to it and may
/// register or unregister entries, including themselves, mid-sweep.
#[derive(Clone)]
pub struct LoopHandle {
    callbacks: SharedRegistry,
    control: LoopControl,
}

impl LoopHandle {
    /// Registers `callback` to run once per iteration, after I/O, signal,
    /// child, and timer handling have settled. Entries run in registration
    /// order. A callback registered from within a sweep first runs in the
    /// next iteration.
    ///
    /// The returned [`Registration`] owns the entry: dropping it
    /// unregisters, [`Registration::forget`] hands the entry over to
    /// explicit disposal via [`LoopHandle::unregister`].
    pub fn register<F>(&self, callback: F) -> Registration
    where
        F: FnMut(&LoopHandle) + 'static,
    {
        let id = self.callbacks.borrow_mut().insert(Box::new(callback));
        Registration {
            id,
            callbacks: Rc::downgrade(&self.callbacks),
        }
    }

    /// Removes the entry addressed by `id`. Safe during a sweep, including
    /// against the entry currently running. Returns whether the entry was
    /// still present.
    pub fn unregister(&self, id: CallbackId) -> bool {
        self.callbacks.borrow_mut().remove(id)
    }

    /// The thread- and signal-safe control surface.
    pub fn control(&self) -> &LoopControl {
        &self.control
    }

    /// Shorthand for [`LoopControl::interrupt`].
    pub fn interrupt(&self) {
        self.control.interrupt();
    }

    /// Shorthand for [`LoopControl::request_exit`].
    pub fn request_exit(&self, status: i32) {
        self.control.request_exit(status);
    }
}

/// Owner of a registered callback; unregisters on drop.
#[derive(Debug)]
pub struct Registration {
    id: CallbackId,
    callbacks: Weak<RefCell<Registry<LoopCallback>>>,
}

impl Registration {
    /// The underlying handle, usable with [`LoopHandle::unregister`].
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Detaches the entry from this guard: it then stays registered until
    /// explicitly unregistered or the reactor is dropped.
    pub fn forget(mut self) -> CallbackId {
        self.callbacks = Weak::new();
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(callbacks) = self.callbacks.upgrade() {
            callbacks.borrow_mut().remove(self.id);
        }
    }
}

/// A single-threaded reactor instance.
///
/// Each instance carries its own wake channel, registry, and exit state,
/// so independent reactors (one per test, say) coexist in one process.
/// `run()` must not be entered concurrently on the same instance; running
/// it again after a prior return is fine.
pub struct Reactor {
    wake: WakeChannel,
    control: LoopControl,
    callbacks: SharedRegistry,
    timers: Option<Box<dyn TimerSource>>,
    io: Option<Box<dyn IoSource>>,
    signals: Option<Box<dyn SignalSource>>,
    children: Option<Box<dyn ChildSource>>,
    attached: bool,
}

impl Reactor {
    /// Creates a reactor with no collaborators attached.
    ///
    /// The wake channel is created here; failure aborts construction
    /// because a reactor without one cannot be woken out of a blocking
    /// wait by a signal.
    pub fn new() -> Result<Self, ReactorError> {
        let wake = WakeChannel::new().map_err(ReactorError::WakeChannel)?;
        let control = LoopControl {
            exit: Arc::new(ExitState::default()),
            wake: wake.notifier(),
        };
        Ok(Self {
            wake,
            control,
            callbacks: Rc::new(RefCell::new(Registry::new())),
            timers: None,
            io: None,
            signals: None,
            children: None,
            attached: false,
        })
    }

    /// Attaches the timer collaborator.
    pub fn set_timer_source(&mut self, timers: impl TimerSource + 'static) {
        self.timers = Some(Box::new(timers));
    }

    /// Attaches the I/O watch collaborator.
    pub fn set_io_source(&mut self, io: impl IoSource + 'static) {
        self.io = Some(Box::new(io));
    }

    /// Attaches the signal collaborator.
    pub fn set_signal_source(&mut self, signals: impl SignalSource + 'static) {
        self.signals = Some(Box::new(signals));
        // The fresh source has not seen attach() yet, even if an earlier
        // run() already attached a previous one.
        self.attached = false;
    }

    /// Attaches the child-reaping collaborator.
    pub fn set_child_source(&mut self, children: impl ChildSource + 'static) {
        self.children = Some(Box::new(children));
    }

    /// Returns the loop-thread handle for callback registration.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            callbacks: Rc::clone(&self.callbacks),
            control: self.control.clone(),
        }
    }

    /// Returns the thread- and signal-safe control surface.
    pub fn control(&self) -> LoopControl {
        self.control.clone()
    }

    /// Runs the loop until an exit is requested, returning the status.
    ///
    /// Blocks the calling thread. Each iteration: timer-bounded descriptor
    /// wait, I/O dispatch, wake drain, then signal, child, and timer polls,
    /// then every registered callback in registration order. The exit flag
    /// is consumed by the return, so a subsequent `run()` starts clean.
    pub fn run(&mut self) -> i32 {
        if !self.attached {
            if let Some(signals) = self.signals.as_mut() {
                signals.attach(&self.control);
            }
            self.attached = true;
        }

        debug!("entering main loop");
        loop {
            if let Some(status) = self.control.take_exit() {
                debug!(status, "exiting main loop");
                return status;
            }
            self.iterate();
        }
    }

    /// One full iteration of the loop.
    fn iterate(&mut self) {
        let next_due = self.timers.as_mut().and_then(|timers| timers.next_due());
        let timeout = relative_timeout(next_due, Instant::now());

        let mut watches = FdSets::default();
        if let Some(io) = self.io.as_mut() {
            io.collect_fds(&mut watches);
        }

        match wait(&watches, self.wake.read_fd(), timeout) {
            Ok(ready) => {
                if let Some(io) = self.io.as_mut()
                    && !ready.is_empty()
                {
                    io.dispatch(&ready);
                }
            }
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => {
                trace!("descriptor wait interrupted by signal");
            }
            Err(err) => {
                warn!("descriptor wait failed: {err}");
            }
        }

        // The drain must precede the signal poll: a signal that posted a
        // wake racing the drain is either observed by this poll or parks
        // another wake byte for the next iteration. Either way it is
        // never lost.
        self.wake.drain();

        // Each collaborator is polled exactly once per iteration; their
        // failures are their own concern and never terminate the loop.
        if let Some(signals) = self.signals.as_mut() {
            signals.poll();
        }
        if let Some(children) = self.children.as_mut() {
            children.poll();
        }
        if let Some(timers) = self.timers.as_mut() {
            timers.poll();
        }

        self.sweep();
    }

    /// Runs every callback registered at the start of the sweep, in
    /// registration order, skipping entries unregistered before their
    /// turn. Entries are checked out of the registry while they run so
    /// they can re-enter it freely.
    fn sweep(&mut self) {
        let handle = self.handle();
        let bound = self.callbacks.borrow().sweep_bound();
        for index in 0..bound {
            let taken = self.callbacks.borrow_mut().take_at(index);
            if let Some((id, mut callback)) = taken {
                callback(&handle);
                self.callbacks.borrow_mut().restore(id, callback);
            }
        }
        self.callbacks.borrow_mut().compact();
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("wake", &self.wake)
            .field("callbacks", &self.callbacks.borrow().len())
            .field("timers", &self.timers.is_some())
            .field("io", &self.io.is_some())
            .field("signals", &self.signals.is_some())
            .field("children", &self.children.is_some())
            .finish()
    }
}
