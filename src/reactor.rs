//! Single-threaded readiness reactor.
//!
//! The reactor owns a level-triggered readiness facility (epoll on Linux,
//! through the `polling` crate) and a table of callbacks. Transports
//! [`register`](Reactor::register) a callback once, then
//! [`add`](Reactor::add) any number of fds against it — the delivered
//! [`ReactorEvent`] carries the fd, so one callback can serve a whole set of
//! connections.
//!
//! [`wait`](Reactor::wait) runs the loop until [`shutdown`](Reactor::shutdown)
//! is called (from any thread): the facility's built-in notifier wakes the
//! loop so the termination flag is observed on the next iteration.
//!
//! # Semantics
//!
//! - Callbacks run to completion synchronously on the reactor thread, in the
//!   order the facility reported their fds ready.
//! - [`del`](Reactor::del) during dispatch is safe: still-pending events for
//!   a removed fd are filtered out before invocation.
//! - The facility delivers oneshot notifications; the loop re-arms each fd
//!   after its callback returns. Over epoll that behaves level-triggered — a
//!   still-readable fd fires again on the next cycle.
//! - Error and hang-up conditions are folded into readability by the
//!   facility; they surface to callbacks as a readable event whose
//!   subsequent read fails or returns zero.

use parking_lot::Mutex;
use polling::{Event as PollEvent, Poller};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Dense identifier of a registered callback.
pub type HandleId = usize;

/// Readiness interest and event flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// No readiness.
    pub const NONE: Self = Self(0);
    /// The fd has data to read (also reported for error/hang-up conditions).
    pub const READABLE: Self = Self(0b001);
    /// The fd is in an error state.
    pub const ERROR: Self = Self(0b010);
    /// The peer hung up.
    pub const HUP: Self = Self(0b100);

    /// Union of two flag sets.
    #[must_use]
    pub const fn add(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns true if all flags in `other` are present.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if the readable flag is present.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }
}

impl std::ops::BitOr for Interest {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

/// A readiness notification delivered to a callback.
#[derive(Debug, Clone, Copy)]
pub struct ReactorEvent {
    /// The fd that became ready.
    pub fd: RawFd,
    /// The readiness flags that triggered.
    pub ready: Interest,
}

impl ReactorEvent {
    /// Returns true if the event signals readability.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.ready.is_readable()
    }
}

type Callback = Box<dyn FnMut(ReactorEvent) + Send>;

#[derive(Clone, Copy)]
struct FdEntry {
    handle: HandleId,
    #[allow(dead_code)] // kept for diagnostics; the backend arms read-only
    interest: Interest,
}

/// Single-threaded cooperative event loop over level-triggered readiness.
pub struct Reactor {
    poller: Poller,
    handlers: Mutex<HashMap<HandleId, Arc<Mutex<Callback>>>>,
    fds: Mutex<HashMap<RawFd, FdEntry>>,
    next_handle: AtomicUsize,
    stopped: AtomicBool,
}

impl Reactor {
    /// Creates a reactor with a fresh readiness facility.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            handlers: Mutex::new(HashMap::new()),
            fds: Mutex::new(HashMap::new()),
            next_handle: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    /// Stores a callback and returns its identifier.
    ///
    /// The callback stays alive until [`unregister`](Self::unregister), so
    /// any number of fds may be wired to it over time.
    pub fn register(&self, callback: impl FnMut(ReactorEvent) + Send + 'static) -> HandleId {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .insert(handle, Arc::new(Mutex::new(Box::new(callback))));
        handle
    }

    /// Drops a callback. Fds still wired to it stop being dispatched.
    pub fn unregister(&self, handle: HandleId) {
        self.handlers.lock().remove(&handle);
    }

    /// Associates `fd` with a registered callback and arms it in the
    /// readiness facility.
    pub fn add(&self, interest: Interest, fd: RawFd, handle: HandleId) -> io::Result<()> {
        let key = usize::try_from(fd)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "negative fd"))?;
        let mut fds = self.fds.lock();
        if fds.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "fd already registered",
            ));
        }
        self.poller.add(fd, PollEvent::readable(key))?;
        fds.insert(fd, FdEntry { handle, interest });
        trace!(fd, handle, "reactor add");
        Ok(())
    }

    /// Removes `fd` from the reactor. Safe to call during dispatch; any
    /// still-pending event for the fd in the current batch is discarded.
    pub fn del(&self, fd: RawFd) {
        if self.fds.lock().remove(&fd).is_some() {
            if let Err(e) = self.poller.delete(fd) {
                trace!(fd, error = %e, "poller delete failed");
            }
            trace!(fd, "reactor del");
        }
    }

    /// Returns true while `fd` is registered.
    #[must_use]
    pub fn has(&self, fd: RawFd) -> bool {
        self.fds.lock().contains_key(&fd)
    }

    /// Number of registered fds.
    #[must_use]
    pub fn fd_count(&self) -> usize {
        self.fds.lock().len()
    }

    /// Runs the loop until [`shutdown`](Self::shutdown).
    ///
    /// Facility-level failures propagate out and are fatal to the embedder;
    /// per-fd failures only drop that fd's registration.
    pub fn wait(&self) -> io::Result<()> {
        let mut events: Vec<PollEvent> = Vec::new();
        while !self.stopped.load(Ordering::Acquire) {
            events.clear();
            match self.poller.wait(&mut events, None) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            for ev in &events {
                let Ok(fd) = RawFd::try_from(ev.key) else {
                    continue;
                };
                let entry = {
                    let fds = self.fds.lock();
                    match fds.get(&fd) {
                        Some(entry) => *entry,
                        None => continue,
                    }
                };
                let callback = {
                    let handlers = self.handlers.lock();
                    match handlers.get(&entry.handle) {
                        Some(cb) => Arc::clone(cb),
                        None => continue,
                    }
                };
                let ready = if ev.readable {
                    Interest::READABLE
                } else {
                    Interest::ERROR
                };
                (*callback.lock())(ReactorEvent { fd, ready });

                // Oneshot facility: re-arm while the fd stays registered.
                if self.fds.lock().contains_key(&fd) {
                    if let Err(e) = self.poller.modify(fd, PollEvent::readable(ev.key)) {
                        trace!(fd, error = %e, "re-arm failed, dropping registration");
                        self.fds.lock().remove(&fd);
                    }
                }
            }
        }
        Ok(())
    }

    /// Signals the loop to return from [`wait`](Self::wait). Callable from
    /// any thread; idempotent.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Err(e) = self.poller.notify() {
            trace!(error = %e, "reactor wake failed");
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("fds", &self.fds.lock().len())
            .field("handlers", &self.handlers.lock().len())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
