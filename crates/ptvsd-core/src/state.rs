//! Process-wide attach state.
//!
//! Whether a debugger may attach is decided per process, not per
//! connection, so there is exactly one `AttachState` per attach server.
//! The detached flag is read lock-free; every write goes through the
//! event mutex so the flag and the event never disagree.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

#[derive(Debug, Default)]
struct AttachedEvent {
    set: bool,
    since: Option<DateTime<Utc>>,
}

/// The detached flag plus the event that unblocks `wait_for_attach`.
///
/// Starts detached.
#[derive(Debug)]
pub struct AttachState {
    detached: AtomicBool,
    event: Mutex<AttachedEvent>,
    changed: Condvar,
}

impl AttachState {
    pub fn new() -> Self {
        Self {
            detached: AtomicBool::new(true),
            event: Mutex::new(AttachedEvent::default()),
            changed: Condvar::new(),
        }
    }

    /// Returns true while a debug session owns the process.
    pub fn is_attached(&self) -> bool {
        !self.detached.load(Ordering::Acquire)
    }

    /// Flips detached to attached and sets the event.
    ///
    /// Returns false, changing nothing, if already attached.
    pub fn try_attach(&self) -> bool {
        self.try_claim() && self.confirm_attach()
    }

    /// Flips detached to attached without setting the event.
    ///
    /// From here on `is_attached` is true and other claims fail, but
    /// `wait` keeps blocking until [`confirm_attach`](Self::confirm_attach).
    /// Returns false if already attached.
    pub fn try_claim(&self) -> bool {
        let _event = self.lock();
        if !self.detached.load(Ordering::Acquire) {
            return false;
        }
        self.detached.store(false, Ordering::Release);
        true
    }

    /// Sets the event for a claimed attach and wakes every waiter.
    ///
    /// Returns false if nothing is claimed.
    pub fn confirm_attach(&self) -> bool {
        let mut event = self.lock();
        if self.detached.load(Ordering::Acquire) {
            return false;
        }
        if event.set {
            return true;
        }

        event.set = true;
        event.since = Some(Utc::now());
        self.changed.notify_all();

        info!(detached = false, "Debugger attached");
        true
    }

    /// Flips back to detached and clears the event.
    ///
    /// Returns false if the process was not attached.
    pub fn detach(&self) -> bool {
        let mut event = self.lock();
        if self.detached.load(Ordering::Acquire) {
            return false;
        }

        self.detached.store(true, Ordering::Release);
        event.set = false;
        event.since = None;
        self.changed.notify_all();

        info!(detached = true, "Debugger detached");
        true
    }

    /// Blocks until attached or until `timeout` elapses.
    ///
    /// `None` waits forever. Returns whether the process is attached.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let event = self.lock();
        if event.set {
            return true;
        }

        match timeout {
            None => {
                let event = self
                    .changed
                    .wait_while(event, |e| !e.set)
                    .unwrap_or_else(PoisonError::into_inner);
                event.set
            }
            Some(timeout) => {
                let (event, _) = self
                    .changed
                    .wait_timeout_while(event, timeout, |e| !e.set)
                    .unwrap_or_else(PoisonError::into_inner);
                event.set
            }
        }
    }

    /// When the current attach happened, if attached.
    pub fn attached_since(&self) -> Option<DateTime<Utc>> {
        self.lock().since
    }

    fn lock(&self) -> MutexGuard<'_, AttachedEvent> {
        self.event.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for AttachState {
    fn default() -> Self {
        Self::new()
    }
}
