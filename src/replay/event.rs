//! Auto-reset event used to wake the playback thread

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A flag that one waiter consumes
///
/// [`Event::set`] raises the flag and wakes a waiter; a successful wait
/// lowers it again.
#[derive(Default)]
pub(crate) struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self) {
        *self.signaled.lock() = true;
        self.cond.notify_all();
    }

    /// Wait up to `timeout` for the flag, returning whether it was raised
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            let _ = self.cond.wait_for(&mut signaled, timeout);
        }
        std::mem::replace(&mut *signaled, false)
    }
}
