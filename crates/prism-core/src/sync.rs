//! Completion fences for asynchronous backend work.

use std::fmt;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{PrismError, Result};

/// One-shot completion flag with a bounded wait.
///
/// Backends attach a fence to work they schedule (a surface decode, a device
/// copy) and mappers wait on it before exposing the memory to another
/// backend.
pub struct Fence {
    operation: &'static str,
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Fence {
    /// A pending fence; `operation` names the awaited work in timeout errors.
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn signaled(operation: &'static str) -> Self {
        let fence = Self::new(operation);
        fence.signal();
        fence
    }

    pub fn signal(&self) {
        *self.signaled.lock() = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Block until signaled or until `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let mut signaled = self.signaled.lock();
        let result = self
            .cond
            .wait_while_for(&mut signaled, |done| !*done, timeout);
        if result.timed_out() && !*signaled {
            return Err(PrismError::Timeout {
                operation: self.operation,
                timeout,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("operation", &self.operation)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}
