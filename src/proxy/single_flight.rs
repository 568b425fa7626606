//! Non-blocking at-most-one execution guard for recurring jobs

use std::sync::atomic::{AtomicBool, Ordering};

/// A second caller is turned away rather than queued.
#[derive(Debug, Default)]
pub struct SingleFlight {
    running: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a guard if no other run is in flight. The flag is released
    /// when the guard drops, including on panic or early return.
    pub fn try_begin(&self) -> Option<FlightGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { flight: self })
    }
}

#[derive(Debug)]
pub struct FlightGuard<'a> {
    flight: &'a SingleFlight,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flight.running.store(false, Ordering::Release);
    }
}

/// Result of a scheduled `check_next` invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another invocation was in flight; nothing was done
    Busy,
    /// The job is switched off in the settings
    Disabled,
    /// Nothing was due
    Idle,
    /// Work was done on this many items
    Ran(usize),
}
