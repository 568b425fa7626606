//! Trailing-window operation counter

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Counts operations recorded during the last `window`.
#[derive(Debug)]
pub struct RateCounter {
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self) {
        self.record_at(Instant::now());
    }

    pub fn count(&self) -> usize {
        self.count_at(Instant::now())
    }

    fn record_at(&self, now: Instant) {
        let mut timestamps = self.lock();
        timestamps.push_back(now);
        Self::prune(&mut timestamps, self.window, now);
    }

    fn count_at(&self, now: Instant) -> usize {
        let mut timestamps = self.lock();
        Self::prune(&mut timestamps, self.window, now);
        timestamps.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Instant>> {
        // the deque stays consistent even if a holder panicked
        self.timestamps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn prune(timestamps: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        let Some(cutoff) = now.checked_sub(window) else {
            return;
        };
        while timestamps.front().is_some_and(|t| *t <= cutoff) {
            timestamps.pop_front();
        }
    }
}
