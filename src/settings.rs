//! Runtime-tunable settings read by the jobs on every invocation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Default number of proxies checked per validator tick
pub const DEFAULT_MAX_PROXIES_CHECK: usize = 30;

/// Default per-probe timeout in seconds
pub const DEFAULT_PROXY_CHECK_TIMEOUT_SECS: f64 = 5.1;

/// Upper bound for the per-probe timeout in seconds
pub const MAX_PROXY_CHECK_TIMEOUT_SECS: f64 = 600.0;

/// Default freshness window of the live pool in minutes
pub const DEFAULT_LIVE_LAST_OK_MINUTES: i64 = 15;

/// Snapshot of the dynamic settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Whether the validator runs scheduled batches at all
    pub checking_enabled: bool,
    /// Max proxies checked in one validator batch
    pub max_proxies_check: usize,
    /// Timeout for a single identity probe, in seconds
    pub proxy_check_timeout: f64,
    /// Live proxies must have been OK less than this many minutes ago
    pub live_last_ok_minutes: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            checking_enabled: true,
            max_proxies_check: DEFAULT_MAX_PROXIES_CHECK,
            proxy_check_timeout: DEFAULT_PROXY_CHECK_TIMEOUT_SECS,
            live_last_ok_minutes: DEFAULT_LIVE_LAST_OK_MINUTES,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checking_enabled(mut self, enabled: bool) -> Self {
        self.checking_enabled = enabled;
        self
    }

    pub fn with_max_proxies_check(mut self, max: usize) -> Self {
        self.max_proxies_check = max;
        self
    }

    pub fn with_proxy_check_timeout(mut self, secs: f64) -> Self {
        self.proxy_check_timeout = secs;
        self
    }

    pub fn with_live_last_ok_minutes(mut self, minutes: i64) -> Self {
        self.live_last_ok_minutes = minutes;
        self
    }

    /// Probe timeout as a `Duration`. Non-positive or non-finite values fall
    /// back to the default, large ones are capped.
    pub fn probe_timeout(&self) -> Duration {
        let secs = self.proxy_check_timeout;
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs.min(MAX_PROXY_CHECK_TIMEOUT_SECS))
        } else {
            Duration::from_secs_f64(DEFAULT_PROXY_CHECK_TIMEOUT_SECS)
        }
    }

    /// Oldest `last_ok_at` still counted as live at `now`. A window reaching
    /// past the representable range starts at the unix epoch.
    pub fn live_since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::try_minutes(self.live_last_ok_minutes.max(0))
            .and_then(|window| now.checked_sub_signed(window))
            .map(|since| since.max(DateTime::<Utc>::UNIX_EPOCH))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// Source of settings snapshots. Implementations are consulted on every job
/// invocation, so a change is picked up by the next tick.
pub trait SettingsProvider: Send + Sync {
    fn snapshot(&self) -> Settings;
}

impl SettingsProvider for Settings {
    fn snapshot(&self) -> Settings {
        self.clone()
    }
}

/// Settings shared with the host, which may replace them at runtime.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<Settings>>,
}

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn replace(&self, settings: Settings) {
        match self.inner.write() {
            Ok(mut guard) => *guard = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        match self.inner.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl SettingsProvider for SharedSettings {
    fn snapshot(&self) -> Settings {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
