//! Proxy validation: probe, record the outcome, evict dead proxies

use crate::database::{Database, ProxyCheckUpdate, ProxyFilter, ProxySort};
use crate::proxy::checker::{default_oracles, lookup_own_ip, race_probes, IdentityOracle};
use crate::proxy::models::{Proxy, ProxyCheckOutcome, ProxyKind, ProxyStatus};
use crate::proxy::rate_counter::RateCounter;
use crate::proxy::single_flight::{SingleFlight, TickOutcome};
use crate::settings::SettingsProvider;
use crate::Result;
use chrono::{Duration, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Proxies checked less than this many minutes ago are not due
pub const RECHECK_AFTER_MINUTES: i64 = 5;

/// Window of the checks-per-minute counter
const RATE_WINDOW_SECS: u64 = 60;

/// Verifies proxies against identity oracles.
pub struct ProxyValidator {
    db: Database,
    settings: Arc<dyn SettingsProvider>,
    oracles: Vec<Arc<dyn IdentityOracle>>,
    own_ip: Option<String>,
    counter: RateCounter,
    flight: SingleFlight,
}

impl ProxyValidator {
    /// Create a validator with explicit oracles. `own_ip` is this host's
    /// public IP; a proxy reporting it is not proxying at all.
    pub fn new(
        db: Database,
        settings: Arc<dyn SettingsProvider>,
        oracles: Vec<Arc<dyn IdentityOracle>>,
        own_ip: Option<String>,
    ) -> Self {
        Self {
            db,
            settings,
            oracles,
            own_ip,
            counter: RateCounter::new(std::time::Duration::from_secs(RATE_WINDOW_SECS)),
            flight: SingleFlight::new(),
        }
    }

    /// Create a validator using httpbin and ipify, looking up the own IP
    /// once.
    pub async fn with_default_oracles(db: Database, settings: Arc<dyn SettingsProvider>) -> Self {
        let oracles = default_oracles();
        let own_ip = lookup_own_ip(&oracles).await;
        if own_ip.is_none() {
            tracing::warn!("own public ip unknown, self-proxy detection disabled");
        }
        Self::new(db, settings, oracles, own_ip)
    }

    pub fn own_ip(&self) -> Option<&str> {
        self.own_ip.as_deref()
    }

    /// Checks recorded during the last minute
    pub fn checks_per_minute(&self) -> usize {
        self.counter.count()
    }

    /// Check one proxy and persist the result. A dead proxy is a normal
    /// outcome; only a missing record or a store failure is an error.
    pub async fn check(&self, id: &str) -> Result<ProxyCheckOutcome> {
        let proxy = self.db.get_proxy(id).await?;
        let settings = self.settings.snapshot();
        tracing::debug!(id = %proxy.id, url = %proxy.url, "check proxy");

        let detected = race_probes(&self.oracles, &proxy.url, settings.probe_timeout()).await;
        self.counter.record();

        let ok = self.is_valid_egress(&proxy, detected.as_deref());
        let now = Utc::now();
        let mut history = proxy.check_history.clone();
        history.record(ok);

        let update = ProxyCheckUpdate {
            status: if ok { ProxyStatus::Ok } else { ProxyStatus::Down },
            checked_at: now,
            last_ok_at: ok.then_some(now),
            proxy_ip: if ok { detected } else { None },
            check_history: history,
        };
        let updated = self.db.update_proxy_check(id, &update).await?;

        let deleted = updated.is_time_to_delete(Utc::now());
        if deleted {
            self.db.delete_proxy(id).await?;
            tracing::info!(id = %updated.id, url = %updated.url, "evicted proxy");
        }

        Ok(ProxyCheckOutcome {
            id: updated.id,
            status: updated.status,
            checked_at: now,
            last_ok_at: updated.last_ok_at,
            proxy_ip: updated.proxy_ip,
            deleted,
        })
    }

    fn is_valid_egress(&self, proxy: &Proxy, detected: Option<&str>) -> bool {
        let Some(ip) = detected else {
            return false;
        };
        if self.own_ip.as_deref() == Some(ip) {
            tracing::debug!(id = %proxy.id, ip, "proxy exposes our own ip");
            return false;
        }
        match proxy.kind {
            ProxyKind::Direct => proxy.hostname().as_deref() == Some(ip),
            ProxyKind::Gateway => true,
        }
    }

    /// Check the next batch of due proxies. Returns immediately if a batch
    /// is already running on this validator.
    pub async fn check_next(&self) -> Result<TickOutcome> {
        let Some(_guard) = self.flight.try_begin() else {
            return Ok(TickOutcome::Busy);
        };

        let settings = self.settings.snapshot();
        if !settings.checking_enabled {
            return Ok(TickOutcome::Disabled);
        }

        let batch = self.select_batch(settings.max_proxies_check).await?;
        if batch.is_empty() {
            return Ok(TickOutcome::Idle);
        }

        let total = batch.len();
        let ids: Vec<String> = batch.into_iter().map(|p| p.id).collect();
        let results: Vec<_> = stream::iter(ids)
            .map(|id| async move {
                let result = AssertUnwindSafe(self.check(&id)).catch_unwind().await;
                (id, result)
            })
            .buffer_unordered(total)
            .collect()
            .await;

        let mut ok = 0;
        for (id, result) in results {
            match result {
                Ok(Ok(outcome)) if outcome.is_ok() => ok += 1,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(id = %id, error = %e, "proxy check failed"),
                Err(_) => tracing::error!(id = %id, "proxy check panicked"),
            }
        }
        tracing::info!(
            total,
            ok,
            per_minute = self.counter.count(),
            "checked proxy batch"
        );

        Ok(TickOutcome::Ran(total))
    }

    /// Never checked proxies first, topped up with the longest unchecked.
    async fn select_batch(&self, limit: usize) -> Result<Vec<Proxy>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut batch = self
            .db
            .find_proxies(&ProxyFilter::new().never_checked(), ProxySort::Unordered, Some(limit))
            .await?;

        if batch.len() < limit {
            let cutoff = Utc::now() - Duration::minutes(RECHECK_AFTER_MINUTES);
            let stale = self
                .db
                .find_proxies(
                    &ProxyFilter::new().checked_before(cutoff),
                    ProxySort::CheckedAt,
                    Some(limit - batch.len()),
                )
                .await?;
            batch.extend(stale);
        }
        Ok(batch)
    }

    /// Forget every check result so the whole pool is verified again.
    pub async fn reset_all_statuses(&self) -> Result<u64> {
        let count = self.db.reset_proxy_statuses().await?;
        tracing::info!(count, "reset proxy statuses");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::checker::tests::StubOracle;
    use crate::proxy::models::{CheckHistory, CHECK_HISTORY_CAPACITY};
    use crate::settings::{Settings, SharedSettings};
    use std::sync::atomic::Ordering;
    use std::time::{Duration as StdDuration, Instant};

    const OWN_IP: &str = "203.0.113.1";

    fn stubs(ip: &str, delay: StdDuration) -> Vec<Arc<dyn IdentityOracle>> {
        vec![
            StubOracle::answering("a", ip, delay),
            StubOracle::answering("b", ip, delay),
        ]
    }

    fn failing() -> Vec<Arc<dyn IdentityOracle>> {
        vec![
            StubOracle::failing("a", StdDuration::from_millis(1)),
            StubOracle::failing("b", StdDuration::from_millis(1)),
        ]
    }

    async fn validator_with(
        oracles: Vec<Arc<dyn IdentityOracle>>,
        settings: Settings,
    ) -> (ProxyValidator, Database) {
        let db = Database::in_memory().await.unwrap();
        let validator =
            ProxyValidator::new(db.clone(), Arc::new(settings), oracles, Some(OWN_IP.to_string()));
        (validator, db)
    }

    async fn insert(db: &Database, url: &str, kind: ProxyKind) -> Proxy {
        let proxy = Proxy::new("s1", url, kind).unwrap();
        db.insert_proxies(std::slice::from_ref(&proxy)).await.unwrap();
        proxy
    }

    #[tokio::test]
    async fn test_direct_proxy_becomes_ok() {
        let (validator, db) =
            validator_with(stubs("10.0.0.1", StdDuration::from_millis(5)), Settings::default()).await;
        let proxy = insert(&db, "socks5://u:p@10.0.0.1:1080", ProxyKind::Direct).await;

        let outcome = validator.check(&proxy.id).await.unwrap();
        assert_eq!(outcome.status, ProxyStatus::Ok);
        assert_eq!(outcome.proxy_ip.as_deref(), Some("10.0.0.1"));
        assert!(outcome.last_ok_at.is_some());
        assert!(!outcome.deleted);

        let stored = db.get_proxy(&proxy.id).await.unwrap();
        assert_eq!(stored.status, ProxyStatus::Ok);
        assert_eq!(stored.proxy_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(stored.check_history.iter().collect::<Vec<_>>(), vec![true]);
        assert_eq!(validator.checks_per_minute(), 1);
    }

    #[tokio::test]
    async fn test_direct_proxy_with_other_ip_is_down() {
        let (validator, db) =
            validator_with(stubs("10.9.9.9", StdDuration::from_millis(5)), Settings::default()).await;
        let proxy = insert(&db, "http://u:p@10.0.0.1:8080", ProxyKind::Direct).await;

        let outcome = validator.check(&proxy.id).await.unwrap();
        assert_eq!(outcome.status, ProxyStatus::Down);
        assert!(outcome.proxy_ip.is_none());
        assert!(outcome.last_ok_at.is_none());
    }

    #[tokio::test]
    async fn test_gateway_proxy_accepts_any_foreign_ip() {
        let (validator, db) =
            validator_with(stubs("198.51.100.7", StdDuration::from_millis(5)), Settings::default())
                .await;
        let proxy = insert(&db, "http://u:p@gw.example.com:10001", ProxyKind::Gateway).await;

        let outcome = validator.check(&proxy.id).await.unwrap();
        assert_eq!(outcome.status, ProxyStatus::Ok);
        assert_eq!(outcome.proxy_ip.as_deref(), Some("198.51.100.7"));
    }

    #[tokio::test]
    async fn test_own_ip_is_rejected() {
        let (validator, db) =
            validator_with(stubs(OWN_IP, StdDuration::from_millis(5)), Settings::default()).await;
        let proxy = insert(&db, "http://gw.example.com:10001", ProxyKind::Gateway).await;

        let outcome = validator.check(&proxy.id).await.unwrap();
        assert_eq!(outcome.status, ProxyStatus::Down);
    }

    #[tokio::test]
    async fn test_failed_probes_mark_down() {
        let (validator, db) = validator_with(failing(), Settings::default()).await;
        let proxy = insert(&db, "http://1.2.3.4:80", ProxyKind::Direct).await;

        let outcome = validator.check(&proxy.id).await.unwrap();
        assert_eq!(outcome.status, ProxyStatus::Down);
        assert!(!outcome.deleted);
        let stored = db.get_proxy(&proxy.id).await.unwrap();
        assert_eq!(stored.check_history.latest(), Some(false));
        assert!(stored.checked_at.is_some());
    }

    #[tokio::test]
    async fn test_check_missing_proxy() {
        let (validator, _db) = validator_with(failing(), Settings::default()).await;
        assert!(validator.check("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_old_never_ok_proxy_is_evicted() {
        let (validator, db) = validator_with(failing(), Settings::default()).await;
        let mut proxy = Proxy::new("s1", "http://1.2.3.4:80", ProxyKind::Direct).unwrap();
        proxy.created_at = Utc::now() - Duration::hours(2);
        db.insert_proxies(std::slice::from_ref(&proxy)).await.unwrap();

        let outcome = validator.check(&proxy.id).await.unwrap();
        assert!(outcome.deleted);
        assert!(db.get_proxy(&proxy.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_old_proxy_that_works_is_kept() {
        let (validator, db) =
            validator_with(stubs("1.2.3.4", StdDuration::from_millis(1)), Settings::default()).await;
        let mut proxy = Proxy::new("s1", "http://1.2.3.4:80", ProxyKind::Direct).unwrap();
        proxy.created_at = Utc::now() - Duration::hours(5);
        db.insert_proxies(std::slice::from_ref(&proxy)).await.unwrap();

        let outcome = validator.check(&proxy.id).await.unwrap();
        assert!(outcome.is_ok());
        assert!(!outcome.deleted);
    }

    #[tokio::test]
    async fn test_history_stays_bounded() {
        let (validator, db) = validator_with(failing(), Settings::default()).await;
        let mut proxy = Proxy::new("s1", "http://1.2.3.4:80", ProxyKind::Direct).unwrap();
        proxy.check_history = CheckHistory::from(vec![true; CHECK_HISTORY_CAPACITY]);
        db.insert_proxies(std::slice::from_ref(&proxy)).await.unwrap();

        for _ in 0..3 {
            validator.check(&proxy.id).await.unwrap();
        }
        let stored = db.get_proxy(&proxy.id).await.unwrap();
        assert_eq!(stored.check_history.len(), CHECK_HISTORY_CAPACITY);
        assert_eq!(stored.history_down_count(), 3);
    }

    #[tokio::test]
    async fn test_check_resolves_with_fastest_probe() {
        let fast = StubOracle::answering("fast", "10.0.0.1", StdDuration::from_millis(10));
        let slow = StubOracle::answering("slow", "10.0.0.1", StdDuration::from_millis(5000));
        let (validator, db) = validator_with(vec![fast, slow], Settings::default()).await;
        let proxy = insert(&db, "http://10.0.0.1:3128", ProxyKind::Direct).await;

        let start = Instant::now();
        let outcome = validator.check(&proxy.id).await.unwrap();
        assert!(outcome.is_ok());
        assert!(start.elapsed() < StdDuration::from_secs(2));
    }

    #[tokio::test]
    async fn test_check_next_batch_selection() {
        let (validator, db) = validator_with(
            stubs("9.9.9.9", StdDuration::from_millis(1)),
            Settings::new().with_max_proxies_check(3),
        )
        .await;
        let now = Utc::now();

        let mut fresh = Proxy::new("s1", "http://1.1.1.1:80", ProxyKind::Direct).unwrap();
        fresh.checked_at = Some(now - Duration::minutes(1));
        let mut stale = Proxy::new("s1", "http://2.2.2.2:80", ProxyKind::Direct).unwrap();
        stale.checked_at = Some(now - Duration::minutes(30));
        let mut staler = Proxy::new("s1", "http://3.3.3.3:80", ProxyKind::Direct).unwrap();
        staler.checked_at = Some(now - Duration::minutes(50));
        let never = Proxy::new("s1", "http://4.4.4.4:80", ProxyKind::Direct).unwrap();
        db.insert_proxies(&[fresh.clone(), stale, staler, never]).await.unwrap();

        let batch = validator.select_batch(3).await.unwrap();
        let urls: Vec<_> = batch.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["http://4.4.4.4:80", "http://3.3.3.3:80", "http://2.2.2.2:80"]
        );

        assert_eq!(validator.check_next().await.unwrap(), TickOutcome::Ran(3));
        let untouched = db.get_proxy(&fresh.id).await.unwrap();
        assert_eq!(
            untouched.checked_at.map(|t| t.timestamp_millis()),
            fresh.checked_at.map(|t| t.timestamp_millis())
        );
        // everything else was checked just now
        assert_eq!(validator.check_next().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_check_next_is_single_flight() {
        let slow_a = StubOracle::answering("a", "1.1.1.1", StdDuration::from_millis(200));
        let slow_b = StubOracle::answering("b", "1.1.1.1", StdDuration::from_millis(200));
        let (validator, db) =
            validator_with(vec![slow_a.clone(), slow_b], Settings::default()).await;
        insert(&db, "http://1.1.1.1:80", ProxyKind::Direct).await;

        let (first, second) = tokio::join!(validator.check_next(), validator.check_next());
        let mut outcomes = vec![first.unwrap(), second.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, TickOutcome::Busy));
        assert_eq!(outcomes, vec![TickOutcome::Ran(1), TickOutcome::Busy]);
        assert_eq!(slow_a.calls.load(Ordering::SeqCst), 1);

        // the guard is released afterwards
        db.reset_proxy_statuses().await.unwrap();
        assert_eq!(validator.check_next().await.unwrap(), TickOutcome::Ran(1));
    }

    #[tokio::test]
    async fn test_huge_probe_timeout_still_checks() {
        let settings = Settings::new()
            .with_proxy_check_timeout(1e20)
            .with_max_proxies_check(5);
        let (validator, db) =
            validator_with(stubs("10.0.0.1", StdDuration::from_millis(1)), settings).await;
        let proxy = insert(&db, "http://10.0.0.1:80", ProxyKind::Direct).await;

        assert_eq!(validator.check_next().await.unwrap(), TickOutcome::Ran(1));
        assert_eq!(db.get_proxy(&proxy.id).await.unwrap().status, ProxyStatus::Ok);
    }

    #[tokio::test]
    async fn test_check_next_disabled() {
        let settings = SharedSettings::new(Settings::new().with_checking_enabled(false));
        let db = Database::in_memory().await.unwrap();
        let validator = ProxyValidator::new(
            db.clone(),
            Arc::new(settings.clone()),
            failing(),
            None,
        );
        insert(&db, "http://1.1.1.1:80", ProxyKind::Direct).await;

        assert_eq!(validator.check_next().await.unwrap(), TickOutcome::Disabled);

        settings.update(|s| s.checking_enabled = true);
        assert_eq!(validator.check_next().await.unwrap(), TickOutcome::Ran(1));
    }

    #[tokio::test]
    async fn test_failing_check_does_not_affect_siblings() {
        let (validator, db) =
            validator_with(stubs("2.2.2.2", StdDuration::from_millis(20)), Settings::default()).await;
        let doomed = insert(&db, "http://1.1.1.1:80", ProxyKind::Direct).await;
        let healthy = insert(&db, "http://2.2.2.2:80", ProxyKind::Direct).await;

        // the first record vanishes mid-batch, its update fails with NotFound
        let deleter = {
            let db = db.clone();
            let id = doomed.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(StdDuration::from_millis(5)).await;
                db.delete_proxy(&id).await.unwrap();
            })
        };
        assert_eq!(validator.check_next().await.unwrap(), TickOutcome::Ran(2));
        deleter.await.unwrap();

        let stored = db.get_proxy(&healthy.id).await.unwrap();
        assert_eq!(stored.status, ProxyStatus::Ok);
    }

    #[tokio::test]
    async fn test_reset_all_statuses() {
        let (validator, db) =
            validator_with(stubs("1.1.1.1", StdDuration::from_millis(1)), Settings::default()).await;
        let proxy = insert(&db, "http://1.1.1.1:80", ProxyKind::Direct).await;
        validator.check(&proxy.id).await.unwrap();

        assert_eq!(validator.reset_all_statuses().await.unwrap(), 1);
        let stored = db.get_proxy(&proxy.id).await.unwrap();
        assert_eq!(stored.status, ProxyStatus::Unknown);
        assert!(stored.checked_at.is_none());
    }
}
