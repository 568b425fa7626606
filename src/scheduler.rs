//! Periodic job scheduling
//!
//! The library only needs "call this every N seconds"; [`TokioScheduler`] is
//! the in-process implementation used by the `serve` command.

use crate::proxy::{ProxyValidator, SourceIngestor, TickOutcome};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Interval of the proxy validation job
pub const PROXY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Interval of the source ingestion job
pub const SOURCE_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Callback invoked on every tick
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub trait Scheduler: Send + Sync {
    fn register_periodic_task(&self, name: &str, interval: Duration, callback: Job);
}

/// Runs every registered job on its own tokio interval. Each tick is spawned
/// separately so a slow run never delays the ticker.
#[derive(Default)]
pub struct TokioScheduler {
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the registered jobs
    pub fn task_names(&self) -> Vec<String> {
        self.lock_tasks().iter().map(|(name, _)| name.clone()).collect()
    }

    /// Stop all tickers. Runs already in flight are left to finish.
    pub fn shutdown(&self) {
        for (name, handle) in self.lock_tasks().drain(..) {
            tracing::debug!(task = %name, "stopping periodic task");
            handle.abort();
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<(String, JoinHandle<()>)>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Scheduler for TokioScheduler {
    fn register_periodic_task(&self, name: &str, interval: Duration, callback: Job) {
        tracing::info!(
            task = name,
            interval_ms = interval.as_millis() as u64,
            "registered periodic task"
        );
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                tokio::spawn(callback());
            }
        });
        self.lock_tasks().push((name.to_string(), handle));
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Register the proxy validation and source ingestion jobs.
pub fn register_jobs(
    scheduler: &dyn Scheduler,
    validator: Arc<ProxyValidator>,
    ingestor: Arc<SourceIngestor>,
) {
    scheduler.register_periodic_task(
        "proxy_check",
        PROXY_CHECK_INTERVAL,
        Arc::new(move || {
            let validator = Arc::clone(&validator);
            async move {
                match validator.check_next().await {
                    Ok(TickOutcome::Ran(count)) => tracing::debug!(count, "proxy_check tick"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "proxy_check failed"),
                }
            }
            .boxed()
        }),
    );

    scheduler.register_periodic_task(
        "source_check",
        SOURCE_CHECK_INTERVAL,
        Arc::new(move || {
            let ingestor = Arc::clone(&ingestor);
            async move {
                match ingestor.check_next().await {
                    Ok(TickOutcome::Ran(count)) => tracing::debug!(count, "source_check tick"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "source_check failed"),
                }
            }
            .boxed()
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, ProxyFilter, ProxySort};
    use crate::proxy::checker::tests::StubOracle;
    use crate::proxy::{IdentityOracle, Source};
    use crate::settings::Settings;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Keeps registrations so tests can fire jobs by hand.
    #[derive(Default)]
    struct RecordingScheduler {
        jobs: Mutex<Vec<(String, Duration, Job)>>,
    }

    impl Scheduler for RecordingScheduler {
        fn register_periodic_task(&self, name: &str, interval: Duration, callback: Job) {
            self.jobs
                .lock()
                .unwrap()
                .push((name.to_string(), interval, callback));
        }
    }

    impl RecordingScheduler {
        async fn fire(&self, name: &str) {
            let job = self
                .jobs
                .lock()
                .unwrap()
                .iter()
                .find(|(n, _, _)| n == name)
                .map(|(_, _, job)| Arc::clone(job))
                .unwrap();
            job().await;
        }
    }

    #[tokio::test]
    async fn test_register_jobs() {
        let db = Database::in_memory().await.unwrap();
        let oracle: Arc<dyn IdentityOracle> =
            StubOracle::answering("stub", "1.1.1.1", Duration::from_millis(1));
        let validator = Arc::new(ProxyValidator::new(
            db.clone(),
            Arc::new(Settings::default()),
            vec![oracle],
            None,
        ));
        let ingestor = Arc::new(SourceIngestor::new(db.clone()).unwrap());
        let scheduler = RecordingScheduler::default();

        register_jobs(&scheduler, validator, ingestor);

        let registered: Vec<(String, Duration)> = scheduler
            .jobs
            .lock()
            .unwrap()
            .iter()
            .map(|(name, interval, _)| (name.clone(), *interval))
            .collect();
        assert_eq!(
            registered,
            vec![
                ("proxy_check".to_string(), Duration::from_secs(1)),
                ("source_check".to_string(), Duration::from_secs(60)),
            ]
        );

        let source = Source::new("s1", None).with_items(vec!["http://1.1.1.1:80".to_string()]);
        db.insert_source(&source).await.unwrap();

        scheduler.fire("source_check").await;
        scheduler.fire("proxy_check").await;

        let proxies = db
            .find_proxies(&ProxyFilter::new(), ProxySort::Url, None)
            .await
            .unwrap();
        assert_eq!(proxies.len(), 1);
        assert!(proxies[0].checked_at.is_some());
    }

    #[tokio::test]
    async fn test_job_errors_do_not_escape() {
        let db = Database::in_memory().await.unwrap();
        let validator = Arc::new(ProxyValidator::new(
            db.clone(),
            Arc::new(Settings::default()),
            Vec::new(),
            None,
        ));
        let ingestor = Arc::new(SourceIngestor::new(db.clone()).unwrap());
        let scheduler = RecordingScheduler::default();
        register_jobs(&scheduler, validator, ingestor);

        db.close().await;
        scheduler.fire("proxy_check").await;
        scheduler.fire("source_check").await;
    }

    #[tokio::test]
    async fn test_tokio_scheduler_ticks_until_shutdown() {
        let scheduler = TokioScheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        scheduler.register_periodic_task(
            "count",
            Duration::from_millis(20),
            Arc::new(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            }),
        );
        assert_eq!(scheduler.task_names(), vec!["count"]);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 3);

        scheduler.shutdown();
        assert!(scheduler.task_names().is_empty());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn test_slow_job_does_not_block_ticker() {
        let scheduler = TokioScheduler::new();
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        scheduler.register_periodic_task(
            "slow",
            Duration::from_millis(20),
            Arc::new(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                .boxed()
            }),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(started.load(Ordering::SeqCst) >= 3);
    }
}
