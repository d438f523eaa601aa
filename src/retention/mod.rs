//! Periodic sweepers: metrics retention and expired export cleanup.
//!
//! Each sweeper is a long-running future meant for `tokio::spawn`. It stops at
//! the next tick boundary once its [`CancellationToken`] is cancelled, and a
//! failed sweep is logged without ending the loop.

mod export_cleanup;
mod metrics;

pub use self::export_cleanup::{CleanupReport, EXPIRY_GRACE_HOURS, ExportCleanup};
pub use self::metrics::{MetricsRetention, RETAINED_TABLES};

use crate::config::Config;
use crate::file_storage::FileStorage;
use sqlx::PgPool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span};

/// When a sweeper first runs and how often after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Wait before the first sweep.
    pub initial_delay: Duration,
    /// Time between sweeps.
    pub interval: Duration,
}

/// Calls `sweep` on `schedule` until `shutdown` is cancelled.
pub async fn run_periodically<F, Fut>(
    name: &'static str,
    schedule: Schedule,
    shutdown: CancellationToken,
    mut sweep: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    info!(
        sweeper = name,
        initial_delay = ?schedule.initial_delay,
        interval = ?schedule.interval,
        "Sweeper started"
    );

    if !schedule.initial_delay.is_zero() {
        tokio::select! {
            () = shutdown.cancelled() => {
                debug!(sweeper = name, "Sweeper cancelled before first run");
                return;
            }
            () = sleep(schedule.initial_delay) => {}
        }
    }

    let mut ticker = tokio::time::interval(schedule.interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(error) = sweep().await {
            error!(sweeper = name, "Sweep failed: {error:#}");
        }
    }

    info!(sweeper = name, "Sweeper stopped");
}

/// Spawns the metrics retention sweeper (unless disabled) and the export
/// cleanup sweeper.
pub fn spawn_sweepers(
    config: &Config,
    pool: PgPool,
    storage: Arc<dyn FileStorage>,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(2);

    if config.retention.enabled {
        let retention = Arc::new(MetricsRetention::new(
            pool.clone(),
            config.retention.retention_days,
        ));
        let token = shutdown.child_token();
        let span = info_span!("sweeper", sweeper.name = MetricsRetention::NAME);
        handles.push(tokio::spawn(
            async move {
                run_periodically(MetricsRetention::NAME, MetricsRetention::SCHEDULE, token, || {
                    let retention = retention.clone();
                    async move { retention.sweep().await.map(drop) }
                })
                .await;
            }
            .instrument(span),
        ));
    } else {
        info!("Metrics retention is disabled");
    }

    let cleanup = Arc::new(ExportCleanup::new(pool, storage));
    let schedule = ExportCleanup::schedule(config.exports.cleanup_interval);
    let token = shutdown.child_token();
    let span = info_span!("sweeper", sweeper.name = ExportCleanup::NAME);
    handles.push(tokio::spawn(
        async move {
            run_periodically(ExportCleanup::NAME, schedule, token, || {
                let cleanup = cleanup.clone();
                async move { cleanup.sweep().await.map(drop) }
            })
            .await;
        }
        .instrument(span),
    ));

    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn counting(
        runs: Arc<AtomicUsize>,
        fail: bool,
    ) -> impl FnMut() -> std::future::Ready<anyhow::Result<()>> {
        move || {
            runs.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if fail { Err(anyhow!("database is down")) } else { Ok(()) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_immediately_then_on_interval() {
        let runs = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let schedule = Schedule {
            initial_delay: Duration::ZERO,
            interval: Duration::from_secs(24 * 60 * 60),
        };
        let handle = tokio::spawn(run_periodically(
            "test",
            schedule,
            shutdown.clone(),
            counting(runs.clone(), false),
        ));

        sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(24 * 60 * 60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        assert!(handle.await.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_initial_delay() {
        let runs = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let schedule = Schedule {
            initial_delay: Duration::from_secs(30),
            interval: Duration::from_secs(60 * 60),
        };
        let handle = tokio::spawn(run_periodically(
            "test",
            schedule,
            shutdown.clone(),
            counting(runs.clone(), false),
        ));

        sleep(Duration::from_secs(29)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        assert!(handle.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sweeps_do_not_stop_the_loop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let schedule = Schedule {
            initial_delay: Duration::ZERO,
            interval: Duration::from_secs(60),
        };
        let handle = tokio::spawn(run_periodically(
            "test",
            schedule,
            shutdown.clone(),
            counting(runs.clone(), true),
        ));

        sleep(Duration::from_secs(60 * 3 + 1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 4);

        shutdown.cancel();
        assert!(handle.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_initial_delay_returns_promptly() {
        let runs = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let started = Instant::now();
        run_periodically(
            "test",
            Schedule {
                initial_delay: Duration::from_secs(30),
                interval: Duration::from_secs(60),
            },
            shutdown,
            counting(runs.clone(), false),
        )
        .await;

        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
