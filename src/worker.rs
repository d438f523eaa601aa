use crate::job_registry::{JobRegistry, RegisteredJob};
use crate::schema::STATE_DISCARDED;
use crate::storage;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use anyhow::anyhow;
use futures_util::FutureExt;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use serde_json::Value;
use sqlx::PgPool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, trace, warn};

/// Why a run did not succeed.
enum RunFailure {
    /// The job returned an error itself.
    Returned(anyhow::Error),
    /// The run was cut short by a panic or the timeout.
    Interrupted(anyhow::Error),
}

impl RunFailure {
    fn into_error(self) -> anyhow::Error {
        match self {
            Self::Returned(error) | Self::Interrupted(error) => error,
        }
    }
}

pub(crate) struct Worker<Context> {
    pub(crate) connection_pool: PgPool,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) job_timeout: Duration,
    pub(crate) shutdown: CancellationToken,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Sleeps for one poll interval. Returns false if shutdown was requested meanwhile.
    async fn idle(&self) -> bool {
        tokio::select! {
            () = self.shutdown.cancelled() => false,
            () = sleep(self.sleep_duration_with_jitter()) => true,
        }
    }

    /// Run background jobs until shutdown is requested, or until the queue is
    /// empty if `shutdown_when_queue_empty` is set.
    ///
    /// A job that is already running is allowed to finish.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self) {
        while !self.shutdown.is_cancelled() {
            match self.run_next_job().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No pending background worker jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    trace!("No pending background worker jobs found. Polling again…");
                    if !self.idle().await {
                        break;
                    }
                }
                Err(error) => {
                    error!("Failed to run job: {error}");
                    if !self.idle().await {
                        break;
                    }
                }
            }
        }
        debug!("Worker stopped");
    }

    /// Run the next job in the queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run
    /// - `Ok(None)` if no jobs were waiting
    /// - `Err(...)` if there was an error retrieving the job
    #[allow(clippy::cognitive_complexity)]
    async fn run_next_job(&self) -> anyhow::Result<Option<i64>> {
        let context = self.context.clone();
        let job_registry = self.job_registry.clone();
        let pool = &self.connection_pool;

        let job_types = job_registry.job_types();

        trace!("Looking for next background worker job…");

        // The transaction holds the row lock for as long as the job runs. If
        // this process dies, Postgres releases the lock and the job is picked
        // up again.
        let mut tx = pool.begin().await?;

        let job = match storage::find_next_unlocked_job_tx(&mut tx, &job_types).await {
            Ok(job) => job,
            Err(sqlx::Error::RowNotFound) => {
                tx.rollback().await?;
                return Ok(None);
            }
            Err(e) => {
                tx.rollback().await?;
                return Err(e.into());
            }
        };

        let span = info_span!(
            "job",
            job.id = %job.id,
            job.type = %job.job_type,
            job.queue = %job.queue,
            job.attempt = job.retries + 1,
        );

        let job_id = job.id;
        debug!(parent: &span, "Running job…");

        let registered = job_registry.get(&job.job_type).cloned();
        let timeout = registered
            .as_ref()
            .and_then(|registered| registered.timeout)
            .unwrap_or(self.job_timeout);

        let future = with_sentry_transaction(&job.job_type, async || {
            let registered = registered
                .as_ref()
                .ok_or_else(|| RunFailure::Returned(anyhow!("Unknown job type {}", job.job_type)))?;

            let run = AssertUnwindSafe((registered.run)(context.clone(), job.data.clone()))
                .catch_unwind();
            match tokio::time::timeout(timeout, run).await {
                Ok(Ok(result)) => result.map_err(RunFailure::Returned),
                Ok(Err(panic)) => Err(RunFailure::Interrupted(try_to_extract_panic_info(&*panic))),
                Err(_) => Err(RunFailure::Interrupted(anyhow!("job timed out after {timeout:?}"))),
            }
        });

        let result = future
            .instrument(span.clone())
            .bind_hub(Hub::current())
            .await;

        async {
            match result {
                Ok(()) => {
                    let deduplicated = registered.as_ref().is_some_and(|r| r.deduplicated);
                    debug!("Completing successful job…");
                    storage::complete_successful_job(&mut tx, job_id, deduplicated).await?;
                    tx.commit().await?;
                }
                Err(failure) => {
                    let interrupted = matches!(failure, RunFailure::Interrupted(_));
                    let message = format!("{:#}", failure.into_error());
                    if let (true, Some(registered)) = (interrupted, &registered) {
                        let data = job.data.clone();
                        report_interruption(registered, context.clone(), data, &message, timeout)
                            .await;
                    }

                    let state = storage::update_failed_job(&mut tx, job_id, &message).await?;
                    tx.commit().await?;
                    if state == STATE_DISCARDED {
                        error!(
                            attempts = job.retries + 1,
                            "Job failed for the last time and was discarded: {message}"
                        );
                    } else {
                        warn!("Failed to run job: {message}");
                    }
                }
            }
            Ok::<_, sqlx::Error>(())
        }
        .instrument(span)
        .await?;

        Ok(Some(job_id))
    }
}

/// Lets the job record a timeout or panic that its own `run` never handled.
async fn report_interruption<Context>(
    registered: &RegisteredJob<Context>,
    context: Context,
    data: Value,
    message: &str,
    timeout: Duration,
) {
    let hook = (registered.on_interrupted)(context, data, message.to_string());
    match tokio::time::timeout(timeout, AssertUnwindSafe(hook).catch_unwind()).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(error))) => warn!("Failed to record interrupted job: {error:#}"),
        Ok(Err(panic)) => warn!("{:#}", try_to_extract_panic_info(&*panic)),
        Err(_) => warn!("Recording the interrupted job timed out after {timeout:?}"),
    }
}
