use crate::errors::EnqueueError;
use crate::storage;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::PgPool;
use std::future::Future;
use std::time::Duration;
use tracing::instrument;

/// The default queue name used when no specific queue is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// Max attempts for job types that neither declare their own nor get one
/// from the [`JobClient`](crate::JobClient) configuration.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Hours a succeeded deduplicated job keeps suppressing identical inserts.
pub const DEDUPLICATION_WINDOW_HOURS: i32 = 24;

/// Options a job type is inserted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOpts {
    /// Queue the job is routed to.
    pub queue: &'static str,
    /// Attempts before the job is parked as discarded. `None` means the
    /// client-wide default applies.
    pub max_attempts: Option<i32>,
    /// Whether an identical available or recently completed job suppresses
    /// the insert.
    pub unique_by_args: bool,
    /// Higher runs first.
    pub priority: i16,
}

/// Trait for defining background jobs that can be enqueued and executed asynchronously.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the task.
    ///
    /// This MUST be unique for the whole application. It is persisted with
    /// every enqueued job, so renaming it orphans queued rows.
    const JOB_NAME: &'static str;

    /// Default priority of the task.
    const PRIORITY: i16 = 0;

    /// Whether the job should be deduplicated.
    ///
    /// If true, the job will not be enqueued if there is already an available
    /// job (waiting, retrying or running) with the same data, or one that
    /// succeeded within the last [`DEDUPLICATION_WINDOW_HOURS`].
    const DEDUPLICATED: bool = false;

    /// Job queue where this job will be executed.
    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// Attempts before the job is given up on.
    const MAX_ATTEMPTS: Option<i32> = None;

    /// Upper bound for a single run, overriding the runner's default.
    const TIMEOUT: Option<Duration> = None;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Execute the task. This method should define its logic.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Called when a run was cut short by a timeout or a panic, before the
    /// failure is recorded on the job. Errors are logged and otherwise ignored.
    ///
    /// Jobs that track their own status outside the queue use this to record
    /// failures that `run` never got to handle.
    fn on_interrupted(
        &self,
        ctx: Self::Context,
        error: &str,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        let _ = (ctx, error);
        async { Ok(()) }
    }

    /// Insert options derived from the associated constants.
    fn insert_opts() -> InsertOpts {
        InsertOpts {
            queue: Self::QUEUE,
            max_attempts: Self::MAX_ATTEMPTS,
            unique_by_args: Self::DEDUPLICATED,
            priority: Self::PRIORITY,
        }
    }

    /// Serialize this job into an insertable row.
    fn to_new_job(&self, default_max_attempts: i32) -> Result<NewJob, EnqueueError> {
        NewJob::new(Self::JOB_NAME, Self::insert_opts(), self, default_max_attempts)
    }

    /// Enqueue this job for background execution.
    ///
    /// Returns the job ID if successfully enqueued, or None if deduplicated.
    #[instrument(name = "jobs.enqueue", skip(self, pool), fields(message = Self::JOB_NAME))]
    fn enqueue<'a>(&'a self, pool: &'a PgPool) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
        let job = match self.to_new_job(DEFAULT_MAX_ATTEMPTS) {
            Ok(job) => job,
            Err(err) => return async move { Err(err) }.boxed(),
        };

        async move {
            let ids = storage::insert_jobs(pool, std::slice::from_ref(&job)).await?;
            Ok(ids.into_iter().next().flatten())
        }
        .boxed()
    }

    /// Enqueue several jobs of this type in one transaction.
    ///
    /// The result has one entry per input job, `None` where it was deduplicated.
    #[instrument(name = "jobs.enqueue_batch", skip(jobs, pool), fields(message = Self::JOB_NAME, count = jobs.len()))]
    fn enqueue_batch<'a>(
        jobs: &'a [Self],
        pool: &'a PgPool,
    ) -> BoxFuture<'a, Result<Vec<Option<i64>>, EnqueueError>> {
        let rows = match jobs
            .iter()
            .map(|job| job.to_new_job(DEFAULT_MAX_ATTEMPTS))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(rows) => rows,
            Err(err) => return async move { Err(err) }.boxed(),
        };

        async move { Ok(storage::insert_jobs(pool, &rows).await?) }.boxed()
    }
}

/// A serialized job ready to be written to `background_jobs`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    /// Kind used to find the runner for this job.
    pub job_type: &'static str,
    /// Target queue.
    pub queue: &'static str,
    /// Serialized job arguments.
    pub data: Value,
    /// Priority, higher first.
    pub priority: i16,
    /// Attempts before parking.
    pub max_attempts: i32,
    /// Whether identical available jobs suppress this insert.
    pub deduplicated: bool,
}

impl NewJob {
    pub(crate) fn new<T: Serialize + ?Sized>(
        job_type: &'static str,
        opts: InsertOpts,
        args: &T,
        default_max_attempts: i32,
    ) -> Result<Self, EnqueueError> {
        Ok(Self {
            job_type,
            queue: opts.queue,
            data: serde_json::to_value(args)?,
            priority: opts.priority,
            max_attempts: opts.max_attempts.unwrap_or(default_max_attempts).max(1),
            deduplicated: opts.unique_by_args,
        })
    }
}
