//! The job client: one connection pool and one runner per process.
//!
//! Constructed once by the composition root and cloned into whatever needs to
//! enqueue. A disabled client is a valid value: lifecycle calls are no-ops and
//! enqueueing returns [`JobsError::NotInitialized`], which callers treat as
//! "skip this optional side effect".

use crate::background_job::NewJob;
use crate::billing::{BillingHandler, LoggingBillingHandler};
use crate::config::JobsConfig;
use crate::errors::{EnqueueError, JobsError};
use crate::file_storage::{FileStorage, LocalStorage};
use crate::jobs::{Job, JobContext, configure_runner, total_workers};
use crate::mail::{LogMailer, Mailer};
use crate::runner::{Configured, RunHandle, Runner};
use crate::schema::BackgroundJob as JobRow;
use crate::storage;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// Collaborators the jobs call out to.
#[derive(Clone)]
pub struct Services {
    /// Outgoing email.
    pub mailer: Arc<dyn Mailer>,
    /// Export archive storage.
    pub storage: Arc<dyn FileStorage>,
    /// Stripe event handling.
    pub billing: Arc<dyn BillingHandler>,
}

impl Services {
    /// Logging mailer, local storage under `exports_dir`, logging billing handler.
    pub fn development(exports_dir: impl Into<PathBuf>) -> Self {
        Self {
            mailer: Arc::new(LogMailer),
            storage: Arc::new(LocalStorage::new(exports_dir)),
            billing: Arc::new(LoggingBillingHandler),
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("mail_available", &self.mailer.is_available())
            .field("storage", &self.storage.backend())
            .finish_non_exhaustive()
    }
}

struct Instance {
    pool: PgPool,
    runner: Arc<Runner<JobContext, Configured>>,
    handle: Mutex<Option<RunHandle>>,
    default_max_attempts: i32,
}

/// Handle to the job system. Cheap to clone; all clones share one instance.
#[derive(Clone, Default)]
pub struct JobClient {
    instance: Arc<RwLock<Option<Arc<Instance>>>>,
    // Serializes reinitialize and stop so no instance is dropped while running.
    lifecycle: Arc<Mutex<()>>,
}

impl std::fmt::Debug for JobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobClient")
            .field("available", &self.is_available())
            .finish()
    }
}

impl JobClient {
    /// A client that never runs or accepts jobs.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Connects, migrates the queue table and registers every job type.
    ///
    /// Returns a disabled client when `config.enabled` is false.
    ///
    /// # Errors
    ///
    /// Connection and migration failures; these should abort startup.
    pub async fn initialize(config: &JobsConfig, services: Services) -> Result<Self, JobsError> {
        let client = Self::disabled();
        client.reinitialize(config, services).await?;
        Ok(client)
    }

    /// Replaces the current instance, stopping it and closing its pool first.
    ///
    /// # Errors
    ///
    /// See [`JobClient::initialize`]. The client is left disabled on error.
    pub async fn reinitialize(&self, config: &JobsConfig, services: Services) -> Result<(), JobsError> {
        let _lifecycle = self.lifecycle.lock().await;
        shutdown(self.replace(None)).await;

        if !config.enabled {
            info!("Background jobs are disabled");
            return Ok(());
        }

        let instance = build_instance(config, services).await?;
        info!(
            queues = ?instance.runner.queue_names(),
            default_workers = config.worker_count,
            "Background job client initialized"
        );
        shutdown(self.replace(Some(Arc::new(instance)))).await;
        Ok(())
    }

    fn current(&self) -> Option<Arc<Instance>> {
        self.instance.read().ok().and_then(|guard| guard.clone())
    }

    fn replace(&self, instance: Option<Arc<Instance>>) -> Option<Arc<Instance>> {
        match self.instance.write() {
            Ok(mut guard) => std::mem::replace(&mut *guard, instance),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), instance),
        }
    }

    /// Whether jobs can be enqueued.
    pub fn is_available(&self) -> bool {
        self.current().is_some()
    }

    /// Starts the workers. Calling it again while running does nothing.
    pub async fn start(&self) {
        let Some(instance) = self.current() else {
            return;
        };
        let mut handle = instance.handle.lock().await;
        if handle.is_none() {
            let run = instance.runner.start();
            info!(workers = run.worker_count(), "Background workers started");
            *handle = Some(run);
        }
    }

    /// Stops the workers, waits for running jobs and closes the pool.
    ///
    /// The client is disabled afterwards.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        shutdown(self.replace(None)).await;
    }

    /// The runner, if the client is enabled.
    pub fn runner(&self) -> Option<Arc<Runner<JobContext, Configured>>> {
        self.current().map(|instance| instance.runner.clone())
    }

    /// The queue's connection pool, if the client is enabled.
    pub fn pool(&self) -> Option<PgPool> {
        self.current().map(|instance| instance.pool.clone())
    }

    /// Enqueues one job. `Ok(None)` means an identical job was already waiting.
    ///
    /// # Errors
    ///
    /// [`JobsError::NotInitialized`] when disabled, otherwise enqueue failures.
    #[instrument(name = "jobs.insert", skip_all, fields(job.type = job.kind()))]
    pub async fn insert(&self, job: &Job) -> Result<Option<i64>, JobsError> {
        let ids = self.insert_many(std::slice::from_ref(job)).await?;
        Ok(ids.into_iter().next().flatten())
    }

    /// Enqueues several jobs of any kind in one transaction.
    ///
    /// # Errors
    ///
    /// [`JobsError::NotInitialized`] when disabled, otherwise enqueue failures.
    /// Nothing is enqueued on error.
    #[instrument(name = "jobs.insert_many", skip_all, fields(count = jobs.len()))]
    pub async fn insert_many(&self, jobs: &[Job]) -> Result<Vec<Option<i64>>, JobsError> {
        let instance = self.current().ok_or(JobsError::NotInitialized)?;
        let rows = jobs
            .iter()
            .map(|job| job.to_new_job(instance.default_max_attempts))
            .collect::<Result<Vec<NewJob>, _>>()?;
        let ids = storage::insert_jobs(&instance.pool, &rows)
            .await
            .map_err(EnqueueError::from)?;
        Ok(ids)
    }

    /// Jobs parked after exhausting their attempts, newest first.
    ///
    /// # Errors
    ///
    /// [`JobsError::NotInitialized`] when disabled, otherwise query failures.
    pub async fn discarded_jobs(&self, limit: i64) -> Result<Vec<JobRow>, JobsError> {
        let instance = self.current().ok_or(JobsError::NotInitialized)?;
        storage::discarded_jobs(&instance.pool, limit)
            .await
            .map_err(|e| EnqueueError::from(e).into())
    }

    /// Gives a discarded job a fresh set of attempts.
    ///
    /// # Errors
    ///
    /// [`JobsError::NotInitialized`] when disabled, otherwise query failures.
    pub async fn retry_job(&self, job_id: i64) -> Result<bool, JobsError> {
        let instance = self.current().ok_or(JobsError::NotInitialized)?;
        let retried = storage::retry_discarded_job(&instance.pool, job_id)
            .await
            .map_err(EnqueueError::from)?;
        if !retried {
            warn!(job.id = job_id, "No discarded job to retry");
        }
        Ok(retried)
    }
}

/// Stops a replaced instance's workers and closes its pool.
async fn shutdown(instance: Option<Arc<Instance>>) {
    let Some(instance) = instance else {
        return;
    };
    if let Some(run) = instance.handle.lock().await.take() {
        run.shutdown().await;
        info!("Background workers stopped");
    }
    instance.pool.close().await;
}

/// Connections beyond two per worker, for enqueueing and the sweepers.
const POOL_HEADROOM: u32 = 10;

/// Each running job holds one connection for its row lock and may query
/// through the same pool while it runs.
fn pool_size(default_workers: usize) -> u32 {
    u32::try_from(total_workers(default_workers))
        .unwrap_or(u32::MAX)
        .saturating_mul(2)
        .saturating_add(POOL_HEADROOM)
}

async fn build_instance(config: &JobsConfig, services: Services) -> Result<Instance, JobsError> {
    let pool = PgPoolOptions::new()
        .max_connections(pool_size(config.worker_count))
        .connect(&config.database_url)
        .await
        .map_err(JobsError::Connect)?;

    storage::setup_database(&pool).await?;

    let context = JobContext::new(pool.clone(), services, &config.frontend_url);
    let runner = configure_runner(Runner::new(pool.clone(), context), config.worker_count)
        .job_timeout(config.timeout);

    Ok(Instance {
        pool,
        runner: Arc::new(runner),
        handle: Mutex::new(None),
        default_max_attempts: config.max_retries,
    })
}
