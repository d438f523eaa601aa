use crate::BackgroundJob;
use crate::job_registry::JobRegistry;
use crate::worker::Worker;
use futures_util::future::join_all;
use sqlx::PgPool;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30);

/// Marker type for a runner with at least one registered job type
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for a runner without registered job types
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// The core runner responsible for locking and running jobs
pub struct Runner<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    connection_pool: PgPool,
    queues: HashMap<String, Queue<Context>>,
    context: Context,
    job_timeout: Duration,
    shutdown_when_queue_empty: bool,
    _state: PhantomData<State>,
}

impl<Context: std::fmt::Debug + Clone + Sync + Send, State: std::fmt::Debug> std::fmt::Debug
    for Runner<Context, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("queues", &self.queues)
            .field("context", &self.context)
            .field("job_timeout", &self.job_timeout)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish_non_exhaustive()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given connection pool and context.
    pub fn new(connection_pool: PgPool, context: Context) -> Self {
        Self {
            connection_pool,
            queues: HashMap::new(),
            context,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            shutdown_when_queue_empty: false,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Runner<Context, State> {
    /// Configure a queue's worker settings.
    ///
    /// Queues that are configured but never receive a job type don't start workers.
    pub fn configure_queue(
        mut self,
        queue_name: &str,
        config_fn: impl FnOnce(Queue<Context>) -> Queue<Context>,
    ) -> Self {
        let queue = self.queues.remove(queue_name).unwrap_or_default();
        self.queues.insert(queue_name.into(), config_fn(queue));
        self
    }

    /// Configure the `default` queue's worker settings.
    pub fn configure_default_queue(
        self,
        config_fn: impl FnOnce(Queue<Context>) -> Queue<Context>,
    ) -> Self {
        self.configure_queue(crate::background_job::DEFAULT_QUEUE, config_fn)
    }

    /// Register a job type on the queue named by its `QUEUE` constant.
    pub fn register<J: BackgroundJob<Context = Context>>(mut self) -> Runner<Context, Configured> {
        self.queues
            .entry(J::QUEUE.to_string())
            .or_default()
            .job_registry
            .register::<J>();

        Runner {
            connection_pool: self.connection_pool,
            queues: self.queues,
            context: self.context,
            job_timeout: self.job_timeout,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            _state: PhantomData,
        }
    }

    /// Upper bound for a single job run, unless the job type declares its own.
    pub fn job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    /// Set the runner to shut down when the background job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Names of the queues that have job types registered.
    pub fn queue_names(&self) -> Vec<&str> {
        self.queues
            .iter()
            .filter(|(_, queue)| !queue.job_registry.job_types().is_empty())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context, Configured> {
    /// Start the background workers.
    ///
    /// This returns a [`RunHandle`] which can be used to stop the workers or
    /// wait for them to shut down.
    pub fn start(&self) -> RunHandle {
        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();
        for (queue_name, queue) in &self.queues {
            if queue.job_registry.job_types().is_empty() {
                continue;
            }

            let job_registry = Arc::new(queue.job_registry.clone());
            for i in 1..=queue.num_workers {
                let name = format!("background-worker-{queue_name}-{i}");
                info!(worker.name = %name, "Starting worker…");

                let worker = Worker {
                    connection_pool: self.connection_pool.clone(),
                    context: self.context.clone(),
                    job_registry: job_registry.clone(),
                    shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                    poll_interval: queue.poll_interval,
                    jitter: queue.jitter,
                    job_timeout: self.job_timeout,
                    shutdown: shutdown.child_token(),
                };

                let span = info_span!("worker", worker.name = %name);
                let handle = tokio::spawn(async move { worker.run().instrument(span).await });

                handles.push(handle);
            }
        }

        RunHandle { handles, shutdown }
    }
}

/// Handle to a running background job processing system
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl RunHandle {
    /// Ask all workers to stop after their current job and wait for them.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.wait_for_shutdown().await;
    }

    /// Wait for all background workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });
    }

    /// Number of spawned worker tasks.
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}

/// Configuration and state for a job queue
#[derive(Debug)]
pub struct Queue<Context> {
    job_registry: JobRegistry<Context>,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
}

impl<Context> Default for Queue<Context> {
    fn default() -> Self {
        Self {
            job_registry: JobRegistry::default(),
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl<Context> Queue<Context> {
    /// Set the number of concurrent workers for this queue.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }
}
