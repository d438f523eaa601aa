use crate::BackgroundJob;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

type RunTaskFn<Context> =
    dyn Fn(Context, Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

type InterruptedFn<Context> =
    dyn Fn(Context, Value, String) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// A type-erased job runner together with its per-type settings.
pub(crate) struct RegisteredJob<Context> {
    pub(crate) run: Arc<RunTaskFn<Context>>,
    pub(crate) on_interrupted: Arc<InterruptedFn<Context>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) deduplicated: bool,
}

impl<Context> Clone for RegisteredJob<Context> {
    fn clone(&self) -> Self {
        Self {
            run: self.run.clone(),
            on_interrupted: self.on_interrupted.clone(),
            timeout: self.timeout,
            deduplicated: self.deduplicated,
        }
    }
}

/// Maps job kinds to the functions that deserialize and run them.
pub(crate) struct JobRegistry<Context> {
    entries: HashMap<String, RegisteredJob<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<Context> std::fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Context: Clone + Send + 'static> JobRegistry<Context> {
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        let run: Arc<RunTaskFn<Context>> = Arc::new(|ctx: Context, data: Value| {
            async move {
                let job: J = serde_json::from_value(data)?;
                job.run(ctx).await
            }
            .boxed()
        });
        let on_interrupted: Arc<InterruptedFn<Context>> =
            Arc::new(|ctx: Context, data: Value, error: String| {
                async move {
                    let job: J = serde_json::from_value(data)?;
                    job.on_interrupted(ctx, &error).await
                }
                .boxed()
            });

        self.entries.insert(
            J::JOB_NAME.to_string(),
            RegisteredJob {
                run,
                on_interrupted,
                timeout: J::TIMEOUT,
                deduplicated: J::DEDUPLICATED,
            },
        );
    }

    pub(crate) fn job_types(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<&RegisteredJob<Context>> {
        self.entries.get(job_type)
    }
}
