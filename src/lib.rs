#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
pub mod billing;
mod client;
pub mod config;
mod errors;
pub mod export;
pub mod file_storage;
mod job_registry;
pub mod jobs;
pub mod mail;
pub mod retention;
mod runner;
/// Database schema definitions.
pub mod schema;
mod storage;
pub mod telemetry;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::{
    BackgroundJob, DEDUPLICATION_WINDOW_HOURS, DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE, InsertOpts,
};
/// The job system handle and its collaborators.
pub use self::client::{JobClient, Services};
/// Error types.
pub use self::errors::{EnqueueError, ExportError, JobsError, MailError, StorageError};
/// The main runner that orchestrates job processing.
pub use self::runner::{Configured, Queue, RunHandle, Runner, Unconfigured};
/// Queue administration.
pub use self::storage::{discarded_jobs, failed_job_count, retry_discarded_job, setup_database};
