//! The application's job types and how they are wired onto queues.
//!
//! | Kind                    | Queue      | Max attempts | Unique by args |
//! |-------------------------|------------|--------------|----------------|
//! | `verification_email`    | `email`    | 5            | no             |
//! | `password_reset_email`  | `email`    | 5            | no             |
//! | `announcement_email`    | `email`    | 5            | no             |
//! | `account_locked_email`  | `email`    | 5            | no             |
//! | `stripe_webhook`        | `webhooks` | 3            | yes            |
//! | `data_export`           | `default`  | 3            | no             |

mod data_export;
mod email;
mod stripe_webhook;

pub use self::data_export::DataExportArgs;
pub use self::email::{
    AccountLockedEmailArgs, AnnouncementEmailArgs, PasswordResetEmailArgs, VerificationEmailArgs,
};
pub use self::stripe_webhook::{StripeEventKind, StripeWebhookArgs, dispatch_stripe_event};

use crate::background_job::{DEFAULT_QUEUE, InsertOpts, NewJob};
use crate::billing::BillingHandler;
use crate::errors::EnqueueError;
use crate::file_storage::FileStorage;
use crate::mail::Mailer;
use crate::runner::{Configured, Runner};
use crate::BackgroundJob;
use crate::client::Services;
use sqlx::PgPool;
use std::sync::Arc;

/// Queue for jobs without a dedicated lane (data exports).
pub const QUEUE_DEFAULT: &str = DEFAULT_QUEUE;
/// Queue for all outgoing email.
pub const QUEUE_EMAIL: &str = "email";
/// Queue for inbound webhook processing.
pub const QUEUE_WEBHOOKS: &str = "webhooks";

/// Concurrent workers on the email queue.
pub const EMAIL_WORKERS: usize = 5;
/// Concurrent workers on the webhook queue.
pub const WEBHOOK_WORKERS: usize = 3;

/// Attempts for email jobs.
pub const EMAIL_MAX_ATTEMPTS: i32 = 5;
/// Attempts for Stripe webhook jobs.
pub const WEBHOOK_MAX_ATTEMPTS: i32 = 3;
/// Attempts for data exports.
pub const DATA_EXPORT_MAX_ATTEMPTS: i32 = 3;

/// Everything a job needs at runtime.
#[derive(Clone)]
pub struct JobContext {
    /// Shared application database pool.
    pub pool: PgPool,
    /// Outgoing email.
    pub mailer: Arc<dyn Mailer>,
    /// Where export archives go.
    pub storage: Arc<dyn FileStorage>,
    /// Applies Stripe events.
    pub billing: Arc<dyn BillingHandler>,
    /// Base URL for links in emails, without trailing slash.
    pub frontend_url: Arc<str>,
}

impl JobContext {
    /// Bundle the pool, collaborators and link base for the workers.
    pub fn new(pool: PgPool, services: Services, frontend_url: &str) -> Self {
        Self {
            pool,
            mailer: services.mailer,
            storage: services.storage,
            billing: services.billing,
            frontend_url: Arc::from(frontend_url.trim_end_matches('/')),
        }
    }

    pub(crate) fn link(&self, path_and_query: &str) -> String {
        format!("{}{path_and_query}", self.frontend_url)
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("storage", &self.storage.backend())
            .field("mail_available", &self.mailer.is_available())
            .field("frontend_url", &self.frontend_url)
            .finish_non_exhaustive()
    }
}

/// Workers [`configure_runner`] starts across all queues.
pub fn total_workers(default_workers: usize) -> usize {
    default_workers
        .saturating_add(EMAIL_WORKERS)
        .saturating_add(WEBHOOK_WORKERS)
}

/// Registers every job type on its queue with the queue's worker limit.
pub fn configure_runner(
    runner: Runner<JobContext>,
    default_workers: usize,
) -> Runner<JobContext, Configured> {
    runner
        .configure_queue(QUEUE_DEFAULT, |queue| queue.num_workers(default_workers))
        .configure_queue(QUEUE_EMAIL, |queue| queue.num_workers(EMAIL_WORKERS))
        .configure_queue(QUEUE_WEBHOOKS, |queue| queue.num_workers(WEBHOOK_WORKERS))
        .register::<VerificationEmailArgs>()
        .register::<PasswordResetEmailArgs>()
        .register::<AnnouncementEmailArgs>()
        .register::<AccountLockedEmailArgs>()
        .register::<StripeWebhookArgs>()
        .register::<DataExportArgs>()
}

/// Any job the application enqueues.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    /// Confirm a new account's email address.
    VerificationEmail(VerificationEmailArgs),
    /// Send a password reset link.
    PasswordResetEmail(PasswordResetEmailArgs),
    /// Process a received Stripe webhook.
    StripeWebhook(StripeWebhookArgs),
    /// Build a user's data export.
    DataExport(DataExportArgs),
    /// Deliver an admin announcement.
    AnnouncementEmail(AnnouncementEmailArgs),
    /// Tell a user their account was locked.
    AccountLockedEmail(AccountLockedEmailArgs),
}

macro_rules! with_args {
    ($job:expr, $args:ident => $body:expr) => {
        match $job {
            Job::VerificationEmail($args) => $body,
            Job::PasswordResetEmail($args) => $body,
            Job::StripeWebhook($args) => $body,
            Job::DataExport($args) => $body,
            Job::AnnouncementEmail($args) => $body,
            Job::AccountLockedEmail($args) => $body,
        }
    };
}

fn kind_of<J: BackgroundJob>(_: &J) -> &'static str {
    J::JOB_NAME
}

fn opts_of<J: BackgroundJob>(_: &J) -> InsertOpts {
    J::insert_opts()
}

impl Job {
    /// Stable kind used to route the job to its runner.
    pub fn kind(&self) -> &'static str {
        with_args!(self, args => kind_of(args))
    }

    /// Queue, attempts and uniqueness of this job's type.
    pub fn insert_opts(&self) -> InsertOpts {
        with_args!(self, args => opts_of(args))
    }

    pub(crate) fn to_new_job(&self, default_max_attempts: i32) -> Result<NewJob, EnqueueError> {
        with_args!(self, args => args.to_new_job(default_max_attempts))
    }
}

macro_rules! impl_from_args {
    ($($variant:ident($args:ty)),* $(,)?) => {
        $(
            impl From<$args> for Job {
                fn from(args: $args) -> Self {
                    Self::$variant(args)
                }
            }
        )*
    };
}

impl_from_args!(
    VerificationEmail(VerificationEmailArgs),
    PasswordResetEmail(PasswordResetEmailArgs),
    StripeWebhook(StripeWebhookArgs),
    DataExport(DataExportArgs),
    AnnouncementEmail(AnnouncementEmailArgs),
    AccountLockedEmail(AccountLockedEmailArgs),
);
