#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

mod common;

use async_trait::async_trait;
use claims::{assert_ok, assert_some};
use serde_json::Value;
use sqlx::PgPool;
use starter_jobs::billing::LoggingBillingHandler;
use starter_jobs::export::{
    ARCHIVE_DATA_FILE, ARCHIVE_README_FILE, EXPORT_TTL_DAYS, ExportStatus, repository,
};
use starter_jobs::file_storage::{FileStorage, LocalStorage, StorageBackend, StoredObject};
use starter_jobs::jobs::{DataExportArgs, JobContext, configure_runner};
use starter_jobs::mail::{EmailMessage, Mailer};
use starter_jobs::{BackgroundJob, MailError, Runner, Services, StorageError};
use std::io::Read;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<EmailMessage>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), MailError> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

struct PanickingStorage;

#[async_trait]
impl FileStorage for PanickingStorage {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Local
    }

    async fn save(&self, _key: &str, _bytes: Vec<u8>) -> Result<StoredObject, StorageError> {
        panic!("storage driver bug");
    }

    async fn delete_file_with_key(&self, _key: &str) -> Result<(), StorageError> {
        Ok(())
    }
}

async fn seed_user(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::raw_sql(
        r"
        INSERT INTO users (id, email, name, password_hash, email_verified)
        VALUES (1, 'a@b.com', 'Ada', 'argon2-password-hash', TRUE);
        INSERT INTO user_preferences (user_id, theme) VALUES (1, 'dark');
        INSERT INTO sessions (user_id, token_hash, ip_address, expires_at)
        VALUES (1, 'session-token-hash', '10.0.0.1', NOW() + INTERVAL '1 day');
        INSERT INTO login_history (user_id, ip_address, success) VALUES (1, '10.0.0.1', TRUE);
        INSERT INTO two_factor_auth (user_id, secret, backup_codes, enabled)
        VALUES (1, 'totp-shared-secret', 'recovery-code-list', TRUE);
        INSERT INTO api_keys (user_id, name, key_prefix, key_hash)
        VALUES (1, 'ci', 'sk_live_ab', 'api-key-hash');
        INSERT INTO oauth_accounts (user_id, provider, provider_user_id, access_token, email)
        VALUES (1, 'github', '42', 'oauth-access-token', 'a@b.com');
        INSERT INTO organizations (id, name, slug) VALUES (1, 'Acme', 'acme');
        INSERT INTO organization_members (organization_id, user_id, role) VALUES (1, 1, 'owner');
        INSERT INTO audit_logs (user_id, action, resource_type) VALUES (1, 'user.login', 'session');
        INSERT INTO data_exports (id, user_id) VALUES (5, 1);
        ",
    )
    .execute(pool)
    .await?;
    Ok(())
}

fn runner(
    pool: &PgPool,
    mailer: Arc<RecordingMailer>,
    storage: Arc<dyn FileStorage>,
) -> starter_jobs::Runner<JobContext, starter_jobs::Configured> {
    let services = Services {
        mailer,
        storage,
        billing: Arc::new(LoggingBillingHandler),
    };
    let context = JobContext::new(pool.clone(), services, "https://app.example.com");
    configure_runner(Runner::new(pool.clone(), context), 1).shutdown_when_queue_empty()
}

fn read_entry(path: &str, name: &str) -> anyhow::Result<String> {
    let mut archive = zip::ZipArchive::new(std::fs::File::open(path)?)?;
    let mut contents = String::new();
    archive.by_name(name)?.read_to_string(&mut contents)?;
    Ok(contents)
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn data_export_job_builds_stores_and_announces_the_archive() -> anyhow::Result<()> {
    let db = common::setup_app_db().await?;
    let pool = db.pool.clone();
    seed_user(&pool).await?;

    let dir = tempfile::tempdir()?;
    let mailer = Arc::new(RecordingMailer::default());
    let runner = runner(&pool, mailer.clone(), Arc::new(LocalStorage::new(dir.path())));

    let args = DataExportArgs {
        user_id: 1,
        email: "a@b.com".into(),
        export_id: 5,
    };
    assert_some!(args.enqueue(&pool).await?);

    runner.start().wait_for_shutdown().await;

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM background_jobs")
        .fetch_one(&pool)
        .await?;
    assert_eq!(remaining, 0);

    let export = assert_some!(repository::find(&pool, 5).await?);
    assert_eq!(export.status, ExportStatus::Completed);
    assert!(export.file_size > 0);
    assert!(export.error_message.is_none());

    let path = assert_some!(export.file_path.clone());
    assert!(path.ends_with("user_1/export_5.zip"));
    let on_disk = std::fs::metadata(&path)?.len();
    assert_eq!(i64::try_from(on_disk)?, export.file_size);

    let completed_at = assert_some!(export.completed_at);
    let expires_at = assert_some!(export.expires_at);
    assert_eq!(
        expires_at - completed_at,
        chrono::Duration::days(i64::from(EXPORT_TTL_DAYS))
    );

    let json = read_entry(&path, ARCHIVE_DATA_FILE)?;
    for secret in [
        "argon2-password-hash",
        "session-token-hash",
        "totp-shared-secret",
        "recovery-code-list",
        "api-key-hash",
        "oauth-access-token",
    ] {
        assert!(!json.contains(secret), "{secret} leaked into the export");
    }

    let data: Value = serde_json::from_str(&json)?;
    assert_eq!(data["export_info"]["export_id"], 5);
    assert_eq!(data["profile"]["email"], "a@b.com");
    assert_eq!(data["preferences"]["theme"], "dark");
    assert_eq!(data["api_keys"][0]["key_prefix"], "sk_live_ab");
    assert_eq!(data["two_factor"]["enabled"], true);
    assert_eq!(data["oauth_providers"][0]["provider"], "github");
    assert_eq!(data["organizations"][0]["role"], "owner");
    assert!(data.get("files").is_none());

    let readme = read_entry(&path, ARCHIVE_README_FILE)?;
    assert!(readme.contains("a@b.com"));

    let sent = mailer.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "a@b.com");
    assert_eq!(sent[0].template_name, "data_export_ready");
    assert_eq!(
        sent[0].data["download_url"],
        "https://app.example.com/settings/privacy"
    );

    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn storage_failure_marks_the_export_failed_and_retries_the_job() -> anyhow::Result<()> {
    let db = common::setup_app_db().await?;
    let pool = db.pool.clone();
    seed_user(&pool).await?;

    // A regular file where the export directory should be.
    let blocker = tempfile::NamedTempFile::new()?;
    let mailer = Arc::new(RecordingMailer::default());
    let runner = runner(&pool, mailer.clone(), Arc::new(LocalStorage::new(blocker.path())));

    let job_id = assert_some!(
        DataExportArgs {
            user_id: 1,
            email: "a@b.com".into(),
            export_id: 5,
        }
        .enqueue(&pool)
        .await?
    );

    runner.start().wait_for_shutdown().await;

    let export = assert_some!(repository::find(&pool, 5).await?);
    assert_eq!(export.status, ExportStatus::Failed);
    assert!(export.file_path.is_none());
    let message = assert_some!(export.error_message);
    assert!(message.contains("failed to store export archive"), "{message}");

    let (retries, state): (i32, String) =
        sqlx::query_as("SELECT retries, state FROM background_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_one(&pool)
            .await?;
    assert_eq!(retries, 1);
    assert_eq!(state, "available");
    assert!(mailer.sent.lock().unwrap().is_empty());

    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn export_for_another_user_is_rejected() -> anyhow::Result<()> {
    let db = common::setup_app_db().await?;
    let pool = db.pool.clone();
    seed_user(&pool).await?;

    let dir = tempfile::tempdir()?;
    let storage = LocalStorage::new(dir.path());

    let result = starter_jobs::export::generate(&pool, &storage, 2, 5).await;
    assert!(result.is_err());

    // The row is untouched.
    let export = assert_some!(repository::find(&pool, 5).await?);
    assert_eq!(export.status, ExportStatus::Pending);
    assert_ok!(repository::mark_processing(&pool, 5, 1).await);

    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn panic_on_the_last_attempt_leaves_the_export_failed() -> anyhow::Result<()> {
    let db = common::setup_app_db().await?;
    let pool = db.pool.clone();
    seed_user(&pool).await?;

    let mailer = Arc::new(RecordingMailer::default());
    let runner = runner(&pool, mailer.clone(), Arc::new(PanickingStorage));

    let job_id = assert_some!(
        DataExportArgs {
            user_id: 1,
            email: "a@b.com".into(),
            export_id: 5,
        }
        .enqueue(&pool)
        .await?
    );
    sqlx::query("UPDATE background_jobs SET max_attempts = 1 WHERE id = $1")
        .bind(job_id)
        .execute(&pool)
        .await?;

    runner.start().wait_for_shutdown().await;

    let (state, last_error): (String, Option<String>) =
        sqlx::query_as("SELECT state, last_error FROM background_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_one(&pool)
            .await?;
    assert_eq!(state, "discarded");
    assert!(assert_some!(last_error).contains("storage driver bug"));

    let export = assert_some!(repository::find(&pool, 5).await?);
    assert_eq!(export.status, ExportStatus::Failed);
    let message = assert_some!(export.error_message);
    assert!(message.contains("job panicked: storage driver bug"), "{message}");
    assert!(mailer.sent.lock().unwrap().is_empty());

    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn timed_out_export_is_marked_failed() -> anyhow::Result<()> {
    let db = common::setup_app_db().await?;
    let pool = db.pool.clone();
    seed_user(&pool).await?;
    repository::mark_processing(&pool, 5, 1).await?;

    let dir = tempfile::tempdir()?;
    let services = Services {
        mailer: Arc::new(RecordingMailer::default()),
        storage: Arc::new(LocalStorage::new(dir.path())),
        billing: Arc::new(LoggingBillingHandler),
    };
    let context = JobContext::new(pool.clone(), services, "https://app.example.com");
    let args = DataExportArgs {
        user_id: 1,
        email: "a@b.com".into(),
        export_id: 5,
    };

    args.on_interrupted(context.clone(), "job timed out after 300s").await?;

    let export = assert_some!(repository::find(&pool, 5).await?);
    assert_eq!(export.status, ExportStatus::Failed);
    assert_eq!(export.error_message.as_deref(), Some("job timed out after 300s"));

    // A finished export is not rewritten by a late interruption.
    let stored = StoredObject {
        path: "user_1/export_5.zip".into(),
        size: 10,
        backend: StorageBackend::Local,
    };
    repository::mark_completed(&pool, 5, &stored).await?;
    args.on_interrupted(context, "job panicked: mailer bug").await?;

    let export = assert_some!(repository::find(&pool, 5).await?);
    assert_eq!(export.status, ExportStatus::Completed);
    assert!(export.error_message.is_none());

    Ok(())
}
