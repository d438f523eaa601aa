use super::Schedule;
use crate::errors::StorageError;
use crate::export::repository::{self, ExpiredExport};
use crate::file_storage::{FileStorage, StorageBackend, remove_local_file};
use sqlx::PgPool;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Hours past `expires_at` before an archive is deleted.
pub const EXPIRY_GRACE_HOURS: i32 = 24;

const STARTUP_DELAY: Duration = Duration::from_secs(30);

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Exports moved to `expired`.
    pub expired: usize,
    /// Exports left untouched because deleting their file failed.
    pub failed: usize,
}

/// Deletes expired export archives and marks their rows `expired`.
pub struct ExportCleanup {
    pool: PgPool,
    storage: Arc<dyn FileStorage>,
}

impl std::fmt::Debug for ExportCleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportCleanup")
            .field("storage", &self.storage.backend())
            .finish_non_exhaustive()
    }
}

impl ExportCleanup {
    /// Sweeper name used in logs.
    pub const NAME: &'static str = "export_cleanup";

    /// `storage` deletes objects for exports stored outside the local filesystem.
    pub fn new(pool: PgPool, storage: Arc<dyn FileStorage>) -> Self {
        Self { pool, storage }
    }

    /// Starts shortly after boot, then every `interval`.
    pub fn schedule(interval: Duration) -> Schedule {
        Schedule {
            initial_delay: STARTUP_DELAY,
            interval,
        }
    }

    /// One cleanup pass. A row whose file can't be deleted is logged and skipped.
    ///
    /// # Errors
    ///
    /// Only if the expired exports can't be listed.
    #[instrument(name = "export_cleanup.sweep", skip(self))]
    pub async fn sweep(&self) -> anyhow::Result<CleanupReport> {
        let exports = repository::find_expired(&self.pool, EXPIRY_GRACE_HOURS).await?;
        let mut report = CleanupReport::default();

        for export in &exports {
            match self.expire(export).await {
                Ok(()) => report.expired += 1,
                Err(error) => {
                    warn!(export.id = export.id, "Failed to clean up export: {error:#}");
                    report.failed += 1;
                }
            }
        }

        if report.expired > 0 || report.failed > 0 {
            info!(expired = report.expired, failed = report.failed, "Export cleanup finished");
        } else {
            debug!("No expired exports");
        }
        Ok(report)
    }

    async fn expire(&self, export: &ExpiredExport) -> anyhow::Result<()> {
        let removed = match export.storage_type {
            StorageBackend::Local => remove_local_file(&export.file_path).await,
            StorageBackend::S3 => self.storage.delete_file_with_key(&export.file_path).await,
        };
        match removed {
            Ok(()) => {}
            Err(StorageError::Io(error)) if error.kind() == ErrorKind::NotFound => {
                debug!(export.id = export.id, "Export file already gone");
            }
            Err(error) => return Err(error.into()),
        }

        repository::mark_expired(&self.pool, export.id).await?;
        debug!(export.id = export.id, path = %export.file_path, "Expired export");
        Ok(())
    }
}
