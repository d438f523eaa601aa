//! User data exports.
//!
//! An export row moves `pending -> processing -> completed | failed`, and the
//! cleanup sweeper later moves `completed -> expired` once the archive is
//! deleted. Only [`generate`] and the sweeper write to `data_exports`.

mod archive;
mod collect;
pub mod repository;

pub use self::archive::{ARCHIVE_DATA_FILE, ARCHIVE_README_FILE, build_archive};
pub use self::collect::{
    ApiKeyRecord, AuditLogEntry, ExportInfo, FileRecord, LoginRecord, OAuthProvider,
    OrganizationMembership, SessionRecord, TwoFactorStatus, UserDataExport, UserPreferences,
    UserProfile, collect_user_data,
};

use crate::errors::ExportError;
use crate::file_storage::{FileStorage, StorageBackend};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use tracing::{error, info, instrument};

/// Days a completed export stays downloadable.
pub const EXPORT_TTL_DAYS: i32 = 7;

/// Lifecycle of a [`DataExport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    /// Requested, job not started.
    Pending,
    /// A worker is building the archive.
    Processing,
    /// Archive stored and downloadable.
    Completed,
    /// The last attempt failed; see `error_message`.
    Failed,
    /// Archive deleted after expiry.
    Expired,
}

impl ExportStatus {
    /// The persisted value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl TryFrom<String> for ExportStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(match value.as_str() {
            "pending" => Self::Pending,
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "expired" => Self::Expired,
            _ => return Err(format!("unknown export status `{value}`")),
        })
    }
}

impl From<String> for StorageBackend {
    fn from(tag: String) -> Self {
        Self::from_tag(&tag)
    }
}

/// One row of `data_exports`.
#[derive(Debug, Clone, FromRow)]
pub struct DataExport {
    /// Primary key.
    pub id: i64,
    /// Owner of the exported data.
    pub user_id: i64,
    /// Current lifecycle state.
    #[sqlx(try_from = "String")]
    pub status: ExportStatus,
    /// Filesystem path or object key; set only while `completed`.
    pub file_path: Option<String>,
    /// Backend holding `file_path`.
    #[sqlx(try_from = "String")]
    pub storage_type: StorageBackend,
    /// Archive size in bytes.
    pub file_size: i64,
    /// Why the last attempt failed.
    pub error_message: Option<String>,
    /// When the export was requested.
    pub created_at: DateTime<Utc>,
    /// When the archive was stored.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the archive stops being downloadable.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Storage key of an export's archive, relative to the export storage root.
///
/// Deterministic so a retried attempt overwrites whatever a failed one left.
pub fn storage_key(user_id: i64, export_id: i64) -> String {
    format!("user_{user_id}/export_{export_id}.zip")
}

/// Builds, stores and records the archive for one export.
///
/// Any error before the row is marked completed marks it failed with the
/// error message and returns the error, so the queue retries the job. A run
/// cut short by a timeout or a panic is marked failed by
/// [`repository::mark_interrupted`] from the job's interruption hook.
#[instrument(skip_all, fields(export.id = export_id, user.id = user_id))]
pub async fn generate(
    pool: &PgPool,
    storage: &dyn FileStorage,
    user_id: i64,
    export_id: i64,
) -> Result<DataExport, ExportError> {
    repository::mark_processing(pool, export_id, user_id).await?;

    let stored = match build_and_store(pool, storage, user_id, export_id).await {
        Ok(stored) => stored,
        Err(export_error) => {
            if let Err(error) =
                repository::mark_failed(pool, export_id, &export_error.to_string()).await
            {
                error!(%error, "Failed to record export failure");
            }
            return Err(export_error);
        }
    };

    let export = repository::mark_completed(pool, export_id, &stored).await?;
    info!(
        path = %stored.path,
        size = %format_bytes(u64::try_from(stored.size).unwrap_or(0)),
        "Data export completed"
    );
    Ok(export)
}

async fn build_and_store(
    pool: &PgPool,
    storage: &dyn FileStorage,
    user_id: i64,
    export_id: i64,
) -> Result<crate::file_storage::StoredObject, ExportError> {
    let data = collect_user_data(pool, user_id, export_id).await?;
    let archive = build_archive(&data)?;
    Ok(storage.save(&storage_key(user_id, export_id), archive).await?)
}

/// Human readable size with binary units: `1023 B`, `1.0 KB`, `1.5 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }

    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT && exp < 5 {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }

    #[allow(clippy::cast_precision_loss)]
    let value = bytes as f64 / div as f64;
    let unit = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{value:.1} {unit}B")
}

/// The value, or `""` when absent.
pub fn deref_string(value: Option<&str>) -> &str {
    value.unwrap_or_default()
}
