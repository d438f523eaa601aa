//! Status updates on `data_exports`.

use super::{DataExport, EXPORT_TTL_DAYS, ExportStatus};
use crate::errors::ExportError;
use crate::file_storage::StoredObject;
use sqlx::PgPool;

const EXPORT_COLUMNS: &str = "id, user_id, status, file_path, storage_type, file_size, error_message, created_at, completed_at, expires_at";

/// Loads one export.
pub async fn find(pool: &PgPool, export_id: i64) -> Result<Option<DataExport>, sqlx::Error> {
    let query = format!("SELECT {EXPORT_COLUMNS} FROM data_exports WHERE id = $1");
    sqlx::query_as::<_, DataExport>(&query)
        .bind(export_id)
        .fetch_optional(pool)
        .await
}

/// Moves the export into `processing` and clears any previous failure.
///
/// # Errors
///
/// [`ExportError::NotFound`] if no export with this id belongs to `user_id`.
pub async fn mark_processing(
    pool: &PgPool,
    export_id: i64,
    user_id: i64,
) -> Result<(), ExportError> {
    let result = sqlx::query(
        r"
        UPDATE data_exports
        SET status = $3, error_message = NULL, updated_at = NOW()
        WHERE id = $1 AND user_id = $2
        ",
    )
    .bind(export_id)
    .bind(user_id)
    .bind(ExportStatus::Processing.as_str())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ExportError::NotFound(export_id));
    }
    Ok(())
}

/// Records the stored archive. `expires_at` is `completed_at` plus the TTL.
pub async fn mark_completed(
    pool: &PgPool,
    export_id: i64,
    stored: &StoredObject,
) -> Result<DataExport, sqlx::Error> {
    let query = format!(
        r"
        UPDATE data_exports
        SET status = $2,
            file_path = $3,
            storage_type = $4,
            file_size = $5,
            error_message = NULL,
            completed_at = NOW(),
            expires_at = NOW() + make_interval(days => $6),
            updated_at = NOW()
        WHERE id = $1
        RETURNING {EXPORT_COLUMNS}
        "
    );
    sqlx::query_as::<_, DataExport>(&query)
        .bind(export_id)
        .bind(ExportStatus::Completed.as_str())
        .bind(&stored.path)
        .bind(stored.backend.as_str())
        .bind(stored.size)
        .bind(EXPORT_TTL_DAYS)
        .fetch_one(pool)
        .await
}

/// Records why the export failed.
pub async fn mark_failed(pool: &PgPool, export_id: i64, message: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE data_exports
        SET status = $2, error_message = $3, updated_at = NOW()
        WHERE id = $1
        ",
    )
    .bind(export_id)
    .bind(ExportStatus::Failed.as_str())
    .bind(message)
    .execute(pool)
    .await?;
    Ok(())
}

/// Marks an unfinished export failed. Completed or expired exports are left
/// alone. Returns whether the row changed.
pub async fn mark_interrupted(
    pool: &PgPool,
    export_id: i64,
    user_id: i64,
    message: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE data_exports
        SET status = $3, error_message = $4, updated_at = NOW()
        WHERE id = $1 AND user_id = $2 AND status IN ($5, $6)
        ",
    )
    .bind(export_id)
    .bind(user_id)
    .bind(ExportStatus::Failed.as_str())
    .bind(message)
    .bind(ExportStatus::Pending.as_str())
    .bind(ExportStatus::Processing.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// A completed export whose archive is due for deletion.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExpiredExport {
    /// Export id.
    pub id: i64,
    /// Path or key of the archive.
    pub file_path: String,
    /// Backend holding the archive.
    #[sqlx(try_from = "String")]
    pub storage_type: crate::file_storage::StorageBackend,
}

/// Completed exports that expired more than `grace_hours` ago and still
/// point at a file.
pub async fn find_expired(pool: &PgPool, grace_hours: i32) -> Result<Vec<ExpiredExport>, sqlx::Error> {
    sqlx::query_as::<_, ExpiredExport>(
        r"
        SELECT id, file_path, storage_type
        FROM data_exports
        WHERE status = $1
          AND expires_at < NOW() - make_interval(hours => $2)
          AND file_path IS NOT NULL
        ORDER BY expires_at
        ",
    )
    .bind(ExportStatus::Completed.as_str())
    .bind(grace_hours)
    .fetch_all(pool)
    .await
}

/// Clears the file pointer and moves the export to `expired` in one update.
pub async fn mark_expired(pool: &PgPool, export_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE data_exports
        SET status = $2, file_path = NULL, updated_at = NOW()
        WHERE id = $1
        ",
    )
    .bind(export_id)
    .bind(ExportStatus::Expired.as_str())
    .execute(pool)
    .await?;
    Ok(())
}
