//! Database schema definitions for SQLx.
//!
//! This module contains the row types of the queue tables created by the
//! embedded migrations.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

/// State of a job that is waiting, retrying or running.
pub const STATE_AVAILABLE: &str = "available";
/// State of a job that exhausted its attempts and is parked for inspection.
pub const STATE_DISCARDED: &str = "discarded";
/// State of a deduplicated job that succeeded. Kept until the deduplication
/// window has passed, then pruned.
pub const STATE_COMPLETED: &str = "completed";

/// Represents a background job record in the database
#[derive(Debug, Clone, FromRow)]
pub struct BackgroundJob {
    /// Unique identifier for the job
    pub id: i64,
    /// Type identifier for the job (used for dispatch)
    pub job_type: String,
    /// Queue the job was routed to
    pub queue: String,
    /// JSON data containing the job payload
    pub data: Value,
    /// Number of failed attempts so far
    pub retries: i32,
    /// Attempts allowed before the job is discarded
    pub max_attempts: i32,
    /// [`STATE_AVAILABLE`], [`STATE_DISCARDED`] or [`STATE_COMPLETED`]
    pub state: String,
    /// Error message of the last failed attempt
    pub last_error: Option<String>,
    /// Timestamp of the last retry attempt
    pub last_retry: DateTime<Utc>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Priority of the job (higher = more important)
    pub priority: i16,
    /// When a kept deduplicated job succeeded
    pub completed_at: Option<DateTime<Utc>>,
}

impl BackgroundJob {
    /// Whether the job was parked after running out of attempts.
    pub fn is_discarded(&self) -> bool {
        self.state == STATE_DISCARDED
    }
}
