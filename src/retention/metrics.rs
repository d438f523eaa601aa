use super::Schedule;
use anyhow::Context as _;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Time series tables and the timestamp column they are pruned by.
pub const RETAINED_TABLES: [(&str, &str); 2] = [
    ("container_metrics", "recorded_at"),
    ("service_uptime", "checked_at"),
];

/// Deletes metrics history older than the retention horizon.
#[derive(Debug, Clone)]
pub struct MetricsRetention {
    pool: PgPool,
    retention_days: i64,
}

impl MetricsRetention {
    /// Sweeper name used in logs.
    pub const NAME: &'static str = "metrics_retention";

    /// Runs at startup, then daily.
    pub const SCHEDULE: Schedule = Schedule {
        initial_delay: Duration::ZERO,
        interval: Duration::from_secs(24 * 60 * 60),
    };

    /// Keep `retention_days` days of history.
    pub fn new(pool: PgPool, retention_days: i64) -> Self {
        Self {
            pool,
            retention_days,
        }
    }

    /// One pass over [`RETAINED_TABLES`]. Returns the number of deleted rows.
    ///
    /// Tables that don't exist yet are skipped.
    #[instrument(name = "metrics_retention.sweep", skip(self), fields(retention_days = self.retention_days))]
    pub async fn sweep(&self) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(self.retention_days);
        let mut total = 0;

        for (table, column) in RETAINED_TABLES {
            let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
                .bind(table)
                .fetch_one(&self.pool)
                .await
                .with_context(|| format!("failed to check for table {table}"))?;
            if !exists {
                debug!(table, "Table does not exist, skipping");
                continue;
            }

            // Table and column names come from the constant above.
            let deleted = sqlx::query(&format!("DELETE FROM {table} WHERE {column} < $1"))
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to prune {table}"))?
                .rows_affected();

            if deleted > 0 {
                info!(table, deleted, cutoff = %cutoff.to_rfc3339(), "Deleted old metrics rows");
            }
            total += deleted;
        }

        debug!(deleted = total, "Metrics retention sweep finished");
        Ok(total)
    }
}
