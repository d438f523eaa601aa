use crate::background_job::{DEDUPLICATION_WINDOW_HOURS, NewJob};
use crate::schema::{BackgroundJob, STATE_AVAILABLE, STATE_COMPLETED, STATE_DISCARDED};
use sqlx::{PgPool, Postgres, Transaction};

/// Creates or upgrades the `background_jobs` table.
///
/// Safe to call on every startup; applied migrations are skipped.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

const JOB_COLUMNS: &str = "id, job_type, queue, data, retries, max_attempts, state, last_error, last_retry, created_at, priority, completed_at";

/// Inserts jobs in one transaction, returning `None` for deduplicated ones.
pub(crate) async fn insert_jobs(
    pool: &PgPool,
    jobs: &[NewJob],
) -> Result<Vec<Option<i64>>, sqlx::Error> {
    if jobs.is_empty() {
        return Ok(Vec::new());
    }

    let mut tx = pool.begin().await?;
    let mut ids = Vec::with_capacity(jobs.len());
    for job in jobs {
        let id = if job.deduplicated {
            insert_deduplicated(&mut tx, job).await?
        } else {
            Some(insert_simple(&mut tx, job).await?)
        };
        ids.push(id);
    }
    tx.commit().await?;

    Ok(ids)
}

async fn insert_deduplicated(
    tx: &mut Transaction<'_, Postgres>,
    job: &NewJob,
) -> Result<Option<i64>, sqlx::Error> {
    // Serializes concurrent inserts of the same arguments until commit.
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1 || ':' || ($2::jsonb)::text, 0))")
        .bind(job.job_type)
        .bind(&job.data)
        .execute(&mut **tx)
        .await?;

    sqlx::query(
        r"
        DELETE FROM background_jobs
        WHERE job_type = $1
          AND state = $2
          AND completed_at < NOW() - make_interval(hours => $3)
        ",
    )
    .bind(job.job_type)
    .bind(STATE_COMPLETED)
    .bind(DEDUPLICATION_WINDOW_HOURS)
    .execute(&mut **tx)
    .await?;

    // Running jobs are still `available` and locked, so they count as duplicates
    // too. Completed rows left after the prune above are inside the window.
    let result = sqlx::query_scalar::<_, Option<i64>>(
        r"
        INSERT INTO background_jobs (job_type, queue, data, priority, max_attempts)
        SELECT $1, $2, $3, $4, $5
        WHERE NOT EXISTS (
            SELECT 1 FROM background_jobs
            WHERE job_type = $1 AND data = $3 AND state IN ($6, $7)
        )
        RETURNING id
        ",
    )
    .bind(job.job_type)
    .bind(job.queue)
    .bind(&job.data)
    .bind(job.priority)
    .bind(job.max_attempts)
    .bind(STATE_AVAILABLE)
    .bind(STATE_COMPLETED)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(result.flatten())
}

async fn insert_simple(
    tx: &mut Transaction<'_, Postgres>,
    job: &NewJob,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO background_jobs (job_type, queue, data, priority, max_attempts)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
        ",
    )
    .bind(job.job_type)
    .bind(job.queue)
    .bind(&job.data)
    .bind(job.priority)
    .bind(job.max_attempts)
    .fetch_one(&mut **tx)
    .await
}

/// The number of available jobs that have failed at least once
pub async fn failed_job_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM background_jobs WHERE retries > 0 AND state = $1",
    )
    .bind(STATE_AVAILABLE)
    .fetch_one(pool)
    .await
}

/// Finds the next job that is unlocked, and ready to be retried.
pub(crate) async fn find_next_unlocked_job_tx(
    tx: &mut Transaction<'_, Postgres>,
    job_types: &[String],
) -> Result<BackgroundJob, sqlx::Error> {
    let query = format!(
        r"
        SELECT {JOB_COLUMNS}
        FROM background_jobs
        WHERE job_type = ANY($1)
          AND state = 'available'
          AND (retries = 0 OR last_retry < NOW() - INTERVAL '1 minute' * POWER(2, retries))
        ORDER BY priority DESC, id ASC
        FOR UPDATE SKIP LOCKED
        LIMIT 1
        "
    );
    sqlx::query_as::<_, BackgroundJob>(&query)
        .bind(job_types)
        .fetch_one(&mut **tx)
        .await
}

/// Records a successful run.
///
/// Deduplicated jobs are kept as completed so an identical insert within the
/// deduplication window is still suppressed. Every other job is deleted.
pub(crate) async fn complete_successful_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
    deduplicated: bool,
) -> Result<(), sqlx::Error> {
    if deduplicated {
        sqlx::query(
            "UPDATE background_jobs SET state = $2, completed_at = NOW(), last_error = NULL WHERE id = $1",
        )
        .bind(job_id)
        .bind(STATE_COMPLETED)
        .execute(&mut **tx)
        .await?;
    } else {
        sqlx::query("DELETE FROM background_jobs WHERE id = $1")
            .bind(job_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

/// Marks that we just tried and failed to run a job.
///
/// Once the attempt count reaches `max_attempts` the job is parked as
/// discarded. Returns the state the job is left in.
pub(crate) async fn update_failed_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
    error: &str,
) -> Result<String, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        r"
        UPDATE background_jobs
        SET retries = retries + 1,
            last_retry = NOW(),
            last_error = $2,
            state = CASE WHEN retries + 1 >= max_attempts THEN $3 ELSE state END
        WHERE id = $1
        RETURNING state
        ",
    )
    .bind(job_id)
    .bind(error)
    .bind(STATE_DISCARDED)
    .fetch_one(&mut **tx)
    .await
}

/// Jobs parked after exhausting their attempts, newest first.
pub async fn discarded_jobs(pool: &PgPool, limit: i64) -> Result<Vec<BackgroundJob>, sqlx::Error> {
    let query = format!(
        "SELECT {JOB_COLUMNS} FROM background_jobs WHERE state = $1 ORDER BY last_retry DESC LIMIT $2"
    );
    sqlx::query_as::<_, BackgroundJob>(&query)
        .bind(STATE_DISCARDED)
        .bind(limit)
        .fetch_all(pool)
        .await
}

/// Puts a discarded job back into the queue with a fresh attempt budget.
///
/// Returns false if no discarded job with that id exists.
pub async fn retry_discarded_job(pool: &PgPool, job_id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE background_jobs
        SET state = $2, retries = 0, last_error = NULL, last_retry = NOW()
        WHERE id = $1 AND state = $3
        ",
    )
    .bind(job_id)
    .bind(STATE_AVAILABLE)
    .bind(STATE_DISCARDED)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}
