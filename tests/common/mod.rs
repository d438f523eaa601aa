#![allow(dead_code)]

use sqlx::PgPool;
use std::future::Future;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;

pub struct TestDb {
    pub pool: PgPool,
    pub url: String,
    _container: ContainerAsync<Postgres>,
}

/// Starts PostgreSQL with the `background_jobs` table.
pub async fn setup_test_db() -> anyhow::Result<TestDb> {
    let container = Postgres::default().start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

    let pool = PgPool::connect(&url).await?;
    starter_jobs::setup_database(&pool).await?;

    Ok(TestDb {
        pool,
        url,
        _container: container,
    })
}

/// Like [`setup_test_db`], plus the application tables the jobs read and write.
pub async fn setup_app_db() -> anyhow::Result<TestDb> {
    let db = setup_test_db().await?;
    sqlx::raw_sql(include_str!("../fixtures/app_schema.sql"))
        .execute(&db.pool)
        .await?;
    Ok(db)
}

/// Polls `condition` every 100ms until it holds, failing after `timeout`.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition().await? {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}
