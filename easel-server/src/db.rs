use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Postgres has no CREATE TYPE IF NOT EXISTS
    sqlx::query(
        r#"
        DO $$
        BEGIN
            CREATE TYPE archive_reason AS ENUM ('done', 'cancelled', 'error');
        EXCEPTION
            WHEN duplicate_object THEN null;
        END
        $$;
        "#,
    )
    .execute(pool)
    .await?;

    // Active queue
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            seq BIGSERIAL NOT NULL,
            created TIMESTAMPTZ NOT NULL,
            running BOOLEAN NOT NULL DEFAULT false,
            settings JSONB NOT NULL,
            start_time TIMESTAMPTZ,
            end_time TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Finished jobs
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs_archive (
            id UUID PRIMARY KEY,
            seq BIGINT NOT NULL,
            created TIMESTAMPTZ NOT NULL,
            settings JSONB NOT NULL,
            start_time TIMESTAMPTZ,
            end_time TIMESTAMPTZ,
            archive_reason archive_reason NOT NULL,
            job_output TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_queue_order ON jobs(created, seq)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_running ON jobs(running)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
