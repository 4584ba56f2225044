//! Job Repository
//!
//! Postgres implementation of [`JobStore`]. Active jobs live in `jobs`,
//! finished ones in `jobs_archive`. The `seq` column orders jobs created in
//! the same microsecond.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use easel_core::domain::job::{ArchiveReason, Job, JobLookup, QueuePosition, Settings};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use super::{JobStore, StoreError};

/// Job store backed by a Postgres pool
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn add_job(&self, job: &Job) -> Result<(), StoreError> {
        // Archived ids never come back into the queue
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, created, settings)
            SELECT $1, $2, $3
            WHERE NOT EXISTS (SELECT 1 FROM jobs_archive WHERE id = $1)
            "#,
        )
        .bind(job.id)
        .bind(job.created)
        .bind(Json(&job.settings))
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => {
                tracing::debug!(job_id = %job.id, "Job inserted into queue");
                Ok(())
            }
            Ok(_) => Err(StoreError::DuplicateKey(job.id)),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(StoreError::DuplicateKey(job.id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_next_job(&self) -> Result<Option<Job>, StoreError> {
        let mut tx = self.pool.begin().await?;

        // A running job means the previous process died mid-render
        let running = sqlx::query_as::<_, ActiveJobRow>(
            r#"
            SELECT id, created, running, settings, start_time, end_time
            FROM jobs
            WHERE running = true
            ORDER BY created ASC, seq ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = running {
            tx.commit().await?;
            tracing::info!(job_id = %row.id, "Resuming job left running");
            return Ok(Some(row.into()));
        }

        let claimed = sqlx::query_as::<_, ActiveJobRow>(
            r#"
            UPDATE jobs
            SET running = true, start_time = $1
            WHERE id = (
                SELECT id
                FROM jobs
                WHERE running = false
                ORDER BY created ASC, seq ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND running = false
            RETURNING id, created, running, settings, start_time, end_time
            "#,
        )
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(claimed.map(Into::into))
    }

    async fn get_job_by_uuid(&self, id: Uuid) -> Result<Option<JobLookup>, StoreError> {
        let active = sqlx::query_as::<_, ActiveJobRow>(
            r#"
            SELECT id, created, running, settings, start_time, end_time
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = active {
            let ahead = sqlx::query_scalar::<_, i64>(
                r#"
                SELECT count(*)
                FROM jobs j, jobs t
                WHERE t.id = $1
                  AND (j.created, j.seq) < (t.created, t.seq)
                "#,
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await?;

            return Ok(Some(JobLookup {
                job: row.into(),
                position: QueuePosition::Queued(ahead.max(0) as u64),
            }));
        }

        let archived = sqlx::query_as::<_, ArchivedJobRow>(
            r#"
            SELECT id, created, settings, start_time, end_time,
                   archive_reason::text AS archive_reason, job_output
            FROM jobs_archive
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match archived {
            Some(row) => Ok(Some(JobLookup {
                job: row.try_into()?,
                position: QueuePosition::Archived,
            })),
            None => Ok(None),
        }
    }

    async fn archive_job(
        &self,
        reason: ArchiveReason,
        id: Uuid,
        end_time: DateTime<Utc>,
        output: Option<String>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM jobs
                WHERE id = $1
                RETURNING id, seq, created, settings, start_time
            )
            INSERT INTO jobs_archive
                (id, seq, created, settings, start_time, end_time, archive_reason, job_output)
            SELECT id, seq, created, settings, start_time, $2, $3::archive_reason, $4
            FROM moved
            "#,
        )
        .bind(id)
        .bind(end_time)
        .bind(reason.as_str())
        .bind(output)
        .execute(&mut *tx)
        .await?;

        let rows = result.rows_affected();
        if rows != 1 {
            tx.rollback().await?;
            return Err(StoreError::UnexpectedRowCount { id, rows });
        }

        tx.commit().await?;
        tracing::debug!(job_id = %id, %reason, "Job archived");

        Ok(())
    }

    async fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, ActiveJobRow>(
            r#"
            SELECT id, created, running, settings, start_time, end_time
            FROM jobs
            ORDER BY created ASC, seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ActiveJobRow {
    id: Uuid,
    created: DateTime<Utc>,
    running: bool,
    settings: Json<Settings>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl From<ActiveJobRow> for Job {
    fn from(row: ActiveJobRow) -> Self {
        Job {
            id: row.id,
            settings: row.settings.0,
            created: row.created,
            running: row.running,
            start_time: row.start_time,
            end_time: row.end_time,
            archived: false,
            archive_reason: None,
            output: None,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ArchivedJobRow {
    id: Uuid,
    created: DateTime<Utc>,
    settings: Json<Settings>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    archive_reason: String,
    job_output: Option<String>,
}

impl TryFrom<ArchivedJobRow> for Job {
    type Error = StoreError;

    fn try_from(row: ArchivedJobRow) -> Result<Self, Self::Error> {
        let reason = row
            .archive_reason
            .parse::<ArchiveReason>()
            .map_err(|e| StoreError::Malformed(e.to_string()))?;

        Ok(Job {
            id: row.id,
            settings: row.settings.0,
            created: row.created,
            running: false,
            start_time: row.start_time,
            end_time: row.end_time,
            archived: true,
            archive_reason: Some(reason),
            output: row.job_output,
        })
    }
}
