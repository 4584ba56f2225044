//! Repository Module
//!
//! Durable queue and archive of render jobs.
//!
//! The [`JobStore`] trait is the single source of truth for job state. Every
//! operation is atomic with respect to concurrent callers, so the claim in
//! [`JobStore::get_next_job`] stays correct even with more than one worker.

pub mod job;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use easel_core::domain::job::{ArchiveReason, Job, JobLookup};
use thiserror::Error;
use uuid::Uuid;

pub use job::PgJobStore;
pub use memory::MemoryJobStore;

/// Store error type
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} already exists")]
    DuplicateKey(Uuid),

    #[error("archiving job {id} affected {rows} rows, expected exactly 1")]
    UnexpectedRowCount { id: Uuid, rows: u64 },

    #[error("stored job is malformed: {0}")]
    Malformed(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persistent queue of active jobs plus the archive of finished ones
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a pending job into the active set
    ///
    /// Fails with [`StoreError::DuplicateKey`] if the id is already active.
    async fn add_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Returns the job the worker should run next
    ///
    /// A job already marked running is returned first (earliest created), so a
    /// restarted process resumes in-flight work. Otherwise the earliest pending
    /// job is claimed: flipped to running with `start_time = now` in one
    /// conditional write. `None` when the active set is empty.
    async fn get_next_job(&self) -> Result<Option<Job>, StoreError>;

    /// Looks a job up in the active set, then in the archive
    ///
    /// Active jobs report how many active jobs were created before them;
    /// archived jobs report [`QueuePosition::Archived`](easel_core::domain::job::QueuePosition).
    async fn get_job_by_uuid(&self, id: Uuid) -> Result<Option<JobLookup>, StoreError>;

    /// Moves a job from the active set into the archive
    ///
    /// Fails unless exactly one row moved, which catches vanished jobs and
    /// double archival.
    async fn archive_job(
        &self,
        reason: ArchiveReason,
        id: Uuid,
        end_time: DateTime<Utc>,
        output: Option<String>,
    ) -> Result<(), StoreError>;

    /// Every active job in queue order
    async fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError>;
}
