//! In-memory job store
//!
//! Same semantics as [`PgJobStore`](super::PgJobStore), held behind one async
//! mutex so every operation is atomic. Nothing survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use easel_core::domain::job::{ArchiveReason, Job, JobLookup, QueuePosition};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{JobStore, StoreError};

struct ActiveRow {
    seq: u64,
    job: Job,
}

impl ActiveRow {
    fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.job.created, self.seq)
    }
}

#[derive(Default)]
struct State {
    active: Vec<ActiveRow>,
    archive: HashMap<Uuid, Job>,
    next_seq: u64,
}

impl State {
    fn earliest<'a>(&'a mut self, pred: impl Fn(&Job) -> bool) -> Option<&'a mut ActiveRow> {
        self.active
            .iter_mut()
            .filter(|row| pred(&row.job))
            .min_by_key(|row| row.order_key())
    }
}

/// Job store kept entirely in process memory
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<State>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flips an active job to running without going through a claim
    #[cfg(test)]
    pub(crate) async fn force_running(&self, id: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(row) = state.active.iter_mut().find(|row| row.job.id == id) {
            row.job.running = true;
            row.job.start_time = Some(Utc::now());
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn add_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;

        if state.archive.contains_key(&job.id)
            || state.active.iter().any(|row| row.job.id == job.id)
        {
            return Err(StoreError::DuplicateKey(job.id));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.active.push(ActiveRow {
            seq,
            job: Job {
                running: false,
                start_time: None,
                end_time: None,
                archived: false,
                archive_reason: None,
                output: None,
                ..job.clone()
            },
        });

        Ok(())
    }

    async fn get_next_job(&self) -> Result<Option<Job>, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(row) = state.earliest(|job| job.running) {
            return Ok(Some(row.job.clone()));
        }

        Ok(state.earliest(|job| !job.running).map(|row| {
            row.job.running = true;
            row.job.start_time = Some(Utc::now());
            row.job.clone()
        }))
    }

    async fn get_job_by_uuid(&self, id: Uuid) -> Result<Option<JobLookup>, StoreError> {
        let state = self.state.lock().await;

        if let Some(row) = state.active.iter().find(|row| row.job.id == id) {
            let key = row.order_key();
            let ahead = state
                .active
                .iter()
                .filter(|other| other.order_key() < key)
                .count();

            return Ok(Some(JobLookup {
                job: row.job.clone(),
                position: QueuePosition::Queued(ahead as u64),
            }));
        }

        Ok(state.archive.get(&id).map(|job| JobLookup {
            job: job.clone(),
            position: QueuePosition::Archived,
        }))
    }

    async fn archive_job(
        &self,
        reason: ArchiveReason,
        id: Uuid,
        end_time: DateTime<Utc>,
        output: Option<String>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;

        let Some(index) = state.active.iter().position(|row| row.job.id == id) else {
            return Err(StoreError::UnexpectedRowCount { id, rows: 0 });
        };

        let row = state.active.remove(index);
        state.archive.insert(
            id,
            Job {
                running: false,
                end_time: Some(end_time),
                archived: true,
                archive_reason: Some(reason),
                output,
                ..row.job
            },
        );

        Ok(())
    }

    async fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;

        let mut rows: Vec<&ActiveRow> = state.active.iter().collect();
        rows.sort_by_key(|row| row.order_key());

        Ok(rows.into_iter().map(|row| row.job.clone()).collect())
    }
}
