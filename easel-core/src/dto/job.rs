//! Job DTOs for the HTTP API

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::{InvalidJobState, Job, JobLookup, JobStatus, Settings};

/// Request to submit a new render job
pub type CreateJob = Settings;

/// Response to a successful submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub id: Uuid,
}

/// Status report for a single job
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job: Job,
    pub status: JobStatus,
    /// Jobs ahead in the queue, -1 once archived
    pub position: i64,
    pub done: bool,
}

impl TryFrom<JobLookup> for JobStatusView {
    type Error = InvalidJobState;

    fn try_from(lookup: JobLookup) -> Result<Self, Self::Error> {
        let status = lookup.job.status()?;
        Ok(Self {
            done: lookup.job.is_done(),
            position: lookup.position.as_i64(),
            status,
            job: lookup.job,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::{ArchiveReason, QueuePosition};

    #[test]
    fn test_status_view_from_archived_lookup() {
        let mut job = Job::new(Settings::from_prompt("hello")).unwrap();
        job.archived = true;
        job.archive_reason = Some(ArchiveReason::Done);

        let view = JobStatusView::try_from(JobLookup {
            job,
            position: QueuePosition::Archived,
        })
        .unwrap();

        assert!(view.done);
        assert_eq!(view.position, -1);

        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(value["status"], "done");
        assert_eq!(value["position"], -1);
    }

    #[test]
    fn test_status_view_rejects_invalid_state() {
        let mut job = Job::new(Settings::from_prompt("hello")).unwrap();
        job.archived = true;

        let result = JobStatusView::try_from(JobLookup {
            job,
            position: QueuePosition::Archived,
        });
        assert!(result.is_err());
    }
}
