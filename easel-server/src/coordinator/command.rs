use std::path::PathBuf;

use easel_core::domain::job::{ArchiveReason, Job, JobLookup};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::CoordinatorError;
use crate::repository::StoreError;

/// Everything the actor can be asked to do, processed strictly in order
#[derive(Debug)]
pub enum Command {
    AddJob {
        job: Job,
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    Completion {
        completion: Completion,
        /// Resolved once the archive attempt is over
        archived: oneshot::Sender<Result<(), StoreError>>,
    },
    StatusQuery {
        id: Uuid,
        reply: oneshot::Sender<Result<Option<JobLookup>, StoreError>>,
    },
    Shutdown,
}

/// How a render ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done { artifact: Option<PathBuf> },
    Failed { message: String },
}

/// A rendered (or failed) job handed from the worker to the actor
#[derive(Debug, Clone)]
pub struct Completion {
    /// Snapshot with start and end time filled in
    pub job: Job,
    pub outcome: Outcome,
}

impl Completion {
    pub fn reason(&self) -> ArchiveReason {
        match self.outcome {
            Outcome::Done { .. } => ArchiveReason::Done,
            Outcome::Failed { .. } => ArchiveReason::Error,
        }
    }
}
