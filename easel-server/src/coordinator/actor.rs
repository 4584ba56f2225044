//! Coordinator actor
//!
//! Single task owning the command channel. Completions, status queries,
//! submissions and shutdown are handled one at a time in arrival order, so
//! nothing in here needs a lock.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use easel_core::domain::job::{ArchiveReason, Job};
use easel_core::dto::ws::{JobUpdate, ServerFrame};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::CoordinatorError;
use super::command::{Command, Completion, Outcome};
use crate::repository::{JobStore, StoreError};
use crate::service::Uploader;
use crate::ws::{BroadcastError, ConnectionManager};

pub struct Actor {
    store: Arc<dyn JobStore>,
    uploader: Option<Arc<dyn Uploader>>,
    connections: Arc<ConnectionManager>,
    commands: mpsc::Receiver<Command>,
    stop_worker: watch::Sender<bool>,
    accepting: bool,
}

impl Actor {
    pub fn new(
        store: Arc<dyn JobStore>,
        uploader: Option<Arc<dyn Uploader>>,
        connections: Arc<ConnectionManager>,
        commands: mpsc::Receiver<Command>,
        stop_worker: watch::Sender<bool>,
    ) -> Self {
        Self {
            store,
            uploader,
            connections,
            commands,
            stop_worker,
            accepting: true,
        }
    }

    /// Runs until shutdown has been requested and the queue is drained, or
    /// every sender is gone
    pub async fn run(mut self) {
        info!("Coordinator started");

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::AddJob { job, reply } => {
                    let result = self.add_job(&job).await;
                    if reply.send(result).is_err() {
                        debug!(job_id = %job.id, "Submitter gave up before reply");
                    }
                }
                Command::StatusQuery { id, reply } => {
                    let result = self.store.get_job_by_uuid(id).await;
                    if let Err(e) = &result {
                        error!(job_id = %id, error = %e, "Status lookup failed");
                    }
                    if reply.send(result).is_err() {
                        debug!(job_id = %id, "Status caller gave up before reply");
                    }
                }
                Command::Completion {
                    completion,
                    archived,
                } => {
                    let id = completion.job.id;
                    let result = self.complete(completion).await;
                    if archived.send(result).is_err() {
                        debug!(job_id = %id, "Worker gone before archive ack");
                    }
                }
                Command::Shutdown => {
                    info!("Shutdown requested, closing coordinator queue");
                    self.accepting = false;
                    self.stop_worker.send_replace(true);
                    self.commands.close();
                }
            }
        }

        info!("Coordinator stopped");
    }

    async fn add_job(&self, job: &Job) -> Result<(), CoordinatorError> {
        if !self.accepting {
            return Err(CoordinatorError::ShuttingDown);
        }

        self.store.add_job(job).await?;
        info!(job_id = %job.id, prompt = %job.settings.prompt, "Job queued");
        Ok(())
    }

    async fn complete(&self, completion: Completion) -> Result<(), StoreError> {
        let reason = completion.reason();
        let Completion { job, outcome } = completion;
        let end_time = job.end_time.unwrap_or_else(Utc::now);

        let (artifact, output) = match outcome {
            Outcome::Done { artifact } => (artifact, None),
            Outcome::Failed { message } => (None, Some(message)),
        };

        if let Err(e) = self
            .store
            .archive_job(reason, job.id, end_time, output)
            .await
        {
            error!(job_id = %job.id, %reason, error = %e, "Failed to archive job");
            return Err(e);
        }
        info!(job_id = %job.id, %reason, "Job finished");

        let uploaded = match (&self.uploader, &artifact) {
            (Some(uploader), Some(path)) if reason == ArchiveReason::Done => {
                self.upload(uploader.as_ref(), &job, path).await
            }
            _ => false,
        };

        // Every completion reads as done on the wire; the reason is in the archive
        notify(&self.connections, &job, JobUpdate::Done).await;

        if let (true, Some(path)) = (uploaded, &artifact) {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(job_id = %job.id, path = %path.display(), error = %e, "Failed to remove local artifact");
            }
        }

        Ok(())
    }

    async fn upload(&self, uploader: &dyn Uploader, job: &Job, path: &Path) -> bool {
        match uploader.upload(path, &job.artifact_name()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Artifact upload failed");
                false
            }
        }
    }
}

/// Pushes a status frame to the job's subscribers; nobody listening is fine
pub(crate) async fn notify(connections: &ConnectionManager, job: &Job, update: JobUpdate) {
    match connections
        .broadcast(job.id, &ServerFrame::Job(update))
        .await
    {
        Ok(sent) => debug!(job_id = %job.id, ?update, sent, "Status broadcast"),
        Err(BroadcastError::NoSubscribers(_)) => {
            debug!(job_id = %job.id, ?update, "No subscribers for status update");
        }
    }
}
