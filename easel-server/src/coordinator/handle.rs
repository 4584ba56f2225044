use std::time::Duration;

use easel_core::domain::job::{Job, JobLookup};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::CoordinatorError;
use super::command::Command;

/// Cloneable front door to the coordinator actor
///
/// Every request carries its own deadline. A caller that times out drops its
/// reply receiver; the actor's late reply is discarded.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    max_num_iterations: i32,
}

impl CoordinatorHandle {
    pub fn new(commands: mpsc::Sender<Command>, max_num_iterations: i32) -> Self {
        Self {
            commands,
            max_num_iterations,
        }
    }

    /// Queues a validated job for rendering
    pub async fn add_job(&self, job: Job, timeout: Duration) -> Result<(), CoordinatorError> {
        job.settings.check_iteration_limit(self.max_num_iterations)?;

        let (reply, response) = oneshot::channel();
        let request = async {
            self.commands
                .send(Command::AddJob { job, reply })
                .await
                .map_err(|_| CoordinatorError::ShuttingDown)?;
            response.await.map_err(|_| CoordinatorError::Closed)?
        };

        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| CoordinatorError::Timeout(timeout))?
    }

    /// Looks a job up, with its queue position
    pub async fn get_job_status(
        &self,
        id: Uuid,
        timeout: Duration,
    ) -> Result<JobLookup, CoordinatorError> {
        let (reply, response) = oneshot::channel();
        let request = async {
            self.commands
                .send(Command::StatusQuery { id, reply })
                .await
                .map_err(|_| CoordinatorError::ShuttingDown)?;
            let lookup = response.await.map_err(|_| CoordinatorError::Closed)??;
            lookup.ok_or(CoordinatorError::NotFound(id))
        };

        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| CoordinatorError::Timeout(timeout))?
    }

    /// Asks the actor to stop accepting jobs and stop the worker
    ///
    /// Returns immediately; a coordinator that is already gone is not an error.
    pub async fn shutdown(&self) {
        if self.commands.send(Command::Shutdown).await.is_err() {
            tracing::debug!("Coordinator already stopped");
        }
    }
}
