//! Worker loop
//!
//! Runs one job at a time: claim from the store, render, hand the result to
//! the actor and wait for it to be archived before claiming the next one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use easel_core::domain::job::Job;
use easel_core::dto::ws::JobUpdate;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

use super::actor::notify;
use super::command::{Command, Completion, Outcome};
use crate::repository::{JobStore, StoreError};
use crate::service::Renderer;
use crate::ws::ConnectionManager;

/// Unrecoverable worker failure; no further jobs are dequeued after it
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to fetch next job: {0}")]
    Store(#[from] StoreError),
}

pub struct Worker {
    store: Arc<dyn JobStore>,
    renderer: Arc<dyn Renderer>,
    connections: Arc<ConnectionManager>,
    commands: mpsc::Sender<Command>,
    poll_interval: Duration,
    stop: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        renderer: Arc<dyn Renderer>,
        connections: Arc<ConnectionManager>,
        commands: mpsc::Sender<Command>,
        poll_interval: Duration,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            renderer,
            connections,
            commands,
            poll_interval,
            stop,
        }
    }

    pub async fn run(mut self) -> Result<(), WorkerError> {
        info!(poll_interval = ?self.poll_interval, "Worker started");

        while !*self.stop.borrow() {
            let job = match self.store.get_next_job().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    if !self.idle().await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Store failure while fetching next job, worker stopping");
                    return Err(e.into());
                }
            };

            let completion = self.execute(job).await;
            let job_id = completion.job.id;

            let (archived_tx, archived_rx) = oneshot::channel();
            let handed_off = self
                .commands
                .send(Command::Completion {
                    completion,
                    archived: archived_tx,
                })
                .await;
            if handed_off.is_err() {
                warn!(job_id = %job_id, "Coordinator closed, job stays running until restart");
                break;
            }

            match archived_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    // Still running in the store, so the next claim retries it
                    if !self.idle().await {
                        break;
                    }
                }
                Err(_) => {
                    warn!(job_id = %job_id, "Coordinator dropped completion");
                    break;
                }
            }
        }

        info!("Worker stopped");
        Ok(())
    }

    /// Sleeps one poll interval; returns false if the worker should stop
    async fn idle(&mut self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => true,
            changed = self.stop.changed() => changed.is_ok() && !*self.stop.borrow(),
        }
    }

    async fn execute(&self, mut job: Job) -> Completion {
        notify(&self.connections, &job, JobUpdate::Running).await;

        job.start_time = Some(Utc::now());
        info!(job_id = %job.id, mode = ?job.settings.mode, "Running job");

        let outcome = match self.renderer.render(&job).await {
            Ok(artifact) => Outcome::Done { artifact },
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Render failed");
                Outcome::Failed {
                    message: e.to_string(),
                }
            }
        };

        job.end_time = Some(Utc::now());
        Completion { job, outcome }
    }
}
