//! Coordinator Module
//!
//! Serializes render jobs onto a single worker and multiplexes everything
//! else (submissions, status queries, completions, shutdown) through one
//! actor task.
//!
//! The worker and the actor share nothing but the store and the command
//! channel. Callers only ever hold a [`CoordinatorHandle`].

mod actor;
mod command;
mod handle;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use easel_core::domain::job::{DEFAULT_MAX_NUM_ITERATIONS, ValidationError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use actor::Actor;
pub use command::{Command, Completion, Outcome};
pub use handle::CoordinatorHandle;
pub use worker::{Worker, WorkerError};

use crate::repository::{JobStore, StoreError};
use crate::service::{Renderer, Uploader};
use crate::ws::ConnectionManager;

const COMMAND_QUEUE_CAPACITY: usize = 100;

/// Error type for coordinator requests
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("coordinator did not answer within {0:?}")]
    Timeout(Duration),

    #[error("coordinator is shutting down")]
    ShuttingDown,

    #[error("coordinator dropped the request")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub poll_interval: Duration,
    pub max_num_iterations: i32,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_num_iterations: DEFAULT_MAX_NUM_ITERATIONS,
        }
    }
}

/// A running coordinator: the handle callers use plus both task handles
pub struct Coordinator {
    pub handle: CoordinatorHandle,
    pub actor: JoinHandle<()>,
    pub worker: JoinHandle<Result<(), WorkerError>>,
}

/// Spawns the actor and the worker loop on the current runtime
pub fn spawn(
    store: Arc<dyn JobStore>,
    renderer: Arc<dyn Renderer>,
    uploader: Option<Arc<dyn Uploader>>,
    connections: Arc<ConnectionManager>,
    options: CoordinatorOptions,
) -> Coordinator {
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let (stop_tx, stop_rx) = watch::channel(false);

    let actor = Actor::new(
        store.clone(),
        uploader,
        connections.clone(),
        commands_rx,
        stop_tx,
    );
    let worker = Worker::new(
        store,
        renderer,
        connections,
        commands_tx.clone(),
        options.poll_interval,
        stop_rx,
    );

    Coordinator {
        handle: CoordinatorHandle::new(commands_tx, options.max_num_iterations),
        actor: tokio::spawn(actor.run()),
        worker: tokio::spawn(worker.run()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryJobStore;
    use crate::service::{MockRenderer, RenderError, UploadError};
    use async_trait::async_trait;
    use axum::extract::ws::Message;
    use chrono::{DateTime, Utc};
    use easel_core::domain::job::{ArchiveReason, Job, JobLookup, QueuePosition, Settings};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn new_job(prompt: &str) -> Job {
        Job::new(Settings::from_prompt(prompt)).unwrap()
    }

    fn options() -> CoordinatorOptions {
        CoordinatorOptions {
            poll_interval: Duration::from_millis(10),
            max_num_iterations: 50,
        }
    }

    async fn next_text(rx: &mut UnboundedReceiver<Message>) -> String {
        match rx.recv().await {
            Some(Message::Text(t)) => t.as_str().to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    /// Renderer that writes a fake image (or fails) and records what it ran
    #[derive(Default)]
    struct ScriptedRenderer {
        output_dir: Option<PathBuf>,
        fail: bool,
        rendered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Renderer for ScriptedRenderer {
        async fn render(&self, job: &Job) -> Result<Option<PathBuf>, RenderError> {
            self.rendered
                .lock()
                .unwrap()
                .push(job.settings.prompt.clone());

            if self.fail {
                return Err(RenderError::Io(std::io::Error::other("out of memory")));
            }

            match &self.output_dir {
                Some(dir) => {
                    let path = dir.join(job.artifact_name());
                    tokio::fs::write(&path, b"png").await?;
                    Ok(Some(path))
                }
                None => Ok(None),
            }
        }
    }

    #[derive(Default)]
    struct RecordingUploader {
        fail: bool,
        keys: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Uploader for RecordingUploader {
        async fn upload(&self, local_path: &Path, key: &str) -> Result<(), UploadError> {
            assert!(local_path.exists());
            if self.fail {
                return Err(UploadError::Request {
                    key: key.to_string(),
                    message: "access denied".to_string(),
                });
            }
            self.keys.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    /// Store whose queue is unreadable
    struct BrokenStore;

    #[async_trait]
    impl JobStore for BrokenStore {
        async fn add_job(&self, _job: &Job) -> Result<(), StoreError> {
            Ok(())
        }

        async fn get_next_job(&self) -> Result<Option<Job>, StoreError> {
            Err(StoreError::Malformed("connection lost".to_string()))
        }

        async fn get_job_by_uuid(&self, _id: Uuid) -> Result<Option<JobLookup>, StoreError> {
            Ok(None)
        }

        async fn archive_job(
            &self,
            _reason: ArchiveReason,
            id: Uuid,
            _end_time: DateTime<Utc>,
            _output: Option<String>,
        ) -> Result<(), StoreError> {
            Err(StoreError::UnexpectedRowCount { id, rows: 0 })
        }

        async fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError> {
            Ok(Vec::new())
        }
    }

    /// Actor without a worker, so queued jobs stay put
    fn actor_only(store: Arc<dyn JobStore>) -> (CoordinatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (stop_tx, _stop_rx) = watch::channel(false);
        let actor = Actor::new(store, None, Arc::new(ConnectionManager::new()), rx, stop_tx);
        (CoordinatorHandle::new(tx, 50), tokio::spawn(actor.run()))
    }

    #[tokio::test]
    async fn test_status_reports_queue_positions() {
        let (handle, _actor) = actor_only(Arc::new(MemoryJobStore::new()));
        let jobs = [new_job("hello"), new_job("hello2"), new_job("hello3")];

        for job in &jobs {
            handle.add_job(job.clone(), TIMEOUT).await.unwrap();
        }

        for (expected, job) in jobs.iter().enumerate() {
            let lookup = handle.get_job_status(job.id, TIMEOUT).await.unwrap();
            assert_eq!(lookup.position, QueuePosition::Queued(expected as u64));
            assert!(lookup.job.is_pending());
        }
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (handle, _actor) = actor_only(Arc::new(MemoryJobStore::new()));
        let id = Uuid::new_v4();

        let err = handle.get_job_status(id, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn test_add_job_enforces_iteration_limit() {
        let (handle, _actor) = actor_only(Arc::new(MemoryJobStore::new()));
        let mut settings = Settings::from_prompt("hello");
        settings.num_iterations = 51;
        let job = Job::new(settings).unwrap();

        let err = handle.add_job(job.clone(), TIMEOUT).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Validation(ValidationError::TooManyIterations { .. })
        ));

        let err = handle.get_job_status(job.id, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_store_error() {
        let (handle, _actor) = actor_only(Arc::new(MemoryJobStore::new()));
        let job = new_job("hello");

        handle.add_job(job.clone(), TIMEOUT).await.unwrap();
        let err = handle.add_job(job, TIMEOUT).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Store(StoreError::DuplicateKey(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_time_out_when_actor_is_stuck() {
        // Nobody reads this channel
        let (tx, _rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let handle = CoordinatorHandle::new(tx, 50);
        let timeout = Duration::from_secs(2);

        let err = handle
            .get_job_status(Uuid::new_v4(), timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Timeout(t) if t == timeout));

        let err = handle.add_job(new_job("hello"), timeout).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_closed_coordinator_reports_shutting_down() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = CoordinatorHandle::new(tx, 50);

        let err = handle.add_job(new_job("hello"), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::ShuttingDown));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_runs_to_done_and_notifies_subscribers() {
        let store = Arc::new(MemoryJobStore::new());
        let connections = Arc::new(ConnectionManager::new());
        let coordinator = spawn(
            store.clone(),
            Arc::new(MockRenderer::new(Duration::from_secs(3))),
            None,
            connections.clone(),
            CoordinatorOptions::default(),
        );

        let job = new_job("hello");
        let (conn, mut frames) = connections.add().await;
        connections.subscribe(conn, job.id).await;

        coordinator.handle.add_job(job.clone(), TIMEOUT).await.unwrap();

        assert_eq!(next_text(&mut frames).await, r#"{"job":"running"}"#);
        assert_eq!(next_text(&mut frames).await, r#"{"job":"done"}"#);

        let lookup = coordinator
            .handle
            .get_job_status(job.id, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(lookup.position, QueuePosition::Archived);
        assert!(lookup.job.is_done());
        assert!(lookup.job.start_time.is_some());
        assert!(lookup.job.end_time >= lookup.job.start_time);
        assert!(store.get_all_jobs().await.unwrap().is_empty());

        coordinator.handle.shutdown().await;
        coordinator.worker.await.unwrap().unwrap();
        coordinator.actor.await.unwrap();
    }

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let store = Arc::new(MemoryJobStore::new());
        let connections = Arc::new(ConnectionManager::new());
        let renderer = Arc::new(ScriptedRenderer::default());

        let (handle, _actor) = actor_only(store.clone());
        let jobs = [new_job("hello"), new_job("hello2"), new_job("hello3")];
        for job in &jobs {
            handle.add_job(job.clone(), TIMEOUT).await.unwrap();
        }
        let last = &jobs[2];

        let (conn, mut frames) = connections.add().await;
        connections.subscribe(conn, last.id).await;

        let coordinator = spawn(
            store.clone(),
            renderer.clone(),
            None,
            connections.clone(),
            options(),
        );

        assert_eq!(next_text(&mut frames).await, r#"{"job":"running"}"#);
        assert_eq!(next_text(&mut frames).await, r#"{"job":"done"}"#);
        assert_eq!(
            *renderer.rendered.lock().unwrap(),
            vec!["hello", "hello2", "hello3"]
        );

        coordinator.handle.shutdown().await;
        coordinator.worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_render_failure_archives_with_error() {
        let store = Arc::new(MemoryJobStore::new());
        let connections = Arc::new(ConnectionManager::new());
        let renderer = Arc::new(ScriptedRenderer {
            fail: true,
            ..Default::default()
        });
        let coordinator = spawn(
            store.clone(),
            renderer,
            None,
            connections.clone(),
            options(),
        );

        let job = new_job("hello");
        let (conn, mut frames) = connections.add().await;
        connections.subscribe(conn, job.id).await;
        coordinator.handle.add_job(job.clone(), TIMEOUT).await.unwrap();

        assert_eq!(next_text(&mut frames).await, r#"{"job":"running"}"#);
        assert_eq!(next_text(&mut frames).await, r#"{"job":"done"}"#);

        let lookup = store.get_job_by_uuid(job.id).await.unwrap().unwrap();
        assert_eq!(lookup.job.archive_reason, Some(ArchiveReason::Error));
        assert!(!lookup.job.is_done());
        assert!(lookup.job.output.unwrap().contains("out of memory"));

        coordinator.handle.shutdown().await;
        coordinator.worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_uploaded_artifact_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let connections = Arc::new(ConnectionManager::new());
        let uploader = Arc::new(RecordingUploader::default());
        let coordinator = spawn(
            store,
            Arc::new(ScriptedRenderer {
                output_dir: Some(dir.path().to_path_buf()),
                ..Default::default()
            }),
            Some(uploader.clone() as Arc<dyn Uploader>),
            connections.clone(),
            options(),
        );

        let job = new_job("hello");
        let (conn, mut frames) = connections.add().await;
        connections.subscribe(conn, job.id).await;
        coordinator.handle.add_job(job.clone(), TIMEOUT).await.unwrap();

        assert_eq!(next_text(&mut frames).await, r#"{"job":"running"}"#);
        assert_eq!(next_text(&mut frames).await, r#"{"job":"done"}"#);

        coordinator.handle.shutdown().await;
        coordinator.actor.await.unwrap();

        assert_eq!(*uploader.keys.lock().unwrap(), vec![job.artifact_name()]);
        assert!(!dir.path().join(job.artifact_name()).exists());
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let connections = Arc::new(ConnectionManager::new());
        let coordinator = spawn(
            store.clone(),
            Arc::new(ScriptedRenderer {
                output_dir: Some(dir.path().to_path_buf()),
                ..Default::default()
            }),
            Some(Arc::new(RecordingUploader {
                fail: true,
                ..Default::default()
            }) as Arc<dyn Uploader>),
            connections.clone(),
            options(),
        );

        let job = new_job("hello");
        let (conn, mut frames) = connections.add().await;
        connections.subscribe(conn, job.id).await;
        coordinator.handle.add_job(job.clone(), TIMEOUT).await.unwrap();

        assert_eq!(next_text(&mut frames).await, r#"{"job":"running"}"#);
        assert_eq!(next_text(&mut frames).await, r#"{"job":"done"}"#);

        assert!(dir.path().join(job.artifact_name()).exists());
        let lookup = store.get_job_by_uuid(job.id).await.unwrap().unwrap();
        assert!(lookup.job.is_done());

        coordinator.handle.shutdown().await;
        coordinator.worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_jobs_and_stops_worker() {
        let store = Arc::new(MemoryJobStore::new());
        let coordinator = spawn(
            store.clone(),
            Arc::new(ScriptedRenderer::default()),
            None,
            Arc::new(ConnectionManager::new()),
            options(),
        );

        coordinator.handle.shutdown().await;
        coordinator.worker.await.unwrap().unwrap();
        coordinator.actor.await.unwrap();

        let err = coordinator
            .handle
            .add_job(new_job("too late"), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ShuttingDown));
        assert!(store.get_all_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_stops_worker() {
        let coordinator = spawn(
            Arc::new(BrokenStore),
            Arc::new(ScriptedRenderer::default()),
            None,
            Arc::new(ConnectionManager::new()),
            options(),
        );

        let result = coordinator.worker.await.unwrap();
        assert!(matches!(result, Err(WorkerError::Store(_))));

        // The actor keeps answering
        let err = coordinator
            .handle
            .get_job_status(Uuid::new_v4(), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_resumes_job_left_running() {
        let store = Arc::new(MemoryJobStore::new());
        let pending = new_job("created first");
        let interrupted = new_job("interrupted");
        store.add_job(&pending).await.unwrap();
        store.add_job(&interrupted).await.unwrap();
        store.force_running(interrupted.id).await;

        let connections = Arc::new(ConnectionManager::new());
        let (conn, mut frames) = connections.add().await;
        connections.subscribe(conn, pending.id).await;

        let renderer = Arc::new(ScriptedRenderer::default());
        let coordinator = spawn(
            store.clone(),
            renderer.clone(),
            None,
            connections.clone(),
            options(),
        );

        assert_eq!(next_text(&mut frames).await, r#"{"job":"running"}"#);
        assert_eq!(next_text(&mut frames).await, r#"{"job":"done"}"#);
        assert_eq!(
            *renderer.rendered.lock().unwrap(),
            vec!["interrupted", "created first"]
        );

        coordinator.handle.shutdown().await;
        coordinator.worker.await.unwrap().unwrap();
    }
}
