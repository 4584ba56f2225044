//! Easel Server
//!
//! Queues image rendering jobs, runs them one at a time on the local
//! stable diffusion setup and pushes status updates to WebSocket observers.
//!
//! Architecture:
//! - Configuration: environment (and `.env`) with defaults
//! - Repository: Postgres queue and archive of jobs
//! - Services: renderer and optional S3 uploader
//! - Coordinator: worker loop plus the actor that serializes everything else
//! - API: JSON endpoints and the WebSocket upgrade

use anyhow::{Context, Result};
use std::future::IntoFuture;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use easel_server::api::{self, AppState};
use easel_server::config::Config;
use easel_server::coordinator::{self, Coordinator, CoordinatorOptions};
use easel_server::db;
use easel_server::repository::{JobStore, PgJobStore};
use easel_server::service::{
    MockRenderer, Renderer, S3Uploader, StableDiffusionRenderer, Uploader,
    check_stable_diffusion_path,
};
use easel_server::ws::ConnectionManager;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "easel_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Easel Server...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url)
        .await
        .context("Failed to create database pool")?;
    info!("Database connection pool created");

    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));
    let renderer = build_renderer(&config);
    let uploader: Option<Arc<dyn Uploader>> = if config.use_s3 {
        info!(bucket = %config.s3.bucket, region = %config.s3.region, "S3 uploads enabled");
        Some(Arc::new(S3Uploader::new(&config.s3).await))
    } else {
        None
    };
    let connections = Arc::new(ConnectionManager::new());

    let Coordinator {
        handle,
        actor,
        mut worker,
    } = coordinator::spawn(
        store,
        renderer,
        uploader,
        connections.clone(),
        CoordinatorOptions {
            poll_interval: config.poll_interval,
            max_num_iterations: config.max_num_iterations,
        },
    );

    let app = api::create_router(AppState {
        coordinator: handle.clone(),
        connections: connections.clone(),
        request_timeout: config.request_timeout,
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    info!("Listening on {}", config.bind_addr);

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .into_future();

    // The worker only ends on its own when it can no longer dequeue
    tokio::select! {
        result = server => {
            result.context("Server error")?;
        }
        result = &mut worker => {
            connections.shutdown_all().await;
            return match result {
                Ok(Err(e)) => {
                    error!(error = %e, "Worker failed, shutting down");
                    Err(e).context("Worker failed")
                }
                Ok(Ok(())) => anyhow::bail!("Worker stopped unexpectedly"),
                Err(e) => Err(e).context("Worker task panicked"),
            };
        }
    }

    info!("Server stopped, shutting down coordinator");
    handle.shutdown().await;
    connections.shutdown_all().await;

    if actor.await.is_err() {
        warn!("Coordinator task panicked");
    }
    match worker.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Worker failed during shutdown"),
        Err(e) => warn!(error = %e, "Worker task panicked"),
    }

    info!("Shutdown complete");
    Ok(())
}

fn build_renderer(config: &Config) -> Arc<dyn Renderer> {
    if config.mock_jobs {
        info!(duration = ?config.mock_job_duration, "Using mock renderer");
        return Arc::new(MockRenderer::new(config.mock_job_duration));
    }

    if !check_stable_diffusion_path(&config.stable_diffusion_path) {
        warn!(
            path = %config.stable_diffusion_path.display(),
            "build.sh not found, renders will fail"
        );
    }
    info!(
        path = %config.stable_diffusion_path.display(),
        use_cpu = config.use_cpu,
        "Using stable diffusion renderer"
    );

    Arc::new(StableDiffusionRenderer::new(
        config.stable_diffusion_path.clone(),
        config.image_upload_path.clone(),
        config.use_cpu,
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C, starting graceful shutdown"),
        () = terminate => info!("Received SIGTERM, starting graceful shutdown"),
    }
}
