//! Render service
//!
//! Turns a job's settings into an image by invoking the stable diffusion
//! build script, or by pretending to when mock jobs are enabled.

use async_trait::async_trait;
use easel_core::domain::job::{Job, Mode};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

const BUILD_SCRIPT: &str = "./build.sh";
const IMAGE_TO_IMAGE_STRENGTH: &str = "0.5";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("input image for job {0} not found at {1}")]
    MissingInputImage(uuid::Uuid, PathBuf),

    #[error("failed to start renderer: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("renderer io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("renderer exited with {0}")]
    Failed(std::process::ExitStatus),
}

/// Renderer trait
///
/// Runs one job to completion. Exclusive use of the rendering hardware is
/// the caller's responsibility.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Renders the job, returning the path of the produced artifact if any
    async fn render(&self, job: &Job) -> Result<Option<PathBuf>, RenderError>;
}

/// Renderer backed by the stable diffusion docker build script
pub struct StableDiffusionRenderer {
    stable_diffusion_path: PathBuf,
    image_upload_path: PathBuf,
    use_cpu: bool,
}

impl StableDiffusionRenderer {
    pub fn new(stable_diffusion_path: PathBuf, image_upload_path: PathBuf, use_cpu: bool) -> Self {
        Self {
            stable_diffusion_path,
            image_upload_path,
            use_cpu,
        }
    }

    /// Where the script writes the image for a job
    pub fn artifact_path(&self, job: &Job) -> PathBuf {
        self.stable_diffusion_path
            .join("output")
            .join(job.artifact_name())
    }

    fn input_image_path(&self, job: &Job) -> PathBuf {
        self.image_upload_path.join(job.id.to_string())
    }

    /// Arguments passed to the build script for a job
    pub fn command_args(&self, job: &Job) -> Vec<String> {
        let settings = &job.settings;
        let target = if self.use_cpu {
            "runWithoutGPUs"
        } else {
            "runWithGPUs"
        };

        let mut args = vec![target.to_string()];

        if settings.mode == Mode::ImageToImage {
            args.push("--image".to_string());
            args.push(self.input_image_path(job).to_string_lossy().into_owned());
            args.push("--strength".to_string());
            args.push(IMAGE_TO_IMAGE_STRENGTH.to_string());
        }

        args.extend([
            settings.prompt.clone(),
            "--n_iter".to_string(),
            settings.num_iterations.to_string(),
            "--output".to_string(),
            job.artifact_name(),
            "--W".to_string(),
            settings.width.to_string(),
            "--H".to_string(),
            settings.height.to_string(),
        ]);

        args
    }
}

#[async_trait]
impl Renderer for StableDiffusionRenderer {
    async fn render(&self, job: &Job) -> Result<Option<PathBuf>, RenderError> {
        if job.settings.mode == Mode::ImageToImage {
            let input = self.input_image_path(job);
            if !tokio::fs::try_exists(&input).await.unwrap_or(false) {
                return Err(RenderError::MissingInputImage(job.id, input));
            }
        }

        let args = self.command_args(job);
        info!(job_id = %job.id, ?args, "Running {}", BUILD_SCRIPT);

        let started = Instant::now();
        let mut child = Command::new(BUILD_SCRIPT)
            .args(&args)
            .current_dir(&self.stable_diffusion_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RenderError::Spawn)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (status, _, _) = tokio::join!(
            child.wait(),
            forward_lines(job.id, "stdout", stdout),
            forward_lines(job.id, "stderr", stderr),
        );

        let status = status?;
        if !status.success() {
            return Err(RenderError::Failed(status));
        }

        info!(job_id = %job.id, elapsed = ?started.elapsed(), "Render finished");
        Ok(Some(self.artifact_path(job)))
    }
}

async fn forward_lines<R>(job_id: uuid::Uuid, stream: &'static str, reader: Option<R>)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };

    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(job_id = %job_id, stream, "{}", line);
    }
}

/// Renderer that only waits, producing no artifact
pub struct MockRenderer {
    duration: Duration,
}

impl MockRenderer {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl Renderer for MockRenderer {
    async fn render(&self, job: &Job) -> Result<Option<PathBuf>, RenderError> {
        info!(job_id = %job.id, "Running mock job");
        tokio::time::sleep(self.duration).await;
        Ok(None)
    }
}

/// Checks that the render working directory looks usable
pub fn check_stable_diffusion_path(path: &Path) -> bool {
    path.join(BUILD_SCRIPT).is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_core::domain::job::Settings;

    fn renderer(use_cpu: bool) -> StableDiffusionRenderer {
        StableDiffusionRenderer::new(PathBuf::from("/sd"), PathBuf::from("/uploads"), use_cpu)
    }

    fn job(mode: Mode) -> Job {
        Job::new(Settings {
            prompt: "a red fox".to_string(),
            width: 256,
            height: 768,
            num_iterations: 4,
            mode,
        })
        .unwrap()
    }

    #[test]
    fn test_text_to_image_args() {
        let job = job(Mode::TextToImage);
        let args = renderer(false).command_args(&job);

        assert_eq!(
            args,
            vec![
                "runWithGPUs".to_string(),
                "a red fox".to_string(),
                "--n_iter".to_string(),
                "4".to_string(),
                "--output".to_string(),
                format!("{}.png", job.id),
                "--W".to_string(),
                "256".to_string(),
                "--H".to_string(),
                "768".to_string(),
            ]
        );
    }

    #[test]
    fn test_image_to_image_args() {
        let job = job(Mode::ImageToImage);
        let args = renderer(true).command_args(&job);

        assert_eq!(args[0], "runWithoutGPUs");
        assert_eq!(args[1], "--image");
        assert_eq!(args[2], format!("/uploads/{}", job.id));
        assert_eq!(args[3], "--strength");
        assert_eq!(args[4], "0.5");
        assert_eq!(args[5], "a red fox");
    }

    #[test]
    fn test_artifact_path() {
        let job = job(Mode::TextToImage);
        assert_eq!(
            renderer(false).artifact_path(&job),
            PathBuf::from(format!("/sd/output/{}.png", job.id))
        );
    }

    #[tokio::test]
    async fn test_missing_input_image_fails_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = StableDiffusionRenderer::new(
            dir.path().to_path_buf(),
            dir.path().join("input"),
            false,
        );

        let err = renderer.render(&job(Mode::ImageToImage)).await.unwrap_err();
        assert!(matches!(err, RenderError::MissingInputImage(..)));
    }

    #[tokio::test]
    async fn test_missing_script_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!check_stable_diffusion_path(dir.path()));

        let renderer =
            StableDiffusionRenderer::new(dir.path().to_path_buf(), dir.path().to_path_buf(), false);
        let err = renderer.render(&job(Mode::TextToImage)).await.unwrap_err();
        assert!(matches!(err, RenderError::Spawn(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_renderer_waits_without_artifact() {
        let renderer = MockRenderer::new(Duration::from_secs(3));
        let started = tokio::time::Instant::now();

        let artifact = renderer.render(&job(Mode::TextToImage)).await.unwrap();

        assert!(artifact.is_none());
        assert!(started.elapsed() >= Duration::from_secs(3));
    }
}
