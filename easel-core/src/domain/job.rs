//! Job domain types
//!
//! A job is one rendering request. It is created once with validated
//! settings and then moves through exactly three states:
//! pending -> running -> archived.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_WIDTH: i32 = 512;
pub const DEFAULT_HEIGHT: i32 = 512;
pub const DEFAULT_NUM_ITERATIONS: i32 = 1;
pub const DEFAULT_MAX_NUM_ITERATIONS: i32 = 50;

/// Rendering mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    TextToImage,
    ImageToImage,
}

/// Render settings supplied at submission time
///
/// Zero or negative numeric fields are replaced by defaults in [`Job::new`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub width: i32,
    #[serde(default)]
    pub height: i32,
    #[serde(default)]
    pub num_iterations: i32,
    #[serde(default)]
    pub mode: Mode,
}

impl Settings {
    /// Creates text-to-image settings for a prompt, everything else defaulted
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Checks the iteration count against a configured ceiling
    pub fn check_iteration_limit(&self, max: i32) -> Result<(), ValidationError> {
        if self.num_iterations > max {
            return Err(ValidationError::TooManyIterations {
                requested: self.num_iterations,
                max,
            });
        }
        Ok(())
    }
}

/// Image dimension named in validation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Width,
    Height,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Width => f.write_str("width"),
            Dimension::Height => f.write_str("height"),
        }
    }
}

/// Rejected job settings
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing prompt")]
    MissingPrompt,

    #[error("invalid {dimension} {value}: must be a multiple of 8")]
    InvalidDimension { dimension: Dimension, value: i32 },

    #[error("num iterations {requested} is too high (max {max})")]
    TooManyIterations { requested: i32, max: i32 },
}

/// Why a job left the active queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveReason {
    Done,
    Cancelled,
    Error,
}

impl ArchiveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveReason::Done => "done",
            ArchiveReason::Cancelled => "cancelled",
            ArchiveReason::Error => "error",
        }
    }
}

impl fmt::Display for ArchiveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown archive reason: {0}")]
pub struct UnknownArchiveReason(pub String);

impl FromStr for ArchiveReason {
    type Err = UnknownArchiveReason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "done" => Ok(ArchiveReason::Done),
            "cancelled" => Ok(ArchiveReason::Cancelled),
            "error" => Ok(ArchiveReason::Error),
            other => Err(UnknownArchiveReason(other.to_string())),
        }
    }
}

/// Lifecycle state derived from a job's flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Archived(ArchiveReason),
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => f.write_str("pending"),
            JobStatus::Running => f.write_str("running"),
            JobStatus::Archived(reason) => reason.fmt(f),
        }
    }
}

impl Serialize for JobStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A job whose flags do not describe exactly one lifecycle state
///
/// Only reachable through a bug in a store or hand-built values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "job {id} is in an invalid state (running={running}, archived={archived}, reason={reason:?})"
)]
pub struct InvalidJobState {
    pub id: Uuid,
    pub running: bool,
    pub archived: bool,
    pub reason: Option<ArchiveReason>,
}

/// Rendering job
///
/// Values handed out by stores are snapshots; the store stays the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub settings: Settings,
    pub created: DateTime<Utc>,
    pub running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub archived: bool,
    pub archive_reason: Option<ArchiveReason>,
    /// Free-text output recorded at archival (render error message)
    pub output: Option<String>,
}

impl Job {
    /// Validates settings and creates a pending job
    ///
    /// Non-positive width, height and iteration count fall back to
    /// [`DEFAULT_WIDTH`], [`DEFAULT_HEIGHT`] and [`DEFAULT_NUM_ITERATIONS`].
    /// Width and height must be multiples of 8.
    pub fn new(mut settings: Settings) -> Result<Self, ValidationError> {
        if settings.prompt.is_empty() {
            return Err(ValidationError::MissingPrompt);
        }

        if settings.num_iterations <= 0 {
            tracing::debug!("Using default num iterations {}", DEFAULT_NUM_ITERATIONS);
            settings.num_iterations = DEFAULT_NUM_ITERATIONS;
        }
        if settings.width <= 0 {
            tracing::debug!("Using default width {}", DEFAULT_WIDTH);
            settings.width = DEFAULT_WIDTH;
        }
        if settings.height <= 0 {
            tracing::debug!("Using default height {}", DEFAULT_HEIGHT);
            settings.height = DEFAULT_HEIGHT;
        }

        check_dimension(Dimension::Width, settings.width)?;
        check_dimension(Dimension::Height, settings.height)?;

        Ok(Self {
            id: Uuid::new_v4(),
            settings,
            created: Utc::now().trunc_subsecs(6),
            running: false,
            start_time: None,
            end_time: None,
            archived: false,
            archive_reason: None,
            output: None,
        })
    }

    pub fn is_pending(&self) -> bool {
        !self.archived && !self.running
    }

    /// Derives the lifecycle state from the running/archived flags
    pub fn status(&self) -> Result<JobStatus, InvalidJobState> {
        match (self.running, self.archived, self.archive_reason) {
            (true, false, None) => Ok(JobStatus::Running),
            (false, false, None) => Ok(JobStatus::Pending),
            (false, true, Some(reason)) => Ok(JobStatus::Archived(reason)),
            (running, archived, reason) => Err(InvalidJobState {
                id: self.id,
                running,
                archived,
                reason,
            }),
        }
    }

    pub fn is_done(&self) -> bool {
        self.archived && self.archive_reason == Some(ArchiveReason::Done)
    }

    /// File name of the rendered image for this job
    pub fn artifact_name(&self) -> String {
        format!("{}.png", self.id)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self
            .status()
            .map(|s| s.to_string())
            .unwrap_or_else(|_| "invalid".to_string());
        write!(
            f,
            "{} ({}) '{}' created {}",
            self.id, status, self.settings.prompt, self.created
        )
    }
}

fn check_dimension(dimension: Dimension, value: i32) -> Result<(), ValidationError> {
    if value % 8 != 0 {
        return Err(ValidationError::InvalidDimension { dimension, value });
    }
    Ok(())
}

/// Place of a job in the queue
///
/// `Queued(n)` counts active jobs created before this one, whether or not this
/// job is already running. `Archived` is reported as -1 on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePosition {
    Queued(u64),
    Archived,
}

impl QueuePosition {
    pub fn as_i64(&self) -> i64 {
        match self {
            QueuePosition::Queued(n) => *n as i64,
            QueuePosition::Archived => -1,
        }
    }
}

impl Serialize for QueuePosition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_i64())
    }
}

/// Result of looking a job up by id across the active and archive sets
#[derive(Debug, Clone, PartialEq)]
pub struct JobLookup {
    pub job: Job,
    pub position: QueuePosition,
}
