//! Job data model: identity, lifecycle status, stages and attempt history.
//!
//! A [`Job`] is the authoritative record of one PDF-to-video request. It
//! carries references to committed artifacts ([`ArtifactRef`]) but never the
//! payloads themselves, so snapshots stay small enough to clone on every
//! status poll and to persist after every transition.

use crate::artifact::ArtifactRef;
use crate::error::{ErrorKind, StageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

// ── Identity ─────────────────────────────────────────────────────────────

/// Unique, immutable job identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

// ── Stages ───────────────────────────────────────────────────────────────

/// One named, ordered step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Plan,
    Codegen,
    Render,
    Assemble,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 5] = [
        Stage::Extract,
        Stage::Plan,
        Stage::Codegen,
        Stage::Render,
        Stage::Assemble,
    ];

    /// 0-based position in [`Stage::ALL`].
    pub fn index(self) -> usize {
        match self {
            Stage::Extract => 0,
            Stage::Plan => 1,
            Stage::Codegen => 2,
            Stage::Render => 3,
            Stage::Assemble => 4,
        }
    }

    /// Directory / log name.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Plan => "plan",
            Stage::Codegen => "codegen",
            Stage::Render => "render",
            Stage::Assemble => "assemble",
        }
    }

    /// Present-tense description used in progress messages.
    pub fn activity(self) -> &'static str {
        match self {
            Stage::Extract => "Extracting text and figures",
            Stage::Plan => "Planning scenes",
            Stage::Codegen => "Generating animation code",
            Stage::Render => "Rendering scenes",
            Stage::Assemble => "Assembling final video",
        }
    }

    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Status ───────────────────────────────────────────────────────────────

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ── Failure record ───────────────────────────────────────────────────────

/// Structured failure recorded on a job that reached `Failed`.
///
/// `message` is already sanitised (see [`crate::status::sanitize_message`]);
/// it is safe to persist and to show to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl JobError {
    pub fn from_stage_error(stage: Stage, err: &StageError) -> Self {
        Self {
            stage,
            kind: err.kind(),
            message: crate::status::sanitize_message(err.message()),
            retryable: err.is_recoverable(),
        }
    }
}

// ── Attempts ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
}

/// Execution record of one try at one stage (or one scene of a stage).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAttempt {
    pub stage: Stage,
    /// 0-based scene index for per-scene stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene: Option<usize>,
    /// 1-based.
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// Sanitised failure description, or a short success note.
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

// ── Per-job options ──────────────────────────────────────────────────────

/// User options supplied with a submission. Persisted with the job so a
/// resumed run behaves like the original one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Overrides the configured LLM model for this job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Overrides the configured provider name for this job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
    /// Display title; falls back to the PDF metadata title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Audience hint handed to the planner, e.g. "first-year undergraduates".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

/// Accumulated LLM usage for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUsage {
    pub llm_calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl JobUsage {
    pub fn add(&mut self, other: JobUsage) {
        self.llm_calls += other.llm_calls;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Units of work finished inside a stage (scenes for Codegen/Render).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    pub done: usize,
    pub total: usize,
}

impl StageProgress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.done.min(self.total) as f64) / (self.total as f64)
        }
    }
}

// ── Job ──────────────────────────────────────────────────────────────────

/// One end-to-end request, tracked through a fixed state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub current_stage: Option<Stage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Latest committed artifact per stage.
    #[serde(default)]
    pub artifacts: BTreeMap<Stage, ArtifactRef>,
    #[serde(default)]
    pub attempts: Vec<StageAttempt>,
    #[serde(default)]
    pub stage_progress: BTreeMap<Stage, StageProgress>,
    /// Latest human-readable activity line.
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub options: JobOptions,
    #[serde(default)]
    pub usage: JobUsage,
    #[serde(default)]
    pub cancel_requested: bool,
    /// Stored copy of the submitted PDF.
    pub input: PathBuf,
}

impl Job {
    pub fn new(id: JobId, input: PathBuf, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Queued,
            current_stage: None,
            created_at: now,
            updated_at: now,
            error: None,
            artifacts: BTreeMap::new(),
            attempts: Vec::new(),
            stage_progress: BTreeMap::new(),
            message: "Waiting to start".to_string(),
            options,
            usage: JobUsage::default(),
            cancel_requested: false,
            input,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_committed(&self, stage: Stage) -> bool {
        self.artifacts.contains_key(&stage)
    }

    /// Attempts recorded for one stage (all scenes), in order.
    pub fn attempts_for(&self, stage: Stage) -> impl Iterator<Item = &StageAttempt> {
        self.attempts.iter().filter(move |a| a.stage == stage)
    }

    /// Raise the unit counter of a stage; counters never go down.
    pub fn advance_progress(&mut self, stage: Stage, done: usize, total: usize) {
        let entry = self.stage_progress.entry(stage).or_default();
        entry.total = entry.total.max(total);
        entry.done = entry.done.max(done).min(entry.total);
    }

    /// Path of the final video once the job has succeeded.
    pub fn final_video(&self) -> Option<&ArtifactRef> {
        match self.status {
            JobStatus::Succeeded => self.artifacts.get(&Stage::Assemble),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_is_fixed() {
        assert_eq!(Stage::Extract.next(), Some(Stage::Plan));
        assert_eq!(Stage::Render.next(), Some(Stage::Assemble));
        assert_eq!(Stage::Assemble.next(), None);
        for (i, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
    }

    #[test]
    fn job_id_round_trips_through_display() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().expect("valid uuid");
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn progress_counters_never_decrease() {
        let mut job = Job::new(JobId::new(), PathBuf::from("in.pdf"), JobOptions::default());
        job.advance_progress(Stage::Render, 3, 5);
        job.advance_progress(Stage::Render, 1, 5);
        let p = job.stage_progress[&Stage::Render];
        assert_eq!((p.done, p.total), (3, 5));
        assert!((p.fraction() - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn job_record_serialises_stage_keys() {
        let mut job = Job::new(JobId::new(), PathBuf::from("in.pdf"), JobOptions::default());
        job.advance_progress(Stage::Codegen, 1, 4);
        let json = serde_json::to_string(&job).expect("serialise");
        assert!(json.contains("\"codegen\""));
        let back: Job = serde_json::from_str(&json).expect("deserialise");
        assert_eq!(back, job);
    }
}
