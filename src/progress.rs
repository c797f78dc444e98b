//! Progress-callback trait for job lifecycle events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! push events as the orchestrator drives each job. Polling
//! [`crate::orchestrator::Orchestrator::progress`] or subscribing to
//! [`crate::stream::watch_progress`] gives the same information as a pull.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf2video::{PipelineConfig, PipelineProgressCallback, Stage};
//! use edgequake_pdf2video::job::JobId;
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct StageCounter {
//!     started: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for StageCounter {
//!     fn on_stage_start(&self, job_id: JobId, stage: Stage, resumed: bool) {
//!         self.started.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{job_id}: {stage} (resumed: {resumed})");
//!     }
//! }
//!
//! let counter = Arc::new(StageCounter { started: AtomicUsize::new(0) });
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn PipelineProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::artifact::ArtifactRef;
use crate::job::{JobId, JobStatus, Stage, StageAttempt};
use std::sync::Arc;

/// Called by the orchestrator as a job moves through its stages.
///
/// Implementations must be `Send + Sync`: every job runs on its own tokio
/// task, so events for different jobs may arrive concurrently. All methods
/// have no-op defaults.
pub trait PipelineProgressCallback: Send + Sync {
    /// A job was accepted and is waiting for a run slot.
    fn on_job_queued(&self, job_id: JobId) {
        let _ = job_id;
    }

    /// A stage is about to run.
    ///
    /// `resumed` is true when the job is being re-driven from persisted
    /// state.
    fn on_stage_start(&self, job_id: JobId, stage: Stage, resumed: bool) {
        let _ = (job_id, stage, resumed);
    }

    /// A stage was skipped because its artifact was already committed.
    fn on_stage_skipped(&self, job_id: JobId, stage: Stage) {
        let _ = (job_id, stage);
    }

    /// One attempt failed or timed out; the executor may still retry.
    fn on_attempt_failed(&self, job_id: JobId, attempt: &StageAttempt) {
        let _ = (job_id, attempt);
    }

    /// A stage committed its artifact.
    fn on_stage_complete(&self, job_id: JobId, stage: Stage, artifact: &ArtifactRef) {
        let _ = (job_id, stage, artifact);
    }

    /// The job reached a terminal status.
    fn on_job_finished(&self, job_id: JobId, status: JobStatus) {
        let _ = (job_id, status);
    }
}

/// Default when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
