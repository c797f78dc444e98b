//! # edgequake-pdf2video
//!
//! Turn a STEM paper (PDF) into a narrated explainer video.
//!
//! A job runs through five fixed stages. Each stage hands a durable,
//! versioned artifact to the next one, so a failed or interrupted job can
//! be resumed without redoing the work that already succeeded.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Extract   page text + embedded figures via pdfium (spawn_blocking)
//!  ├─ 2. Plan      LLM turns the paper into 3-7 ordered scenes
//!  ├─ 3. Codegen   LLM writes animation code + narration, one call per scene
//!  ├─ 4. Render    renderer subprocess per scene (manim by default)
//!  └─ 5. Assemble  ffmpeg concatenates the segments in scene order
//! ```
//!
//! Around the stages sit the [`store::ArtifactStore`] (write-once artifact
//! versions on disk), the [`executor::StageExecutor`] (timeouts, retries,
//! backoff, error classification), the [`registry::JobRegistry`] (live job
//! snapshots), and the [`orchestrator::Orchestrator`] that drives it all.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2video::{JobOptions, Orchestrator, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = PipelineConfig::builder().store_dir("./jobs").build()?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!
//!     let job_id = orchestrator
//!         .submit_path("paper.pdf", JobOptions::default())
//!         .await?;
//!     let job = orchestrator.wait(job_id).await?;
//!     match job.final_video() {
//!         Some(video) => println!("video record: {}", video.location.display()),
//!         None => eprintln!("job ended as {}: {:?}", job.status, job.error),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature   | Default | Description |
//! |-----------|---------|-------------|
//! | `cli`     | on      | Enables the `pdf2video` binary (clap + anyhow + indicatif + tracing-subscriber) |
//! | `bundled` | off     | Embeds the pdfium shared library in the binary |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-pdf2video = { version = "0.1", default-features = false }
//! ```
//!
//! ## External tools
//!
//! The default Render and Assemble collaborators shell out to `manim` and
//! `ffmpeg`. Both commands are configurable, and every collaborator can be
//! replaced through [`PipelineConfigBuilder`].

// ── Modules ──────────────────────────────────────────────────────────────

pub mod artifact;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod registry;
pub mod status;
pub mod store;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use artifact::{ArtifactRef, ExtractedDocument, FinalVideo, SceneCode, ScenePlan};
pub use config::{PipelineConfig, PipelineConfigBuilder, RenderQuality, StagePolicies, StagePolicy};
pub use error::{ErrorKind, Pdf2VideoError, StageError};
pub use job::{Job, JobError, JobId, JobOptions, JobStatus, Stage};
pub use orchestrator::Orchestrator;
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use status::{ProgressView, StageWeights};
pub use stream::{watch_progress, ProgressStream};
