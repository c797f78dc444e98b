//! Error types for the edgequake-pdf2video library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`Pdf2VideoError`], **API / infrastructure**: the caller asked for a
//!   job that does not exist, the artifact store could not be written, the
//!   submitted file is not a PDF. Returned as `Err(Pdf2VideoError)` from the
//!   [`crate::orchestrator::Orchestrator`] and [`crate::store::ArtifactStore`]
//!   methods.
//!
//! * [`StageError`], **Stage outcome**: one attempt at one pipeline stage
//!   failed. The Stage Executor decides from its [`ErrorKind`] whether to
//!   retry or escalate, and the orchestrator records the final one on the
//!   job as a [`crate::job::JobError`]. A failed stage never becomes an
//!   `Err` of the public API; callers observe it through the job status.

use crate::job::{JobId, JobStatus, Stage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All API and infrastructure errors returned by the library.
#[derive(Debug, Error)]
pub enum Pdf2VideoError {
    // ── Job errors ────────────────────────────────────────────────────────
    /// No job with this id is known to the registry or the store.
    #[error("Job {job_id} not found")]
    JobNotFound { job_id: JobId },

    /// `resume` was called on a job that cannot be driven again.
    #[error("Job {job_id} cannot be resumed from status {status:?}")]
    JobNotResumable { job_id: JobId, status: JobStatus },

    // ── Artifact errors ───────────────────────────────────────────────────
    /// No committed artifact exists for this slot.
    #[error("No artifact for job {job_id}, stage {stage}{}", scene_suffix(.scene))]
    ArtifactNotFound {
        job_id: JobId,
        stage: Stage,
        scene: Option<usize>,
    },

    /// The exact artifact version already exists; artifacts are write-once.
    #[error("Artifact {stage}{} v{version} of job {job_id} already exists", scene_suffix(.scene))]
    Conflict {
        job_id: JobId,
        stage: Stage,
        scene: Option<usize>,
        version: u32,
    },

    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The submitted bytes are not a PDF.
    #[error("Input '{source_name}' is not a valid PDF\nFirst bytes: {magic:?}")]
    NotAPdf { source_name: String, magic: Vec<u8> },

    // ── Store errors ──────────────────────────────────────────────────────
    /// Reading or writing the artifact store failed.
    #[error("Artifact store I/O failed at '{path}': {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted record could not be (de)serialised.
    #[error("Corrupt record at '{path}': {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn scene_suffix(scene: &Option<usize>) -> String {
    match scene {
        Some(idx) => format!(" (scene {})", idx + 1),
        None => String::new(),
    }
}

/// Failure class of a stage attempt, as exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Output (or input) did not satisfy the stage schema.
    ValidationError,
    /// Timeouts, rate limits, transient process failures.
    TransientError,
    /// Invalid or missing API key.
    AuthError,
    /// Corrupt PDF or unsupported format.
    FatalInputError,
    /// Renderer or host failure unrelated to generated code.
    ResourceError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::TransientError => "TransientError",
            ErrorKind::AuthError => "AuthError",
            ErrorKind::FatalInputError => "FatalInputError",
            ErrorKind::ResourceError => "ResourceError",
        };
        f.write_str(s)
    }
}

/// Outcome of one failed stage attempt.
///
/// Collaborators (extractor, planner, code generator, renderer, assembler)
/// return this; the Stage Executor classifies it with
/// [`StageError::is_recoverable`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum StageError {
    /// Output failed the stage schema. `recoverable == false` marks output
    /// that cannot be fixed by asking again (e.g. unparseable code).
    #[error("validation failed: {message}")]
    Validation { message: String, recoverable: bool },

    /// Timeout, rate limit, network blip.
    #[error("transient failure: {message}")]
    Transient { message: String },

    /// Provider rejected the credentials.
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// The input document itself is unusable.
    #[error("unusable input: {message}")]
    FatalInput { message: String },

    /// Renderer crash, out-of-memory, missing tool.
    #[error("resource failure: {message}")]
    Resource { message: String },
}

impl StageError {
    pub fn validation(message: impl Into<String>) -> Self {
        StageError::Validation {
            message: message.into(),
            recoverable: true,
        }
    }

    /// A validation failure that asking again will not fix.
    pub fn invalid(message: impl Into<String>) -> Self {
        StageError::Validation {
            message: message.into(),
            recoverable: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        StageError::Transient {
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        StageError::Auth {
            message: message.into(),
        }
    }

    pub fn fatal_input(message: impl Into<String>) -> Self {
        StageError::FatalInput {
            message: message.into(),
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        StageError::Resource {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Validation { .. } => ErrorKind::ValidationError,
            StageError::Transient { .. } => ErrorKind::TransientError,
            StageError::Auth { .. } => ErrorKind::AuthError,
            StageError::FatalInput { .. } => ErrorKind::FatalInputError,
            StageError::Resource { .. } => ErrorKind::ResourceError,
        }
    }

    /// Whether the Stage Executor may spend another attempt on this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            StageError::Validation { recoverable, .. } => *recoverable,
            StageError::Transient { .. } | StageError::Resource { .. } => true,
            StageError::Auth { .. } | StageError::FatalInput { .. } => false,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StageError::Validation { message, .. }
            | StageError::Transient { message }
            | StageError::Auth { message }
            | StageError::FatalInput { message }
            | StageError::Resource { message } => message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_not_found_display_names_scene() {
        let e = Pdf2VideoError::ArtifactNotFound {
            job_id: JobId::new(),
            stage: Stage::Render,
            scene: Some(2),
        };
        let msg = e.to_string();
        assert!(msg.contains("render"), "got: {msg}");
        assert!(msg.contains("scene 3"), "got: {msg}");
    }

    #[test]
    fn conflict_display_without_scene() {
        let e = Pdf2VideoError::Conflict {
            job_id: JobId::new(),
            stage: Stage::Plan,
            scene: None,
            version: 2,
        };
        let msg = e.to_string();
        assert!(msg.contains("plan v2"), "got: {msg}");
        assert!(!msg.contains("scene"));
    }

    #[test]
    fn recoverability_follows_taxonomy() {
        assert!(StageError::validation("2 scenes").is_recoverable());
        assert!(!StageError::invalid("unbalanced brackets").is_recoverable());
        assert!(StageError::transient("429").is_recoverable());
        assert!(StageError::resource("renderer crashed").is_recoverable());
        assert!(!StageError::auth("invalid key").is_recoverable());
        assert!(!StageError::fatal_input("corrupt xref").is_recoverable());
    }

    #[test]
    fn kind_maps_every_variant() {
        assert_eq!(StageError::auth("x").kind(), ErrorKind::AuthError);
        assert_eq!(StageError::invalid("x").kind(), ErrorKind::ValidationError);
        assert_eq!(
            StageError::fatal_input("x").kind(),
            ErrorKind::FatalInputError
        );
        assert_eq!(ErrorKind::ResourceError.to_string(), "ResourceError");
    }
}
