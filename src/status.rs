//! Status reporter: pure mapping from a [`Job`] snapshot to the client view.
//!
//! ## Percent
//!
//! Each stage owns a fixed share of the bar (10/15/25/40/10 by default).
//! A committed stage contributes its whole weight; an uncommitted stage
//! contributes `weight × done / total` from its unit counter (scenes for
//! Codegen and Render). Both inputs only grow, so the percent never goes
//! backwards for a given job. Anything short of `Succeeded` is capped at 99.

use crate::error::ErrorKind;
use crate::job::{Job, JobId, JobStatus, Stage};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Upper bound on client-visible error detail.
const MAX_MESSAGE_CHARS: usize = 200;

/// Shown instead of a provider error body that carries no usable message.
const PAYLOAD_PLACEHOLDER: &str = "provider returned an error payload";

/// Relative share of the progress bar per stage, in [`Stage::ALL`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageWeights(pub [u32; 5]);

impl Default for StageWeights {
    fn default() -> Self {
        Self([10, 15, 25, 40, 10])
    }
}

impl StageWeights {
    pub fn weight(&self, stage: Stage) -> u32 {
        self.0[stage.index()]
    }

    fn total(&self) -> u32 {
        self.0.iter().sum()
    }
}

/// What a client sees when it polls a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub stage: Option<Stage>,
    pub percent: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Render the progress view of a job with the default weights.
pub fn render(job: &Job) -> ProgressView {
    render_with(job, &StageWeights::default())
}

pub fn render_with(job: &Job, weights: &StageWeights) -> ProgressView {
    let (error_kind, error_message) = match (&job.status, &job.error) {
        (JobStatus::Failed, Some(err)) => (Some(err.kind), Some(sanitize_message(&err.message))),
        _ => (None, None),
    };

    ProgressView {
        job_id: job.id,
        status: job.status,
        stage: job.current_stage,
        percent: percent(job, weights),
        message: status_message(job),
        error_kind,
        error_message,
        updated_at: job.updated_at,
    }
}

fn percent(job: &Job, weights: &StageWeights) -> u8 {
    if job.status == JobStatus::Succeeded {
        return 100;
    }
    let total = f64::from(weights.total().max(1));
    let earned: f64 = Stage::ALL
        .iter()
        .map(|&stage| {
            let w = f64::from(weights.weight(stage));
            if job.is_committed(stage) {
                w
            } else {
                job.stage_progress
                    .get(&stage)
                    .map(|p| w * p.fraction())
                    .unwrap_or(0.0)
            }
        })
        .sum();
    ((earned / total) * 100.0).floor().clamp(0.0, 99.0) as u8
}

fn status_message(job: &Job) -> String {
    match (job.status, &job.error) {
        (JobStatus::Failed, Some(err)) => format!(
            "Failed during {} ({})",
            err.stage.activity().to_lowercase(),
            err.kind
        ),
        (JobStatus::Succeeded, _) => "Video ready".to_string(),
        (JobStatus::Cancelled, _) => "Cancelled".to_string(),
        _ => job.message.clone(),
    }
}

// ── Sanitisation ─────────────────────────────────────────────────────────

static RE_SECRET_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:sk|pk|rk)-[A-Za-z0-9_\-]{8,}").unwrap());
static RE_BEARER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9._\-]+").unwrap());
static RE_KEY_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)((?:api[_-]?key|x-api-key|access_token|token)\s*[=:]\s*)["']?[^\s"'&,]+"#)
        .unwrap()
});
static RE_GOOGLE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bAIza[0-9A-Za-z_\-]{20,}").unwrap());

/// Make an upstream error message safe to persist and show to clients.
///
/// Redacts API keys and bearer tokens, drops any JSON payload a provider
/// appended, and truncates to a bounded length.
pub fn sanitize_message(raw: &str) -> String {
    let s = RE_SECRET_KEY.replace_all(raw, "[REDACTED]");
    let s = RE_BEARER.replace_all(&s, "Bearer [REDACTED]");
    let s = RE_KEY_PARAM.replace_all(&s, "${1}[REDACTED]");
    let s = RE_GOOGLE_KEY.replace_all(&s, "[REDACTED]");

    let payload_text;
    let head = match s.find('{') {
        None => s.as_ref(),
        Some(idx) if s[..idx].trim().is_empty() => {
            payload_text = payload_message(&s[idx..]);
            payload_text.as_str()
        }
        Some(idx) => s[..idx].trim_end(),
    };
    let head = head.split_whitespace().collect::<Vec<_>>().join(" ");

    if head.chars().count() > MAX_MESSAGE_CHARS {
        let cut: String = head.chars().take(MAX_MESSAGE_CHARS).collect();
        format!("{cut}…")
    } else {
        head
    }
}

/// A message that is nothing but a provider error body keeps only its
/// human-readable `message` field (top level or under `error`).
fn payload_message(body: &str) -> String {
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return PAYLOAD_PLACEHOLDER.to_string(),
    };
    let message = value
        .get("error")
        .and_then(|e| e.get("message"))
        .or_else(|| value.get("message"))
        .and_then(|m| m.as_str());
    match message {
        Some(m) if !m.trim().is_empty() && !m.contains('{') => m.to_string(),
        _ => PAYLOAD_PLACEHOLDER.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactRef;
    use crate::job::{JobError, JobOptions};
    use std::path::PathBuf;

    fn job() -> Job {
        Job::new(JobId::new(), PathBuf::from("in.pdf"), JobOptions::default())
    }

    fn commit(job: &mut Job, stage: Stage) {
        job.artifacts.insert(
            stage,
            ArtifactRef {
                job_id: job.id,
                stage,
                scene: None,
                version: 1,
                location: PathBuf::from("x"),
                created_at: Utc::now(),
            },
        );
    }

    #[test]
    fn queued_job_is_zero_percent() {
        let view = render(&job());
        assert_eq!(view.percent, 0);
        assert_eq!(view.status, JobStatus::Queued);
        assert_eq!(view.message, "Waiting to start");
        assert!(view.error_kind.is_none());
    }

    #[test]
    fn committed_weights_and_partial_progress_add_up() {
        let mut j = job();
        j.status = JobStatus::Running;
        commit(&mut j, Stage::Extract);
        commit(&mut j, Stage::Plan);
        commit(&mut j, Stage::Codegen);
        j.advance_progress(Stage::Render, 2, 4);
        // 10 + 15 + 25 + 40 * 0.5
        assert_eq!(render(&j).percent, 70);
    }

    #[test]
    fn running_never_reports_full() {
        let mut j = job();
        j.status = JobStatus::Running;
        for stage in Stage::ALL {
            commit(&mut j, stage);
        }
        assert_eq!(render(&j).percent, 99);
        j.status = JobStatus::Succeeded;
        assert_eq!(render(&j).percent, 100);
    }

    #[test]
    fn failed_view_carries_kind_and_clean_message() {
        let mut j = job();
        j.status = JobStatus::Failed;
        j.current_stage = Some(Stage::Plan);
        j.error = Some(JobError {
            stage: Stage::Plan,
            kind: ErrorKind::AuthError,
            message: "401 Unauthorized: Incorrect API key provided: sk-abcdef1234567890".into(),
            retryable: false,
        });
        let view = render(&j);
        assert_eq!(view.error_kind, Some(ErrorKind::AuthError));
        let msg = view.error_message.unwrap();
        assert!(!msg.contains("sk-abcdef"), "got: {msg}");
        assert!(view.message.contains("planning"), "got: {}", view.message);
    }

    #[test]
    fn sanitize_redacts_tokens() {
        let s = sanitize_message("Authorization: Bearer abc.def-123 failed");
        assert_eq!(s, "Authorization: Bearer [REDACTED] failed");

        let s = sanitize_message("GET /v1?api_key=secret123&x=1 -> 403");
        assert!(!s.contains("secret123"), "got: {s}");

        let s = sanitize_message("key AIzaSyA1234567890abcdefghijk rejected");
        assert!(!s.contains("AIzaSy"), "got: {s}");
    }

    #[test]
    fn sanitize_drops_json_payload_and_truncates() {
        let s = sanitize_message(r#"HTTP 500: {"error": {"message": "boom", "trace": "..."}}"#);
        assert_eq!(s, "HTTP 500:");

        let long = "x".repeat(500);
        let s = sanitize_message(&long);
        assert_eq!(s.chars().count(), MAX_MESSAGE_CHARS + 1);
    }

    #[test]
    fn sanitize_reduces_bare_json_payload_to_its_message() {
        let raw = r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error","code":"invalid_api_key"}}"#;
        assert_eq!(sanitize_message(raw), "Incorrect API key provided");

        let raw = r#"  {"message": "rate limited", "retry_after": 3}"#;
        assert_eq!(sanitize_message(raw), "rate limited");

        let raw = r#"{"detail": {"trace": "internal stack"}}"#;
        assert_eq!(sanitize_message(raw), PAYLOAD_PLACEHOLDER);

        let raw = r#"{"error": "truncated body"#;
        assert_eq!(sanitize_message(raw), PAYLOAD_PLACEHOLDER);
    }
}
