//! Final assembly: rendered segments → one video.

use super::render::split_command;
use crate::error::StageError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

#[async_trait]
pub trait Assembler: Send + Sync {
    /// Concatenate `segments` (already in scene order) into `out`.
    async fn assemble(&self, segments: &[PathBuf], out: &Path) -> Result<PathBuf, StageError>;
}

/// Default assembler: the ffmpeg concat demuxer with stream copy.
#[derive(Debug, Clone)]
pub struct FfmpegAssembler {
    command: String,
}

impl FfmpegAssembler {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Assembler for FfmpegAssembler {
    async fn assemble(&self, segments: &[PathBuf], out: &Path) -> Result<PathBuf, StageError> {
        if segments.is_empty() {
            return Err(StageError::invalid("no rendered segments to assemble"));
        }
        for seg in segments {
            if tokio::fs::metadata(seg).await.is_err() {
                return Err(StageError::resource(format!(
                    "rendered segment {} is missing",
                    seg.display()
                )));
            }
        }

        let list_path = out.with_extension("txt");
        tokio::fs::write(&list_path, concat_list(segments))
            .await
            .map_err(|e| StageError::resource(format!("Cannot write {}: {e}", list_path.display())))?;

        let (program, leading) = split_command(&self.command)?;
        let output = Command::new(program)
            .args(leading)
            .args(["-y", "-hide_banner", "-loglevel", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(&list_path)
            .args(["-c", "copy"])
            .arg(out)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StageError::resource(format!("Failed to start assembler '{}': {e}", self.command)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StageError::resource(format!(
                "Assembler exited with status {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        if tokio::fs::metadata(out).await.is_err() {
            return Err(StageError::resource(format!(
                "Assembler produced no {}",
                out.display()
            )));
        }

        info!("Assembled {} segments into {}", segments.len(), out.display());
        Ok(out.to_path_buf())
    }
}

/// Input file for the concat demuxer, one `file '…'` line per segment.
fn concat_list(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .map(|p| format!("file '{}'\n", p.display().to_string().replace('\'', r"'\''")))
        .collect()
}
