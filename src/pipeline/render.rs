//! Scene rendering: generated code → video segment via a renderer subprocess.
//!
//! ## Failure classes
//!
//! The renderer is the one collaborator whose failures can originate in
//! *our* output rather than in the environment. Telling the two apart
//! decides where a failure is routed:
//!
//! | Symptom                                     | Error                         |
//! |---------------------------------------------|-------------------------------|
//! | Python traceback on stderr                  | hard `Validation` (code-origin, back to Codegen) |
//! | killed by a signal, `MemoryError`           | `Resource`                    |
//! | executable missing, no output file produced | `Resource`                    |
//!
//! Timeouts are enforced by the Stage Executor; the child is spawned with
//! `kill_on_drop` so an abandoned attempt does not leave a renderer running.

use crate::artifact::SceneCode;
use crate::config::RenderQuality;
use crate::error::StageError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Lines of renderer stderr kept as guidance for regeneration.
const STDERR_TAIL_LINES: usize = 15;

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render one scene, writing anything it needs under `out_dir`, and
    /// return the path of the produced segment.
    async fn render(&self, scene: &SceneCode, out_dir: &Path) -> Result<PathBuf, StageError>;
}

/// Default renderer: runs Manim Community Edition as a subprocess.
#[derive(Debug, Clone)]
pub struct ManimRenderer {
    /// Executable, optionally followed by leading arguments
    /// (e.g. `python -m manim`).
    command: String,
    quality: RenderQuality,
}

impl ManimRenderer {
    pub fn new(command: impl Into<String>, quality: RenderQuality) -> Self {
        Self {
            command: command.into(),
            quality,
        }
    }

    fn segment_name(scene: &SceneCode) -> String {
        format!("scene_{:02}.mp4", scene.scene_index + 1)
    }
}

#[async_trait]
impl Renderer for ManimRenderer {
    async fn render(&self, scene: &SceneCode, out_dir: &Path) -> Result<PathBuf, StageError> {
        let scene_dir = out_dir.join(format!("scene-{:02}", scene.scene_index + 1));
        let media_dir = scene_dir.join("media");
        tokio::fs::create_dir_all(&media_dir)
            .await
            .map_err(|e| StageError::resource(format!("Cannot create {}: {e}", media_dir.display())))?;

        let script = scene_dir.join("scene.py");
        tokio::fs::write(&script, &scene.code)
            .await
            .map_err(|e| StageError::resource(format!("Cannot write {}: {e}", script.display())))?;

        let segment = Self::segment_name(scene);
        let (program, leading) = split_command(&self.command)?;
        let mut cmd = Command::new(program);
        cmd.args(leading)
            .arg("--quality")
            .arg(self.quality.manim_flag())
            .arg("--media_dir")
            .arg(&media_dir)
            .arg("-o")
            .arg(&segment)
            .arg(&script)
            .arg(&scene.class_name)
            .current_dir(&scene_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!("Rendering scene {} ({})", scene.scene_index + 1, scene.class_name);
        let output = cmd.output().await.map_err(|e| {
            StageError::resource(format!("Failed to start renderer '{}': {e}", self.command))
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(classify_render_failure(output.status.code(), &stderr));
        }

        let produced = find_file(&media_dir, &segment).ok_or_else(|| {
            StageError::resource(format!(
                "Renderer exited cleanly but produced no {segment}: {}",
                tail(&stderr, 3)
            ))
        })?;
        debug!("Scene {} rendered to {}", scene.scene_index + 1, produced.display());
        Ok(produced)
    }
}

/// Split `"python -m manim"` into the program and its leading arguments.
pub(crate) fn split_command(command: &str) -> Result<(&str, Vec<&str>), StageError> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| StageError::resource("No executable configured"))?;
    Ok((program, parts.collect()))
}

fn classify_render_failure(code: Option<i32>, stderr: &str) -> StageError {
    let detail = tail(stderr, STDERR_TAIL_LINES);
    if code.is_none() || stderr.contains("MemoryError") {
        return StageError::resource(format!("Renderer was killed: {detail}"));
    }
    if stderr.contains("Traceback (most recent call last)") || looks_like_python_error(stderr) {
        return StageError::invalid(format!("Scene code failed to render:\n{detail}"));
    }
    StageError::resource(format!(
        "Renderer exited with status {}: {detail}",
        code.unwrap_or(-1)
    ))
}

fn looks_like_python_error(stderr: &str) -> bool {
    stderr.lines().any(|l| {
        let l = l.trim_start();
        ["SyntaxError", "NameError", "TypeError", "AttributeError", "ValueError", "IndentationError"]
            .iter()
            .any(|e| l.starts_with(e))
    })
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

fn find_file(root: &Path, name: &str) -> Option<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .find(|e| e.file_type().is_file() && e.file_name() == name)
        .map(|e| e.into_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn scene() -> SceneCode {
        SceneCode {
            scene_index: 1,
            class_name: "Scene02".into(),
            code: "from manim import *\n".into(),
            narration: "hi".into(),
        }
    }

    #[test]
    fn traceback_is_code_origin() {
        let err = classify_render_failure(
            Some(1),
            "Traceback (most recent call last):\n  File \"scene.py\", line 4\nNameError: name 'Foo' is not defined",
        );
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(!err.is_recoverable());
        assert!(err.message().contains("NameError"));
    }

    #[test]
    fn signal_and_oom_are_resource() {
        assert_eq!(classify_render_failure(None, "").kind(), ErrorKind::ResourceError);
        assert_eq!(
            classify_render_failure(Some(1), "Traceback...\nMemoryError").kind(),
            ErrorKind::ResourceError
        );
        assert_eq!(
            classify_render_failure(Some(2), "ffmpeg: not found").kind(),
            ErrorKind::ResourceError
        );
    }

    #[test]
    fn split_command_keeps_leading_args() {
        let (prog, args) = split_command("python -m manim").unwrap();
        assert_eq!(prog, "python");
        assert_eq!(args, vec!["-m", "manim"]);
        assert!(split_command("   ").is_err());
    }

    #[tokio::test]
    async fn missing_executable_is_resource_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let renderer = ManimRenderer::new("definitely-not-a-renderer-xyz", RenderQuality::Low);
        let err = renderer.render(&scene(), dir.path()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceError);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fake_renderer_output_is_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake_manim.sh");
        std::fs::write(
            &script,
            "while [ $# -gt 0 ]; do\n  case \"$1\" in\n    --media_dir) media=\"$2\"; shift ;;\n    -o) out=\"$2\"; shift ;;\n  esac\n  shift\ndone\nmkdir -p \"$media/videos/scene/480p15\"\nprintf fake > \"$media/videos/scene/480p15/$out\"\n",
        )
        .unwrap();
        let renderer = ManimRenderer::new(format!("sh {}", script.display()), RenderQuality::Low);
        let out = dir.path().join("render");
        let path = renderer.render(&scene(), &out).await.unwrap();
        assert!(path.ends_with("scene_02.mp4"));
        assert_eq!(std::fs::read(&path).unwrap(), b"fake");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fake_renderer_traceback_is_code_origin() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("broken_manim.sh");
        std::fs::write(
            &script,
            "echo 'Traceback (most recent call last):' >&2\necho \"NameError: name 'Axes3' is not defined\" >&2\nexit 1\n",
        )
        .unwrap();
        let renderer = ManimRenderer::new(format!("sh {}", script.display()), RenderQuality::Low);
        let err = renderer.render(&scene(), dir.path()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(err.message().contains("Axes3"));
    }
}
