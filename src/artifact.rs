//! Artifact references and the payload carried by each stage.
//!
//! | Stage    | Payload              | Large binaries referenced by handle |
//! |----------|----------------------|-------------------------------------|
//! | Extract  | [`ExtractedDocument`] | figure PNGs                         |
//! | Plan     | [`ScenePlan`]         | none                                |
//! | Codegen  | [`GeneratedCode`] (+ one [`SceneCode`] per scene)   | none   |
//! | Render   | [`RenderedScenes`] (+ one [`RenderedSegment`] per scene) | media segments |
//! | Assemble | [`FinalVideo`]        | final video                          |
//!
//! Payloads are small JSON documents; media is written under the job's
//! media directory by the collaborator and only its path is stored here.

use crate::error::StageError;
use crate::job::{JobId, Stage};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::PathBuf;

/// Location of one committed artifact version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub job_id: JobId,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene: Option<usize>,
    /// 1-based, strictly increasing per slot.
    pub version: u32,
    /// Path of the JSON record in the artifact store.
    pub location: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// A committed artifact: its reference plus the decoded payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact<T> {
    pub reference: ArtifactRef,
    pub payload: T,
}

// ── Extract ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub heading: String,
    pub text: String,
    /// 1-based page the section starts on.
    pub page: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FigureRef {
    pub id: String,
    pub page: usize,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// Structured text and figure handles extracted from the paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub page_count: usize,
    pub sections: Vec<Section>,
    #[serde(default)]
    pub figures: Vec<FigureRef>,
}

impl ExtractedDocument {
    /// Characters of extracted text across all sections.
    pub fn text_len(&self) -> usize {
        self.sections.iter().map(|s| s.text.len()).sum()
    }

    pub fn validate(&self) -> Result<(), StageError> {
        if self.text_len() == 0 {
            return Err(StageError::fatal_input(
                "PDF contains no extractable text (scanned document?)",
            ));
        }
        Ok(())
    }
}

// ── Plan ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDescriptor {
    pub title: String,
    pub description: String,
    #[serde(alias = "duration")]
    pub duration_hint_secs: u32,
}

/// Ordered list of scenes for the explainer video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenePlan {
    #[serde(default)]
    pub title: String,
    pub scenes: Vec<SceneDescriptor>,
}

impl ScenePlan {
    /// Schema check applied before a plan may be committed.
    pub fn validate(&self, allowed: RangeInclusive<usize>) -> Result<(), StageError> {
        if self.scenes.is_empty() {
            return Err(StageError::validation("plan contains no scenes"));
        }
        if !allowed.contains(&self.scenes.len()) {
            return Err(StageError::validation(format!(
                "plan has {} scenes, expected between {} and {}",
                self.scenes.len(),
                allowed.start(),
                allowed.end()
            )));
        }
        for (i, scene) in self.scenes.iter().enumerate() {
            if scene.title.trim().is_empty() {
                return Err(StageError::validation(format!(
                    "scene {} has an empty title",
                    i + 1
                )));
            }
            if scene.description.trim().is_empty() {
                return Err(StageError::validation(format!(
                    "scene {} has an empty description",
                    i + 1
                )));
            }
            if scene.duration_hint_secs == 0 {
                return Err(StageError::validation(format!(
                    "scene {} has no duration hint",
                    i + 1
                )));
            }
        }
        Ok(())
    }
}

// ── Codegen ──────────────────────────────────────────────────────────────

/// Animation code and narration for one scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneCode {
    pub scene_index: usize,
    /// Name of the `Scene` subclass the renderer should run.
    pub class_name: String,
    pub code: String,
    pub narration: String,
}

static RE_SCENE_CLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^class\s+([A-Za-z_]\w*)\s*\(\s*[\w.]*Scene\s*\)\s*:").unwrap());

static RE_CONSTRUCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s+def\s+construct\s*\(\s*self\b").unwrap());

/// Name of the first `Scene` subclass declared in `code`, if any.
pub fn scene_class_name(code: &str) -> Option<String> {
    RE_SCENE_CLASS.captures(code).map(|c| c[1].to_string())
}

impl SceneCode {
    /// Static validation of generated code.
    ///
    /// Missing structure is recoverable (ask the model again); code that
    /// cannot even be tokenised is not.
    pub fn validate(&self) -> Result<(), StageError> {
        if self.code.trim().is_empty() {
            return Err(StageError::validation(format!(
                "scene {}: generated code is empty",
                self.scene_index + 1
            )));
        }
        check_balanced(&self.code).map_err(|detail| {
            StageError::invalid(format!(
                "scene {}: generated code is unparseable: {detail}",
                self.scene_index + 1
            ))
        })?;
        match scene_class_name(&self.code) {
            Some(name) if name == self.class_name => {}
            Some(name) => {
                return Err(StageError::validation(format!(
                    "scene {}: class '{}' does not match declared '{}'",
                    self.scene_index + 1,
                    name,
                    self.class_name
                )))
            }
            None => {
                return Err(StageError::validation(format!(
                    "scene {}: no Scene subclass found",
                    self.scene_index + 1
                )))
            }
        }
        if !RE_CONSTRUCT.is_match(&self.code) {
            return Err(StageError::validation(format!(
                "scene {}: Scene subclass has no construct(self) method",
                self.scene_index + 1
            )));
        }
        if self.narration.trim().is_empty() {
            return Err(StageError::validation(format!(
                "scene {}: narration is empty",
                self.scene_index + 1
            )));
        }
        Ok(())
    }
}

/// Bracket and string balance check for Python source.
///
/// Handles `#` comments, single/double quotes and triple-quoted strings.
fn check_balanced(code: &str) -> Result<(), String> {
    let chars: Vec<char> = code.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => line += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '\'' | '"' => {
                let triple = i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c;
                let start_line = line;
                i += if triple { 3 } else { 1 };
                let mut closed = false;
                while i < chars.len() {
                    let d = chars[i];
                    if d == '\\' {
                        i += 2;
                        continue;
                    }
                    if d == '\n' {
                        if !triple {
                            break;
                        }
                        line += 1;
                    }
                    if d == c {
                        if !triple {
                            closed = true;
                            i += 1;
                            break;
                        }
                        if chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c) {
                            closed = true;
                            i += 3;
                            break;
                        }
                    }
                    i += 1;
                }
                if !closed {
                    return Err(format!("unterminated string starting on line {start_line}"));
                }
                continue;
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_line)) => {
                        return Err(format!(
                            "'{c}' on line {line} closes '{open}' from line {open_line}"
                        ))
                    }
                    None => return Err(format!("unmatched '{c}' on line {line}")),
                }
            }
            _ => {}
        }
        i += 1;
    }

    match stack.pop() {
        Some((open, open_line)) => Err(format!("'{open}' on line {open_line} is never closed")),
        None => Ok(()),
    }
}

/// Stage-level Codegen artifact: the latest code for every scene, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedCode {
    pub scenes: Vec<SceneCode>,
    /// Per-scene artifact version each entry was taken from.
    pub versions: Vec<u32>,
}

// ── Render ───────────────────────────────────────────────────────────────

/// Rendered media for one scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedSegment {
    pub scene_index: usize,
    pub media: PathBuf,
    /// Codegen scene version this segment was rendered from.
    pub code_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedScenes {
    pub segments: Vec<RenderedSegment>,
}

// ── Assemble ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalVideo {
    pub path: PathBuf,
    /// Rendered segments in scene order.
    pub segments: Vec<PathBuf>,
}
