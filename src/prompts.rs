//! Prompts for the two LLM-backed stages.
//!
//! Every prompt lives here so it can be inspected by unit tests and changed
//! without touching parsing or retry logic. The wording is deliberately
//! plain; the orchestration contract only depends on the response shapes
//! (a JSON scene plan, a Python block plus narration).

use crate::artifact::{ExtractedDocument, ScenePlan};
use crate::job::JobOptions;
use std::fmt::Write as _;
use std::ops::RangeInclusive;

/// Document text beyond this many characters is cut from the planning request.
pub const MAX_DOCUMENT_CHARS: usize = 24_000;

/// System prompt for turning a paper into a scene plan.
pub const PLAN_SYSTEM_PROMPT: &str = r#"You are an expert science communicator who storyboards short animated explainer videos of research papers.

Read the paper and produce a storyboard.

Rules:
1. Each scene explains ONE idea and builds on the previous scene.
2. Start with the motivation, end with the key result or takeaway.
3. Prefer visual ideas: equations being transformed, diagrams, plots, step-by-step derivations.
4. Keep every description concrete enough that an animator could implement it without reading the paper.

Output ONLY a JSON object of this exact shape, with no commentary:
{
  "title": "video title",
  "scenes": [
    {"title": "scene title", "description": "what is shown and explained", "duration_hint_secs": 30}
  ]
}"#;

/// System prompt for generating the code and narration of one scene.
pub const CODEGEN_SYSTEM_PROMPT: &str = r#"You are an expert Manim Community Edition animator.

Write the animation for ONE scene of an explainer video.

Rules:
1. Output a single ```python block containing `from manim import *` and exactly one class that subclasses `Scene` and defines `construct(self)`.
2. Use only Manim Community Edition APIs. Do not read files, access the network or use external assets.
3. Keep the animation within the requested duration using `self.wait()` where needed.
4. After the code block, output a ```narration block with the voice-over text for the scene, spoken in plain sentences.

Output nothing else."#;

/// Build the user message of a planning request.
pub fn plan_request(
    doc: &ExtractedDocument,
    options: &JobOptions,
    scenes: RangeInclusive<usize>,
    guidance: Option<&str>,
) -> String {
    let mut out = String::new();
    let title = options
        .title
        .as_deref()
        .or(doc.title.as_deref())
        .unwrap_or("Untitled paper");
    let _ = writeln!(out, "Paper title: {title}");
    let _ = writeln!(out, "Pages: {}", doc.page_count);
    if let Some(audience) = options.audience.as_deref() {
        let _ = writeln!(out, "Target audience: {audience}");
    }
    let _ = writeln!(
        out,
        "Produce between {} and {} scenes (inclusive).",
        scenes.start(),
        scenes.end()
    );
    if !doc.figures.is_empty() {
        let _ = writeln!(
            out,
            "{} figure(s) from the paper are attached; reuse their ideas where helpful.",
            doc.figures.len()
        );
    }
    if let Some(g) = guidance {
        let _ = writeln!(out, "\nIMPORTANT: {g}");
    }

    out.push_str("\n--- PAPER TEXT ---\n");
    let mut budget = MAX_DOCUMENT_CHARS;
    for section in &doc.sections {
        if budget == 0 {
            break;
        }
        let block = format!("\n## {} (p. {})\n{}\n", section.heading, section.page, section.text);
        let taken: String = block.chars().take(budget).collect();
        budget -= taken.chars().count();
        out.push_str(&taken);
    }
    out
}

/// Build the user message of a code-generation request for one scene.
pub fn codegen_request(
    plan: &ScenePlan,
    scene_index: usize,
    options: &JobOptions,
    class_name: &str,
    guidance: Option<&str>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Video: {}", plan.title);
    if let Some(audience) = options.audience.as_deref() {
        let _ = writeln!(out, "Target audience: {audience}");
    }
    let _ = writeln!(out, "\nStoryboard:");
    for (i, scene) in plan.scenes.iter().enumerate() {
        let marker = if i == scene_index { " <= THIS SCENE" } else { "" };
        let _ = writeln!(out, "{}. {}{}", i + 1, scene.title, marker);
    }
    if let Some(scene) = plan.scenes.get(scene_index) {
        let _ = writeln!(out, "\nScene {}: {}", scene_index + 1, scene.title);
        let _ = writeln!(out, "{}", scene.description);
        let _ = writeln!(out, "Target duration: about {} seconds.", scene.duration_hint_secs);
    }
    let _ = writeln!(out, "Name the Scene subclass `{class_name}`.");
    if let Some(g) = guidance {
        let _ = writeln!(out, "\nIMPORTANT: {g}");
    }
    out
}

/// Class name the generator asks for, stable per scene index.
pub fn scene_class_for(scene_index: usize) -> String {
    format!("Scene{:02}", scene_index + 1)
}
