//! Collaborators that do the actual work of each stage.
//!
//! The orchestrator only sees the traits below; each has a built-in
//! implementation and can be replaced through [`crate::config::PipelineConfig`].
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ extract ──▶ plan ──▶ codegen ──▶ render ──▶ assemble
//! (URL/path) (pdfium)   (LLM)    (LLM)       (manim)    (ffmpeg)
//! ```
//!
//! 1. [`input`]: read a local path or download a URL, check `%PDF`
//! 2. [`extract`]: page text and embedded figures; runs in `spawn_blocking`
//!    because pdfium is not async-safe
//! 3. [`plan`]: ask the LLM for an ordered list of scenes, with up to
//!    `max_figures` figures attached via [`encode`]
//! 4. [`codegen`]: one LLM call per scene for animation code and narration
//! 5. [`render`]: run the renderer subprocess per scene
//! 6. [`assemble`]: concatenate rendered segments into the final video
//!
//! [`llm`] holds provider resolution and error classification shared by the
//! two LLM-backed stages; [`postprocess`] cleans up their raw text.

pub mod assemble;
pub mod codegen;
pub mod encode;
pub mod extract;
pub mod input;
pub mod llm;
pub mod plan;
pub mod postprocess;
pub mod render;

use crate::config::PipelineConfig;
use crate::job::JobUsage;
use std::sync::Arc;

use assemble::{Assembler, FfmpegAssembler};
use codegen::{CodeGenerator, LlmCodeGenerator};
use extract::{Extractor, PdfiumExtractor};
use llm::LlmClient;
use plan::{LlmPlanner, Planner};
use render::{ManimRenderer, Renderer};

/// A collaborator's output plus the LLM usage it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Generated<T> {
    pub value: T,
    pub usage: JobUsage,
}

impl<T> Generated<T> {
    /// Output that cost no LLM calls.
    pub fn free(value: T) -> Self {
        Self {
            value,
            usage: JobUsage::default(),
        }
    }
}

/// The set of stage collaborators one orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub extractor: Arc<dyn Extractor>,
    pub planner: Arc<dyn Planner>,
    pub code_generator: Arc<dyn CodeGenerator>,
    pub renderer: Arc<dyn Renderer>,
    pub assembler: Arc<dyn Assembler>,
}

impl Collaborators {
    /// Use the overrides in `config`, falling back to the built-ins.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let llm = Arc::new(LlmClient::new(config));
        Self {
            extractor: config
                .extractor
                .clone()
                .unwrap_or_else(|| Arc::new(PdfiumExtractor::default())),
            planner: config.planner.clone().unwrap_or_else(|| {
                Arc::new(LlmPlanner::new(
                    Arc::clone(&llm),
                    config.scene_range(),
                    config.max_figures,
                ))
            }),
            code_generator: config
                .code_generator
                .clone()
                .unwrap_or_else(|| Arc::new(LlmCodeGenerator::new(Arc::clone(&llm)))),
            renderer: config.renderer.clone().unwrap_or_else(|| {
                Arc::new(ManimRenderer::new(
                    config.renderer_command.clone(),
                    config.render_quality,
                ))
            }),
            assembler: config
                .assembler
                .clone()
                .unwrap_or_else(|| Arc::new(FfmpegAssembler::new(config.assembler_command.clone()))),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
