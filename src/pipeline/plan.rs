//! Scene planning: extracted document → ordered scene list.

use super::llm::LlmClient;
use super::{encode, postprocess, Generated};
use crate::artifact::{ExtractedDocument, ScenePlan};
use crate::error::StageError;
use crate::executor::AttemptContext;
use crate::job::JobOptions;
use crate::prompts::{plan_request, PLAN_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::ChatMessage;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::{debug, warn};

#[async_trait]
pub trait Planner: Send + Sync {
    /// Produce a scene plan for `doc`.
    ///
    /// `ctx.guidance` carries the correction for a retry (e.g. "the plan had
    /// 2 scenes, produce between 3 and 7"). The scene-count check itself is
    /// applied by the orchestrator, not by the planner.
    async fn plan(
        &self,
        doc: &ExtractedDocument,
        options: &JobOptions,
        ctx: &AttemptContext,
    ) -> Result<Generated<ScenePlan>, StageError>;
}

/// Default planner: one LLM call with the paper text and up to
/// `max_figures` figures attached.
pub struct LlmPlanner {
    llm: Arc<LlmClient>,
    scenes: RangeInclusive<usize>,
    max_figures: usize,
}

impl LlmPlanner {
    pub fn new(llm: Arc<LlmClient>, scenes: RangeInclusive<usize>, max_figures: usize) -> Self {
        Self {
            llm,
            scenes,
            max_figures,
        }
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(
        &self,
        doc: &ExtractedDocument,
        options: &JobOptions,
        ctx: &AttemptContext,
    ) -> Result<Generated<ScenePlan>, StageError> {
        let request = plan_request(doc, options, self.scenes.clone(), ctx.guidance.as_deref());

        let images: Vec<_> = doc
            .figures
            .iter()
            .take(self.max_figures)
            .filter_map(|fig| match encode::load_figure(&fig.path) {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!("Skipping figure {}: {}", fig.id, e);
                    None
                }
            })
            .collect();
        debug!("Planning request: {} chars, {} figures", request.len(), images.len());

        let messages = vec![
            ChatMessage::system(PLAN_SYSTEM_PROMPT),
            ChatMessage::user_with_images(request, images),
        ];

        let (content, usage) = self.llm.complete(&messages, options).await?;
        let value = parse_plan(&content)?;
        Ok(Generated { value, usage })
    }
}

/// Parse a model response into a plan. Malformed output is a recoverable
/// validation failure.
pub fn parse_plan(raw: &str) -> Result<ScenePlan, StageError> {
    let cleaned = postprocess::clean_response(raw);
    let json = postprocess::extract_json(&cleaned)
        .ok_or_else(|| StageError::validation("response contains no JSON object"))?;
    serde_json::from_str(&json)
        .map_err(|e| StageError::validation(format!("plan JSON does not match the schema: {e}")))
}
