//! Code generation: one scene of the plan → animation code + narration.

use super::llm::LlmClient;
use super::{postprocess, Generated};
use crate::artifact::{scene_class_name, ScenePlan, SceneCode};
use crate::error::StageError;
use crate::executor::AttemptContext;
use crate::job::JobOptions;
use crate::prompts::{codegen_request, scene_class_for, CODEGEN_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::ChatMessage;
use std::sync::Arc;

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Generate the code for scene `scene_index` of `plan`.
    ///
    /// On a retry `ctx.guidance` holds the previous validation or renderer
    /// error for this scene.
    async fn generate(
        &self,
        plan: &ScenePlan,
        scene_index: usize,
        options: &JobOptions,
        ctx: &AttemptContext,
    ) -> Result<Generated<SceneCode>, StageError>;
}

pub struct LlmCodeGenerator {
    llm: Arc<LlmClient>,
}

impl LlmCodeGenerator {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl CodeGenerator for LlmCodeGenerator {
    async fn generate(
        &self,
        plan: &ScenePlan,
        scene_index: usize,
        options: &JobOptions,
        ctx: &AttemptContext,
    ) -> Result<Generated<SceneCode>, StageError> {
        let class_name = scene_class_for(scene_index);
        let request = codegen_request(plan, scene_index, options, &class_name, ctx.guidance.as_deref());
        let messages = vec![
            ChatMessage::system(CODEGEN_SYSTEM_PROMPT),
            ChatMessage::user_with_images(request, Vec::new()),
        ];

        let (content, usage) = self.llm.complete(&messages, options).await?;
        let value = parse_scene_code(&content, scene_index)?;
        Ok(Generated { value, usage })
    }
}

/// Split a model response into code and narration.
///
/// The class name is read back from the code rather than trusted from the
/// request, so a model that renamed the class still produces a runnable
/// scene.
pub fn parse_scene_code(raw: &str, scene_index: usize) -> Result<SceneCode, StageError> {
    let cleaned = postprocess::clean_response(raw);
    let code = postprocess::extract_code_block(&cleaned, &["python", "py"])
        .ok_or_else(|| StageError::validation("response contains no ```python code block"))?;
    let class_name = scene_class_name(&code)
        .ok_or_else(|| StageError::validation("code declares no Scene subclass"))?;
    let narration = postprocess::extract_narration(&cleaned)
        .ok_or_else(|| StageError::validation("response contains no narration"))?;

    Ok(SceneCode {
        scene_index,
        class_name,
        code,
        narration,
    })
}
