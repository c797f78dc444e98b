//! LLM access shared by the planning and code-generation stages.
//!
//! This module is intentionally thin: prompts live in [`crate::prompts`],
//! retry lives in [`crate::executor`]. What remains here is resolving a
//! provider, issuing exactly one completion per call, and classifying the
//! provider's errors into the stage taxonomy so the executor can decide
//! whether another attempt makes sense.

use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::job::{JobOptions, JobUsage};
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

const DEFAULT_MODEL: &str = "gpt-4.1-nano";

type ProviderKey = (Option<String>, Option<String>);

/// Provider resolution, completion and token accounting.
pub struct LlmClient {
    provider: Option<Arc<dyn LLMProvider>>,
    provider_name: Option<String>,
    model: Option<String>,
    temperature: f32,
    max_tokens: usize,
    cache: Mutex<HashMap<ProviderKey, Arc<dyn LLMProvider>>>,
}

impl LlmClient {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            provider: config.provider.clone(),
            provider_name: config.provider_name.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Send one chat request and return the text plus its usage.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &JobOptions,
    ) -> Result<(String, JobUsage), StageError> {
        let provider = self.resolve_provider(options)?;
        let model = self.effective_model(options);
        let request = build_options(model.as_deref(), self.temperature, self.max_tokens);

        let start = Instant::now();
        let response = provider
            .chat(messages, Some(&request))
            .await
            .map_err(|e| classify_provider_error(&e.to_string()))?;

        debug!(
            "LLM call: {} input tokens, {} output tokens, {:?}",
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        let usage = JobUsage {
            llm_calls: 1,
            input_tokens: response.prompt_tokens as u64,
            output_tokens: response.completion_tokens as u64,
        };
        Ok((response.content, usage))
    }

    fn effective_model(&self, options: &JobOptions) -> Option<String> {
        options.model.clone().or_else(|| self.model.clone())
    }

    /// Resolve the provider, from most-specific to least-specific:
    ///
    /// 1. a pre-built provider from the config,
    /// 2. a provider named per job or in the config (model defaults to
    ///    `gpt-4.1-nano`),
    /// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`,
    /// 4. OpenAI when `OPENAI_API_KEY` is set,
    /// 5. full auto-detection via [`ProviderFactory::from_env`].
    ///
    /// Any failure here means there are no usable credentials, which is an
    /// [`StageError::Auth`]: retrying will not help.
    pub fn resolve_provider(&self, options: &JobOptions) -> Result<Arc<dyn LLMProvider>, StageError> {
        if let Some(ref provider) = self.provider {
            return Ok(Arc::clone(provider));
        }

        let name = options
            .provider_name
            .clone()
            .or_else(|| self.provider_name.clone());
        let model = self.effective_model(options);
        let key = (name.clone(), model.clone());

        if let Some(p) = self.lock_cache().get(&key) {
            return Ok(Arc::clone(p));
        }

        let provider = create_provider(name.as_deref(), model.as_deref())?;
        self.lock_cache().insert(key, Arc::clone(&provider));
        Ok(provider)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<ProviderKey, Arc<dyn LLMProvider>>> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Provider cache lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

fn create_provider(name: Option<&str>, model: Option<&str>) -> Result<Arc<dyn LLMProvider>, StageError> {
    if let Some(name) = name {
        let model = model.unwrap_or(DEFAULT_MODEL);
        return named_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return named_provider(&prov, model.unwrap_or(&env_model));
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return named_provider("openai", model.unwrap_or(DEFAULT_MODEL));
        }
    }

    let (llm, _embedding) = ProviderFactory::from_env().map_err(|e| {
        StageError::auth(format!(
            "No LLM provider could be auto-detected from environment. \
             Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider. Error: {e}"
        ))
    })?;
    Ok(llm)
}

fn named_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, StageError> {
    ProviderFactory::create_llm_provider(name, model)
        .map_err(|e| StageError::auth(format!("Provider '{name}' is not configured: {e}")))
}

/// Map a provider error message onto the stage taxonomy.
///
/// Credentials problems never succeed on retry; rate limits, overload and
/// server errors usually do. Anything unrecognised is treated as transient
/// so the executor's budget decides.
pub fn classify_provider_error(message: &str) -> StageError {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&[
        "401",
        "403",
        "unauthorized",
        "forbidden",
        "invalid api key",
        "incorrect api key",
        "invalid_api_key",
        "authentication",
        "permission denied",
    ]) {
        StageError::auth(message)
    } else if has(&["context length", "context_length", "maximum context", "too many tokens"]) {
        StageError::invalid(message)
    } else {
        StageError::transient(message)
    }
}

/// Whether the model is a reasoning model that rejects a temperature.
fn is_reasoning_model(model: &str) -> bool {
    let m = model.rsplit('/').next().unwrap_or(model);
    let mut chars = m.chars();
    chars.next() == Some('o') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

/// Build `CompletionOptions` for one call.
fn build_options(model: Option<&str>, temperature: f32, max_tokens: usize) -> CompletionOptions {
    let temperature = match model {
        Some(m) if is_reasoning_model(m) => None,
        _ => Some(temperature),
    };
    CompletionOptions {
        temperature,
        max_tokens: Some(max_tokens),
        ..Default::default()
    }
}
