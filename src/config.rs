//! Configuration types for the PDF-to-video pipeline.
//!
//! All orchestration behaviour is controlled through [`PipelineConfig`],
//! built via its [`PipelineConfigBuilder`]. Retry, timeout and backoff live
//! in one [`StagePolicy`] per stage rather than in each collaborator, so the
//! Stage Executor applies a single, consistent policy object everywhere.

use crate::error::Pdf2VideoError;
use crate::job::Stage;
use crate::pipeline::assemble::Assembler;
use crate::pipeline::codegen::CodeGenerator;
use crate::pipeline::extract::Extractor;
use crate::pipeline::plan::Planner;
use crate::pipeline::render::Renderer;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// ── Stage policy ─────────────────────────────────────────────────────────

/// Retry / timeout / backoff policy for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePolicy {
    /// Total attempts including the first. Always ≥ 1.
    pub max_attempts: u32,
    /// Wall-clock limit for a single attempt.
    pub attempt_timeout: Duration,
    /// Delay before the second attempt; doubles for every further attempt.
    pub backoff_base: Duration,
    /// Upper bound for any single backoff delay.
    pub backoff_max: Duration,
    /// How many times a `ResourceError` may be retried (still bounded by
    /// `max_attempts`).
    pub max_resource_retries: u32,
}

impl StagePolicy {
    /// Network-bound stages (LLM calls): 3 attempts.
    pub fn network() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(180),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
            max_resource_retries: 1,
        }
    }

    /// Deterministic local stages: a single attempt.
    pub fn local() -> Self {
        Self {
            max_attempts: 1,
            attempt_timeout: Duration::from_secs(300),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
            max_resource_retries: 0,
        }
    }

    /// Subprocess rendering: one retry for crashes and timeouts.
    pub fn render() -> Self {
        Self {
            max_attempts: 2,
            attempt_timeout: Duration::from_secs(600),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(8),
            max_resource_retries: 1,
        }
    }

    /// Delay to wait before attempt number `next_attempt` (1-based).
    ///
    /// `base * 2^(next_attempt - 2)`, capped at `backoff_max`; zero before
    /// the first attempt.
    pub fn backoff_before(&self, next_attempt: u32) -> Duration {
        if next_attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (next_attempt - 2).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }
}

/// One policy per stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePolicies {
    pub extract: StagePolicy,
    pub plan: StagePolicy,
    pub codegen: StagePolicy,
    pub render: StagePolicy,
    pub assemble: StagePolicy,
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self {
            extract: StagePolicy::local().with_timeout(Duration::from_secs(120)),
            plan: StagePolicy::network(),
            codegen: StagePolicy::network(),
            render: StagePolicy::render(),
            assemble: StagePolicy::local(),
        }
    }
}

impl StagePolicies {
    pub fn get(&self, stage: Stage) -> &StagePolicy {
        match stage {
            Stage::Extract => &self.extract,
            Stage::Plan => &self.plan,
            Stage::Codegen => &self.codegen,
            Stage::Render => &self.render,
            Stage::Assemble => &self.assemble,
        }
    }

    pub fn get_mut(&mut self, stage: Stage) -> &mut StagePolicy {
        match stage {
            Stage::Extract => &mut self.extract,
            Stage::Plan => &mut self.plan,
            Stage::Codegen => &mut self.codegen,
            Stage::Render => &mut self.render,
            Stage::Assemble => &mut self.assemble,
        }
    }
}

// ── Render quality ───────────────────────────────────────────────────────

/// Renderer quality preset (maps to manim's `--quality l|m|h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RenderQuality {
    /// 480p15, fast previews (default).
    #[default]
    Low,
    /// 720p30.
    Medium,
    /// 1080p60.
    High,
}

impl RenderQuality {
    pub fn manim_flag(self) -> &'static str {
        match self {
            RenderQuality::Low => "l",
            RenderQuality::Medium => "m",
            RenderQuality::High => "h",
        }
    }
}

// ── Pipeline config ──────────────────────────────────────────────────────

/// Configuration for the orchestrator and its default collaborators.
///
/// # Example
/// ```rust
/// use edgequake_pdf2video::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .store_dir("./jobs")
///     .max_concurrent_jobs(4)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Root directory of the artifact store. Default: `./jobs`.
    pub store_dir: PathBuf,

    /// Jobs allowed in `Running` at once; the rest stay `Queued`. Default: 2.
    pub max_concurrent_jobs: usize,

    /// Retry/timeout/backoff per stage.
    pub policies: StagePolicies,

    /// Inclusive lower bound for the number of planned scenes. Default: 3.
    pub min_scenes: usize,

    /// Inclusive upper bound for the number of planned scenes. Default: 7.
    pub max_scenes: usize,

    /// LLM model identifier. If None, the provider default is used.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    /// If None along with `provider`, uses `ProviderFactory::from_env()`.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for planning and code generation. Default: 0.7.
    ///
    /// Ignored for reasoning models (o-series), which only accept the
    /// provider default.
    pub temperature: f32,

    /// Maximum tokens per LLM completion. Default: 4096.
    pub max_tokens: usize,

    /// Figures attached to the planning request. Default: 4.
    pub max_figures: usize,

    /// Renderer executable. Default: `manim`.
    pub renderer_command: String,

    /// Renderer quality preset. Default: Low.
    pub render_quality: RenderQuality,

    /// Video assembler executable. Default: `ffmpeg`.
    pub assembler_command: String,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Push-style progress events, in addition to polling.
    pub progress_callback: Option<ProgressCallback>,

    /// Collaborator overrides; `None` selects the built-in implementation.
    pub extractor: Option<Arc<dyn Extractor>>,
    pub planner: Option<Arc<dyn Planner>>,
    pub code_generator: Option<Arc<dyn CodeGenerator>>,
    pub renderer: Option<Arc<dyn Renderer>>,
    pub assembler: Option<Arc<dyn Assembler>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("jobs"),
            max_concurrent_jobs: 2,
            policies: StagePolicies::default(),
            min_scenes: 3,
            max_scenes: 7,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.7,
            max_tokens: 4096,
            max_figures: 4,
            renderer_command: "manim".to_string(),
            render_quality: RenderQuality::default(),
            assembler_command: "ffmpeg".to_string(),
            download_timeout_secs: 120,
            progress_callback: None,
            extractor: None,
            planner: None,
            code_generator: None,
            renderer: None,
            assembler: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let overridden = |set: bool| if set { "<custom>" } else { "<default>" };
        f.debug_struct("PipelineConfig")
            .field("store_dir", &self.store_dir)
            .field("max_concurrent_jobs", &self.max_concurrent_jobs)
            .field("policies", &self.policies)
            .field("scenes", &(self.min_scenes..=self.max_scenes))
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_figures", &self.max_figures)
            .field("renderer_command", &self.renderer_command)
            .field("render_quality", &self.render_quality)
            .field("assembler_command", &self.assembler_command)
            .field("extractor", &overridden(self.extractor.is_some()))
            .field("planner", &overridden(self.planner.is_some()))
            .field("code_generator", &overridden(self.code_generator.is_some()))
            .field("renderer", &overridden(self.renderer.is_some()))
            .field("assembler", &overridden(self.assembler.is_some()))
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Allowed scene counts for a committed plan.
    pub fn scene_range(&self) -> std::ops::RangeInclusive<usize> {
        self.min_scenes..=self.max_scenes
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.store_dir = dir.into();
        self
    }

    pub fn max_concurrent_jobs(mut self, n: usize) -> Self {
        self.config.max_concurrent_jobs = n.max(1);
        self
    }

    pub fn policy(mut self, stage: Stage, policy: StagePolicy) -> Self {
        *self.config.policies.get_mut(stage) = policy;
        self
    }

    /// Apply the same backoff schedule to every stage.
    pub fn backoff(mut self, base: std::time::Duration, max: std::time::Duration) -> Self {
        for stage in Stage::ALL {
            let policy = self.config.policies.get_mut(stage);
            policy.backoff_base = base;
            policy.backoff_max = max;
        }
        self
    }

    /// Override `max_attempts` for the network-bound stages (Plan, Codegen).
    pub fn max_llm_attempts(mut self, n: u32) -> Self {
        self.config.policies.plan.max_attempts = n.max(1);
        self.config.policies.codegen.max_attempts = n.max(1);
        self
    }

    pub fn scene_range(mut self, min: usize, max: usize) -> Self {
        self.config.min_scenes = min;
        self.config.max_scenes = max;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_figures(mut self, n: usize) -> Self {
        self.config.max_figures = n;
        self
    }

    pub fn renderer_command(mut self, cmd: impl Into<String>) -> Self {
        self.config.renderer_command = cmd.into();
        self
    }

    pub fn render_quality(mut self, quality: RenderQuality) -> Self {
        self.config.render_quality = quality;
        self
    }

    pub fn assembler_command(mut self, cmd: impl Into<String>) -> Self {
        self.config.assembler_command = cmd.into();
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.config.extractor = Some(extractor);
        self
    }

    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.config.planner = Some(planner);
        self
    }

    pub fn code_generator(mut self, generator: Arc<dyn CodeGenerator>) -> Self {
        self.config.code_generator = Some(generator);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.config.renderer = Some(renderer);
        self
    }

    pub fn assembler(mut self, assembler: Arc<dyn Assembler>) -> Self {
        self.config.assembler = Some(assembler);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, Pdf2VideoError> {
        let c = &self.config;
        if c.min_scenes == 0 || c.min_scenes > c.max_scenes {
            return Err(Pdf2VideoError::InvalidConfig(format!(
                "Scene range must be 1 ≤ min ≤ max, got {}..={}",
                c.min_scenes, c.max_scenes
            )));
        }
        if c.max_concurrent_jobs == 0 {
            return Err(Pdf2VideoError::InvalidConfig(
                "max_concurrent_jobs must be ≥ 1".into(),
            ));
        }
        for stage in Stage::ALL {
            let policy = c.policies.get(stage);
            if policy.max_attempts == 0 {
                return Err(Pdf2VideoError::InvalidConfig(format!(
                    "Stage {stage}: max_attempts must be ≥ 1"
                )));
            }
            if policy.attempt_timeout.is_zero() {
                return Err(Pdf2VideoError::InvalidConfig(format!(
                    "Stage {stage}: attempt_timeout must be > 0"
                )));
            }
        }
        if c.store_dir.as_os_str().is_empty() {
            return Err(Pdf2VideoError::InvalidConfig(
                "store_dir must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}
