//! Orchestrator integration tests with in-process fake collaborators.
//!
//! No pdfium, LLM, manim or ffmpeg is needed: every stage is replaced by a
//! scripted fake, and the store lives in a temp dir. Run with:
//!   cargo test --test pipeline
//!
//! Set `RUST_LOG=edgequake_pdf2video=debug` to see the pipeline logs.

use async_trait::async_trait;
use edgequake_pdf2video::artifact::{
    ExtractedDocument, FinalVideo, RenderedSegment, SceneCode, SceneDescriptor, ScenePlan, Section,
};
use edgequake_pdf2video::executor::AttemptContext;
use edgequake_pdf2video::job::{AttemptOutcome, JobUsage};
use edgequake_pdf2video::pipeline::assemble::Assembler;
use edgequake_pdf2video::pipeline::codegen::CodeGenerator;
use edgequake_pdf2video::pipeline::extract::Extractor;
use edgequake_pdf2video::pipeline::plan::Planner;
use edgequake_pdf2video::pipeline::render::Renderer;
use edgequake_pdf2video::pipeline::Generated;
use edgequake_pdf2video::store::{ArtifactStore, Slot};
use edgequake_pdf2video::{
    ErrorKind, Job, JobId, JobOptions, JobStatus, Orchestrator, Pdf2VideoError, PipelineConfig,
    Stage, StageError,
};
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio_test::{assert_err, assert_ok};
use tracing_subscriber::EnvFilter;

// ── Fakes ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeExtractor {
    calls: AtomicUsize,
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn extract(&self, _pdf: &Path, _media: &Path) -> Result<ExtractedDocument, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExtractedDocument {
            title: Some("Gradient Descent".into()),
            page_count: 2,
            sections: vec![Section {
                heading: "Introduction".into(),
                text: "We minimise a loss by following its negative gradient.".into(),
                page: 1,
            }],
            figures: vec![],
        })
    }
}

/// Plans with a scripted scene count per call (default 5). Optionally
/// announces each call on `entered` and blocks until `gate` has a permit.
#[derive(Default)]
struct FakePlanner {
    counts: Mutex<VecDeque<usize>>,
    error: Mutex<Option<StageError>>,
    guidance: Mutex<Vec<Option<String>>>,
    calls: AtomicUsize,
    entered: Option<Arc<Semaphore>>,
    gate: Option<Arc<Semaphore>>,
}

impl FakePlanner {
    fn scripted(counts: &[usize]) -> Self {
        Self {
            counts: Mutex::new(counts.iter().copied().collect()),
            ..Default::default()
        }
    }

    fn failing(err: StageError) -> Self {
        Self {
            error: Mutex::new(Some(err)),
            ..Default::default()
        }
    }

    fn gated() -> (Self, Arc<Semaphore>, Arc<Semaphore>) {
        let entered = Arc::new(Semaphore::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let planner = Self {
            entered: Some(Arc::clone(&entered)),
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        (planner, entered, gate)
    }
}

#[async_trait]
impl Planner for FakePlanner {
    async fn plan(
        &self,
        _doc: &ExtractedDocument,
        _options: &JobOptions,
        ctx: &AttemptContext,
    ) -> Result<Generated<ScenePlan>, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.guidance.lock().unwrap().push(ctx.guidance.clone());
        if let Some(ref entered) = self.entered {
            entered.add_permits(1);
        }
        if let Some(ref gate) = self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if let Some(err) = self.error.lock().unwrap().clone() {
            return Err(err);
        }

        let n = self.counts.lock().unwrap().pop_front().unwrap_or(5);
        let scenes = (1..=n)
            .map(|i| SceneDescriptor {
                title: format!("Step {i}"),
                description: format!("Animate step {i} of the descent"),
                duration_hint_secs: 20,
            })
            .collect();
        Ok(Generated {
            value: ScenePlan {
                title: "Gradient Descent".into(),
                scenes,
            },
            usage: JobUsage {
                llm_calls: 1,
                input_tokens: 1000,
                output_tokens: 200,
            },
        })
    }
}

#[derive(Default)]
struct FakeCoder {
    calls: Mutex<HashMap<usize, u32>>,
    guidance: Mutex<Vec<(usize, Option<String>)>>,
}

impl FakeCoder {
    fn calls_for(&self, idx: usize) -> u32 {
        self.calls.lock().unwrap().get(&idx).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl CodeGenerator for FakeCoder {
    async fn generate(
        &self,
        _plan: &ScenePlan,
        scene_index: usize,
        _options: &JobOptions,
        ctx: &AttemptContext,
    ) -> Result<Generated<SceneCode>, StageError> {
        let generation = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(scene_index).or_insert(0);
            *n += 1;
            *n
        };
        self.guidance
            .lock()
            .unwrap()
            .push((scene_index, ctx.guidance.clone()));

        let class_name = format!("Scene{:02}", scene_index + 1);
        let code = format!(
            "from manim import *\n\n# generation {generation}\nclass {class_name}(Scene):\n    def construct(self):\n        self.play(Write(Text(\"step\")))\n"
        );
        Ok(Generated {
            value: SceneCode {
                scene_index,
                class_name,
                code,
                narration: format!("Narration for scene {}.", scene_index + 1),
            },
            usage: JobUsage {
                llm_calls: 1,
                input_tokens: 300,
                output_tokens: 150,
            },
        })
    }
}

/// Writes a small segment file per scene. Scenes listed in `code_failures`
/// are rejected as code-origin errors that many times (`u32::MAX` = always);
/// scenes in `resource_failures` always crash.
#[derive(Default)]
struct FakeRenderer {
    code_failures: Mutex<HashMap<usize, u32>>,
    resource_failures: Vec<usize>,
    calls: Mutex<Vec<usize>>,
}

impl FakeRenderer {
    fn rejecting(idx: usize, times: u32) -> Self {
        Self {
            code_failures: Mutex::new(HashMap::from([(idx, times)])),
            ..Default::default()
        }
    }

    fn crashing(idx: usize) -> Self {
        Self {
            resource_failures: vec![idx],
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render(&self, scene: &SceneCode, out_dir: &Path) -> Result<PathBuf, StageError> {
        let idx = scene.scene_index;
        self.calls.lock().unwrap().push(idx);

        if self.resource_failures.contains(&idx) {
            return Err(StageError::resource("renderer was killed by signal 9"));
        }
        {
            let mut failures = self.code_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&idx) {
                if *remaining > 0 {
                    *remaining = remaining.saturating_sub(1);
                    return Err(StageError::invalid(format!(
                        "Traceback (most recent call last):\nNameError: name 'Axes{idx}' is not defined"
                    )));
                }
            }
        }

        tokio::fs::create_dir_all(out_dir).await.unwrap();
        let path = out_dir.join(format!("scene_{:02}.mp4", idx + 1));
        tokio::fs::write(&path, format!("[{}]", idx + 1)).await.unwrap();
        Ok(path)
    }
}

#[derive(Default)]
struct FakeAssembler {
    segments: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl Assembler for FakeAssembler {
    async fn assemble(&self, segments: &[PathBuf], out: &Path) -> Result<PathBuf, StageError> {
        let mut video = Vec::new();
        for seg in segments {
            video.extend(tokio::fs::read(seg).await.unwrap());
        }
        tokio::fs::write(out, video).await.unwrap();
        *self.segments.lock().unwrap() = segments.to_vec();
        Ok(out.to_path_buf())
    }
}

// ── Test helpers ─────────────────────────────────────────────────────────────

struct Fakes {
    extractor: Arc<FakeExtractor>,
    planner: Arc<FakePlanner>,
    coder: Arc<FakeCoder>,
    renderer: Arc<FakeRenderer>,
    assembler: Arc<FakeAssembler>,
}

impl Fakes {
    fn new(planner: FakePlanner, renderer: FakeRenderer) -> Self {
        Self {
            extractor: Arc::new(FakeExtractor::default()),
            planner: Arc::new(planner),
            coder: Arc::new(FakeCoder::default()),
            renderer: Arc::new(renderer),
            assembler: Arc::new(FakeAssembler::default()),
        }
    }

    fn happy() -> Self {
        Self::new(FakePlanner::default(), FakeRenderer::default())
    }
}

/// Route library logs through the test harness; `RUST_LOG=debug` shows
/// every transition of a failing test.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(store: &Path, fakes: &Fakes) -> PipelineConfig {
    init_logging();
    PipelineConfig::builder()
        .store_dir(store)
        .max_llm_attempts(3)
        .backoff(Duration::from_millis(1), Duration::from_millis(5))
        .extractor(fakes.extractor.clone())
        .planner(fakes.planner.clone())
        .code_generator(fakes.coder.clone())
        .renderer(fakes.renderer.clone())
        .assembler(fakes.assembler.clone())
        .build()
        .expect("valid config")
}

async fn orchestrator(store: &Path, fakes: &Fakes) -> Orchestrator {
    Orchestrator::new(config(store, fakes))
        .await
        .expect("orchestrator should open the store")
}

fn pdf_bytes() -> Vec<u8> {
    b"%PDF-1.7\n1 0 obj << /Type /Catalog >> endobj\n%%EOF\n".to_vec()
}

async fn run_to_end(orch: &Orchestrator) -> (JobId, Job) {
    let id = orch
        .submit(pdf_bytes(), JobOptions::default())
        .await
        .expect("submit should accept a PDF");
    let job = tokio::time::timeout(Duration::from_secs(10), orch.wait(id))
        .await
        .expect("job should finish in time")
        .expect("job should be known");
    (id, job)
}

async fn versions(store: &ArtifactStore, slot: Slot) -> Vec<u32> {
    store.versions(slot).await.expect("versions readable")
}

// ── Happy path ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn five_scene_job_succeeds_in_order() {
    let dir = TempDir::new().unwrap();
    let fakes = Fakes::happy();
    let orch = orchestrator(dir.path(), &fakes).await;

    let (id, job) = run_to_end(&orch).await;

    assert_eq!(job.status, JobStatus::Succeeded, "job: {job:#?}");
    assert_eq!(job.current_stage, Some(Stage::Assemble));
    assert!(job.error.is_none());
    for stage in Stage::ALL {
        assert!(job.is_committed(stage), "{stage} should be committed");
    }

    let view = orch.progress(id).await.unwrap();
    assert_eq!(view.percent, 100);
    assert_eq!(view.message, "Video ready");

    let segments = fakes.assembler.segments.lock().unwrap().clone();
    let names: Vec<String> = segments
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        ["scene_01.mp4", "scene_02.mp4", "scene_03.mp4", "scene_04.mp4", "scene_05.mp4"]
    );

    let video = orch
        .store()
        .get::<FinalVideo>(id, Stage::Assemble)
        .await
        .unwrap()
        .payload;
    assert_eq!(std::fs::read(&video.path).unwrap(), b"[1][2][3][4][5]");

    // One plan call plus one codegen call per scene.
    assert_eq!(job.usage.llm_calls, 6);
    assert_eq!(job.usage.input_tokens, 1000 + 5 * 300);
    assert_eq!(fakes.coder.total_calls(), 5);
}

#[tokio::test]
async fn non_pdf_submission_is_rejected() {
    let dir = TempDir::new().unwrap();
    let fakes = Fakes::happy();
    let orch = orchestrator(dir.path(), &fakes).await;

    let err = assert_err!(
        orch.submit(b"<html>not a pdf</html>".to_vec(), JobOptions::default())
            .await
    );
    assert!(matches!(err, Pdf2VideoError::NotAPdf { .. }), "got {err:?}");
    assert!(orch.list_jobs().is_empty());
}

// ── Retries and failure routing ──────────────────────────────────────────────

#[tokio::test]
async fn short_plan_is_retried_with_guidance() {
    let dir = TempDir::new().unwrap();
    let fakes = Fakes::new(FakePlanner::scripted(&[2, 4]), FakeRenderer::default());
    let orch = orchestrator(dir.path(), &fakes).await;

    let (_, job) = run_to_end(&orch).await;

    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(fakes.planner.calls.load(Ordering::SeqCst), 2);

    let guidance = fakes.planner.guidance.lock().unwrap().clone();
    assert_eq!(guidance[0], None);
    let second = guidance[1].as_deref().expect("retry carries guidance");
    assert!(second.contains("2 scenes"), "guidance: {second}");

    let plan_attempts: Vec<_> = job.attempts_for(Stage::Plan).collect();
    assert_eq!(plan_attempts.len(), 2);
    assert_eq!(plan_attempts[0].outcome, AttemptOutcome::Failure);
    assert_eq!(plan_attempts[0].error_kind, Some(ErrorKind::ValidationError));
    assert_eq!(plan_attempts[1].outcome, AttemptOutcome::Success);

    assert_eq!(fakes.renderer.calls().len(), 4);
}

#[tokio::test]
async fn broken_scene_exhausts_codegen_and_keeps_other_artifacts() {
    let dir = TempDir::new().unwrap();
    let fakes = Fakes::new(FakePlanner::default(), FakeRenderer::rejecting(2, u32::MAX));
    let orch = orchestrator(dir.path(), &fakes).await;

    let (id, job) = run_to_end(&orch).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.current_stage, Some(Stage::Codegen));
    let err = job.error.as_ref().expect("failed job carries an error");
    assert_eq!(err.stage, Stage::Codegen);
    assert_eq!(err.kind, ErrorKind::ValidationError);

    // Initial generation plus two regenerations, nothing more.
    assert_eq!(fakes.coder.calls_for(2), 3);
    assert_eq!(fakes.coder.calls_for(0), 1);
    assert_eq!(fakes.coder.calls_for(3), 1);

    let guidance = fakes.coder.guidance.lock().unwrap().clone();
    let regen: Vec<_> = guidance.iter().filter(|(idx, g)| *idx == 2 && g.is_some()).collect();
    assert_eq!(regen.len(), 2);
    assert!(regen[0].1.as_deref().unwrap().contains("Axes2"));

    // Other scenes and earlier stages stay committed.
    let store = orch.store();
    assert!(job.is_committed(Stage::Extract));
    assert!(job.is_committed(Stage::Plan));
    assert!(job.is_committed(Stage::Codegen));
    assert!(!job.is_committed(Stage::Render));
    assert_eq!(versions(store, Slot::scene(id, Stage::Render, 0)).await, vec![1]);
    assert_eq!(versions(store, Slot::scene(id, Stage::Render, 1)).await, vec![1]);
    assert!(versions(store, Slot::scene(id, Stage::Render, 2)).await.is_empty());
    assert_eq!(
        versions(store, Slot::scene(id, Stage::Codegen, 2)).await,
        vec![1, 2, 3]
    );

    let view = orch.progress(id).await.unwrap();
    assert!(view.percent < 100);
    assert_eq!(view.error_kind, Some(ErrorKind::ValidationError));
}

#[tokio::test]
async fn one_render_rejection_regenerates_that_scene_only() {
    let dir = TempDir::new().unwrap();
    let fakes = Fakes::new(FakePlanner::default(), FakeRenderer::rejecting(1, 1));
    let orch = orchestrator(dir.path(), &fakes).await;

    let (id, job) = run_to_end(&orch).await;

    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(fakes.coder.calls_for(1), 2);
    assert_eq!(fakes.coder.total_calls(), 6);

    let store = orch.store();
    assert_eq!(versions(store, Slot::scene(id, Stage::Codegen, 1)).await, vec![1, 2]);
    assert_eq!(versions(store, Slot::scene(id, Stage::Codegen, 0)).await, vec![1]);

    let segment = store
        .get_scene::<RenderedSegment>(id, Stage::Render, 1)
        .await
        .unwrap()
        .payload;
    assert_eq!(segment.code_version, 2);
}

#[tokio::test]
async fn auth_error_fails_without_retry_and_hides_key() {
    let dir = TempDir::new().unwrap();
    let planner = FakePlanner::failing(StageError::auth(
        "401 Unauthorized: invalid api key sk-proj-abcdefghijklmnop1234",
    ));
    let fakes = Fakes::new(planner, FakeRenderer::default());
    let orch = orchestrator(dir.path(), &fakes).await;

    let (id, job) = run_to_end(&orch).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(fakes.planner.calls.load(Ordering::SeqCst), 1);
    let err = job.error.as_ref().unwrap();
    assert_eq!((err.stage, err.kind), (Stage::Plan, ErrorKind::AuthError));
    assert!(!err.retryable);
    assert!(!err.message.contains("abcdefghijklmnop"), "leaked: {}", err.message);

    let view = orch.progress(id).await.unwrap();
    assert_eq!(view.message, "Failed during planning scenes (AuthError)");
    assert_eq!(fakes.coder.total_calls(), 0);
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_during_plan_stops_before_codegen() {
    let dir = TempDir::new().unwrap();
    let (planner, entered, gate) = FakePlanner::gated();
    let fakes = Fakes::new(planner, FakeRenderer::default());
    let orch = orchestrator(dir.path(), &fakes).await;

    let id = orch.submit(pdf_bytes(), JobOptions::default()).await.unwrap();
    entered.acquire().await.unwrap().forget();

    let requested = assert_ok!(orch.cancel(id).await);
    assert!(requested.cancel_requested);
    assert_eq!(requested.status, JobStatus::Running);

    gate.add_permits(1);
    let job = orch.wait(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.current_stage, Some(Stage::Plan));
    assert!(job.is_committed(Stage::Plan), "stage in flight still commits");
    assert!(!job.is_committed(Stage::Codegen));
    assert_eq!(fakes.coder.total_calls(), 0);

    // Terminal jobs are left alone.
    let again = assert_ok!(orch.cancel(id).await);
    assert_eq!(again.status, JobStatus::Cancelled);
    let err = assert_err!(orch.resume(id).await);
    assert!(matches!(err, Pdf2VideoError::JobNotResumable { .. }));
}

#[tokio::test]
async fn run_slots_bound_concurrent_jobs() {
    let dir = TempDir::new().unwrap();
    let (planner, entered, gate) = FakePlanner::gated();
    let fakes = Fakes::new(planner, FakeRenderer::default());
    let mut cfg = config(dir.path(), &fakes);
    cfg.max_concurrent_jobs = 1;
    let orch = Orchestrator::new(cfg).await.unwrap();

    let first = orch.submit(pdf_bytes(), JobOptions::default()).await.unwrap();
    let second = orch.submit(pdf_bytes(), JobOptions::default()).await.unwrap();
    entered.acquire().await.unwrap().forget();

    let waiting = orch.get_status(second).await.unwrap();
    assert_eq!(waiting.status, JobStatus::Queued);
    assert_eq!(orch.progress(second).await.unwrap().percent, 0);
    assert_eq!(orch.get_status(first).await.unwrap().status, JobStatus::Running);

    gate.add_permits(2);
    assert_eq!(orch.wait(first).await.unwrap().status, JobStatus::Succeeded);
    assert_eq!(orch.wait(second).await.unwrap().status, JobStatus::Succeeded);
    assert_eq!(orch.list_jobs().len(), 2);
}

#[tokio::test]
async fn cancel_waiting_for_run_slot_takes_effect_when_slot_frees() {
    let dir = TempDir::new().unwrap();
    let (planner, entered, gate) = FakePlanner::gated();
    let fakes = Fakes::new(planner, FakeRenderer::default());
    let mut cfg = config(dir.path(), &fakes);
    cfg.max_concurrent_jobs = 1;
    let orch = Orchestrator::new(cfg).await.unwrap();

    let first = orch.submit(pdf_bytes(), JobOptions::default()).await.unwrap();
    let second = orch.submit(pdf_bytes(), JobOptions::default()).await.unwrap();
    entered.acquire().await.unwrap().forget();

    // The queued job already belongs to a task, so the cancel is recorded
    // and honoured once that task gets a slot.
    let requested = assert_ok!(orch.cancel(second).await);
    assert_eq!(requested.status, JobStatus::Queued);
    assert!(requested.cancel_requested);

    gate.add_permits(1);
    assert_eq!(orch.wait(first).await.unwrap().status, JobStatus::Succeeded);
    let job = orch.wait(second).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.artifacts.is_empty());
    assert_eq!(fakes.extractor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_during_last_stage_keeps_success() {
    let dir = TempDir::new().unwrap();
    let fakes = Fakes::happy();
    let orch = orchestrator(dir.path(), &fakes).await;

    for _ in 0..25 {
        let id = orch.submit(pdf_bytes(), JobOptions::default()).await.unwrap();
        let mut rx = orch.registry().subscribe(id).unwrap();
        rx.wait_for(|j| j.current_stage == Some(Stage::Assemble) || j.is_terminal())
            .await
            .unwrap();

        let canceller = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.cancel(id).await })
        };
        let job = orch.wait(id).await.unwrap();
        let cancel_view = assert_ok!(canceller.await.unwrap());

        assert_eq!(job.status, JobStatus::Succeeded, "job: {job:#?}");
        assert!(cancel_view.status != JobStatus::Cancelled);
        assert_eq!(orch.get_status(id).await.unwrap().status, JobStatus::Succeeded);
        let on_disk = orch.store().load_job(id).await.unwrap();
        assert_eq!(on_disk.status, JobStatus::Succeeded);

        let err = assert_err!(orch.resume(id).await);
        assert!(matches!(err, Pdf2VideoError::JobNotResumable { .. }));
    }
}

#[tokio::test]
async fn forget_evicts_only_finished_jobs() {
    let dir = TempDir::new().unwrap();
    let fakes = Fakes::happy();
    let orch = orchestrator(dir.path(), &fakes).await;
    let (id, _) = run_to_end(&orch).await;

    assert!(!orch.forget(JobId::new()).await);
    assert!(orch.forget(id).await);
    assert!(orch.list_jobs().is_empty());

    // The record is still in the store and loads again on demand.
    let job = orch.get_status(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(orch.list_jobs().len(), 1);
}

// ── Resume and recovery ──────────────────────────────────────────────────────

#[tokio::test]
async fn resume_after_restart_reuses_committed_work() {
    let dir = TempDir::new().unwrap();

    // First process: scene 2 crashes the renderer every time.
    let first = Fakes::new(FakePlanner::default(), FakeRenderer::crashing(1));
    let id = {
        let orch = orchestrator(dir.path(), &first).await;
        let (id, job) = run_to_end(&orch).await;
        assert_eq!(job.status, JobStatus::Failed);
        let err = job.error.as_ref().unwrap();
        assert_eq!((err.stage, err.kind), (Stage::Render, ErrorKind::ResourceError));
        id
    };

    // Second process over the same store, with a healthy renderer.
    let second = Fakes::happy();
    let orch = orchestrator(dir.path(), &second).await;
    assert_eq!(orch.get_status(id).await.unwrap().status, JobStatus::Failed);

    orch.resume(id).await.unwrap();
    let job = orch.wait(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Succeeded, "job: {job:#?}");
    assert_eq!(second.extractor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(second.planner.calls.load(Ordering::SeqCst), 0);
    assert_eq!(second.coder.total_calls(), 0);
    // Scene 1 was rendered by the first process and is reused.
    assert_eq!(second.renderer.calls(), vec![1, 2, 3, 4]);
    assert_eq!(
        versions(orch.store(), Slot::scene(id, Stage::Render, 0)).await,
        vec![1]
    );
    // History from the first run is kept.
    assert!(job
        .attempts_for(Stage::Render)
        .any(|a| a.error_kind == Some(ErrorKind::ResourceError)));
}

#[tokio::test]
async fn recover_picks_up_interrupted_jobs() {
    let dir = TempDir::new().unwrap();
    let fakes = Fakes::happy();

    // A record left behind by a process that died during Plan.
    let id = JobId::new();
    {
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let input = store.save_input(id, pdf_bytes()).await.unwrap();
        let doc = FakeExtractor::default()
            .extract(&input, dir.path())
            .await
            .unwrap();
        let extracted = store.put(id, Stage::Extract, &doc).await.unwrap();

        let mut job = Job::new(id, input, JobOptions::default());
        job.status = JobStatus::Running;
        job.current_stage = Some(Stage::Plan);
        job.artifacts.insert(Stage::Extract, extracted);
        store.save_job(&job).await.unwrap();

        let mut done = Job::new(JobId::new(), PathBuf::from("x.pdf"), JobOptions::default());
        done.status = JobStatus::Succeeded;
        store.save_job(&done).await.unwrap();
    }

    let orch = orchestrator(dir.path(), &fakes).await;
    let resumed = orch.recover().await.unwrap();
    assert_eq!(resumed, vec![id]);

    let job = orch.wait(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(fakes.extractor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(fakes.planner.calls.load(Ordering::SeqCst), 1);
    assert_eq!(orch.list_jobs().len(), 2);
}

// ── Observation ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn progress_stream_is_monotone_and_ends() {
    let dir = TempDir::new().unwrap();
    let fakes = Fakes::new(FakePlanner::default(), FakeRenderer::rejecting(3, 1));
    let orch = orchestrator(dir.path(), &fakes).await;

    let id = orch.submit(pdf_bytes(), JobOptions::default()).await.unwrap();
    let views: Vec<_> = tokio::time::timeout(
        Duration::from_secs(10),
        orch.subscribe(id).await.unwrap().collect::<Vec<_>>(),
    )
    .await
    .expect("stream should end once the job is terminal");

    assert!(!views.is_empty());
    for pair in views.windows(2) {
        assert!(
            pair[0].percent <= pair[1].percent,
            "percent went down: {} -> {}",
            pair[0].percent,
            pair[1].percent
        );
    }
    let last = views.last().unwrap();
    assert_eq!(last.status, JobStatus::Succeeded);
    assert_eq!(last.percent, 100);
    assert!(views[..views.len() - 1].iter().all(|v| v.percent < 100));
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let dir = TempDir::new().unwrap();
    let fakes = Fakes::happy();
    let orch = orchestrator(dir.path(), &fakes).await;

    let err = orch.get_status(JobId::new()).await.unwrap_err();
    assert!(matches!(err, Pdf2VideoError::JobNotFound { .. }), "got {err:?}");
}
