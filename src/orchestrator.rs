//! Pipeline orchestrator: the per-job state machine.
//!
//! ```text
//! Queued ──▶ Running(Extract) ──▶ Running(Plan) ──▶ Running(Codegen)
//!        ──▶ Running(Render) ──▶ Running(Assemble) ──▶ Succeeded
//!
//! Running(any) ── retries exhausted / non-recoverable ──▶ Failed
//! Running(any) ── cancel requested (between stages) ───▶ Cancelled
//! ```
//!
//! Every job runs on its own tokio task; stages within a job run strictly
//! in order and stage N+1 only starts after stage N's artifact is durably
//! committed. At most `max_concurrent_jobs` jobs hold a run slot at once.
//!
//! Terminal states are final. Every terminal transition, and every
//! [`Orchestrator::cancel`] / [`Orchestrator::resume`] decision, happens
//! under one control lock, so a cancel racing a job's last stage can never
//! rewrite a `Succeeded` record.
//!
//! ## Per-scene isolation
//!
//! Codegen and Render work scene by scene and commit one artifact per scene
//! as well as the stage-level aggregate. When the renderer rejects the code
//! of scene *k*, only scene *k* is regenerated (with the renderer error as
//! guidance) and re-rendered. Regeneration shares Codegen's attempt budget
//! for that scene; when it runs out the job fails in Codegen with a
//! `ValidationError`, and every other committed artifact stays in place.

use crate::artifact::{
    ArtifactRef, ExtractedDocument, FinalVideo, GeneratedCode, RenderedScenes, RenderedSegment,
    SceneCode, ScenePlan,
};
use crate::config::PipelineConfig;
use crate::error::{Pdf2VideoError, StageError};
use crate::executor::{retry_guidance, StageCall, StageExecutor};
use crate::job::{Job, JobError, JobId, JobOptions, JobStatus, JobUsage, Stage, StageAttempt};
use crate::pipeline::{input, Collaborators};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::registry::JobRegistry;
use crate::status::{self, ProgressView};
use crate::store::{ArtifactStore, Slot};
use crate::stream::{watch_progress, ProgressStream};
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tracing::{debug, error, info, warn};

/// Why a drive loop stopped short of success.
#[derive(Debug)]
struct StageFailure {
    stage: Stage,
    error: StageError,
}

impl StageFailure {
    fn new(stage: Stage, error: StageError) -> Self {
        Self { stage, error }
    }

    /// Store or bookkeeping failure while running `stage`.
    fn infra(stage: Stage) -> impl Fn(Pdf2VideoError) -> StageFailure {
        move |e| StageFailure::new(stage, StageError::resource(e.to_string()))
    }
}

enum DriveOutcome {
    Succeeded,
    Cancelled,
    Failed(StageFailure),
}

/// Per-drive bookkeeping that does not belong on the persisted job.
#[derive(Default)]
struct DriveState {
    /// Codegen attempts spent per scene in this drive.
    codegen_attempts: HashMap<usize, u32>,
}

struct Inner {
    config: PipelineConfig,
    store: ArtifactStore,
    registry: JobRegistry,
    executor: StageExecutor,
    collaborators: Collaborators,
    callback: ProgressCallback,
    run_slots: Arc<Semaphore>,
    /// Jobs owned by a spawned task, from spawn until their terminal status
    /// is published.
    active: Mutex<HashSet<JobId>>,
    /// Held across terminal transitions and cancel/resume decisions.
    control: AsyncMutex<()>,
}

/// Entry point for submitting and observing jobs.
///
/// Cheap to clone; all clones share one registry, store and run-slot pool.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.inner.store.root())
            .field("registry", &self.inner.registry)
            .finish()
    }
}

impl Orchestrator {
    /// Open the artifact store and build the collaborators from `config`.
    pub async fn new(config: PipelineConfig) -> Result<Self, Pdf2VideoError> {
        let store = ArtifactStore::open(&config.store_dir).await?;
        let collaborators = Collaborators::from_config(&config);
        let callback = config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback));
        let run_slots = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let executor = StageExecutor::new(config.policies.clone());

        info!(
            "Orchestrator ready: store={}, max_concurrent_jobs={}",
            store.root().display(),
            config.max_concurrent_jobs
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                registry: JobRegistry::new(),
                executor,
                collaborators,
                callback,
                run_slots,
                active: Mutex::new(HashSet::new()),
                control: AsyncMutex::new(()),
            }),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    // ── Submission ───────────────────────────────────────────────────────

    /// Accept a PDF, persist it and schedule a new job.
    pub async fn submit(&self, pdf: Vec<u8>, options: JobOptions) -> Result<JobId, Pdf2VideoError> {
        input::check_pdf_magic("upload", &pdf)?;

        let job_id = JobId::new();
        let input = self.inner.store.save_input(job_id, pdf).await?;
        let job = Job::new(job_id, input, options);
        self.inner.store.save_job(&job).await?;
        self.inner.registry.insert(job);

        info!("Job {} queued", job_id);
        self.inner.callback.on_job_queued(job_id);
        self.spawn(job_id, false);
        Ok(job_id)
    }

    /// Read a local path or download an HTTP(S) URL, then [`submit`](Self::submit) it.
    pub async fn submit_path(&self, path_or_url: &str, options: JobOptions) -> Result<JobId, Pdf2VideoError> {
        let resolved =
            input::resolve_input(path_or_url, self.inner.config.download_timeout_secs).await?;
        let mut options = options;
        if options.title.is_none() {
            options.title = title_from_source(&resolved.source_name);
        }
        self.submit(resolved.bytes, options).await
    }

    // ── Observation ──────────────────────────────────────────────────────

    /// Snapshot of a job, loading it from the store if this process has not
    /// seen it yet.
    pub async fn get_status(&self, job_id: JobId) -> Result<Job, Pdf2VideoError> {
        self.ensure_loaded(job_id).await?;
        self.inner.registry.snapshot(job_id)
    }

    pub async fn progress(&self, job_id: JobId) -> Result<ProgressView, Pdf2VideoError> {
        Ok(status::render(&self.get_status(job_id).await?))
    }

    /// Stream of progress views, ending after the first terminal one.
    pub async fn subscribe(&self, job_id: JobId) -> Result<ProgressStream, Pdf2VideoError> {
        self.ensure_loaded(job_id).await?;
        Ok(watch_progress(self.inner.registry.subscribe(job_id)?))
    }

    /// Resolve once the job is Succeeded, Failed or Cancelled.
    pub async fn wait(&self, job_id: JobId) -> Result<Job, Pdf2VideoError> {
        self.ensure_loaded(job_id).await?;
        self.inner.registry.wait(job_id).await
    }

    /// Every job known to this process, oldest first.
    pub fn list_jobs(&self) -> Vec<Job> {
        self.inner.registry.list()
    }

    async fn ensure_loaded(&self, job_id: JobId) -> Result<(), Pdf2VideoError> {
        if !self.inner.registry.contains(job_id) {
            let job = self.inner.store.load_job(job_id).await?;
            self.inner.registry.insert(job);
        }
        Ok(())
    }

    // ── Control ──────────────────────────────────────────────────────────

    /// Request cooperative cancellation.
    ///
    /// A job owned by a task (running, or queued for a run slot) finishes
    /// its current stage and stops before the next one. A job nobody owns
    /// is cancelled on the spot. Terminal jobs are returned unchanged.
    pub async fn cancel(&self, job_id: JobId) -> Result<Job, Pdf2VideoError> {
        self.ensure_loaded(job_id).await?;
        let _control = self.inner.control.lock().await;

        let current = self.inner.registry.snapshot(job_id)?;
        if current.is_terminal() {
            return Ok(current);
        }
        let job = self.inner.registry.update(job_id, |j| {
            j.cancel_requested = true;
            j.message = "Cancellation requested".to_string();
        })?;
        info!("Job {}: cancellation requested", job_id);

        if self.is_active(job_id) {
            self.persist(job_id).await;
            Ok(job)
        } else {
            self.finish_locked(job_id, DriveOutcome::Cancelled).await
        }
    }

    /// Drive a Failed, Queued or interrupted job again from its persisted
    /// state. Committed artifacts are reused, not recomputed.
    pub async fn resume(&self, job_id: JobId) -> Result<(), Pdf2VideoError> {
        self.ensure_loaded(job_id).await?;
        let _control = self.inner.control.lock().await;

        let job = self.inner.registry.snapshot(job_id)?;
        if matches!(job.status, JobStatus::Succeeded | JobStatus::Cancelled) {
            return Err(Pdf2VideoError::JobNotResumable {
                job_id,
                status: job.status,
            });
        }
        if self.is_active(job_id) {
            debug!("Job {} is already being driven", job_id);
            return Ok(());
        }

        self.inner.registry.update(job_id, |j| {
            j.status = JobStatus::Queued;
            j.error = None;
            j.message = "Waiting to resume".to_string();
        })?;
        self.persist(job_id).await;

        info!("Job {} resuming", job_id);
        self.spawn(job_id, true);
        Ok(())
    }

    /// Load every persisted job and resume the ones that were Queued or
    /// Running when the previous process stopped. Returns the resumed ids.
    pub async fn recover(&self) -> Result<Vec<JobId>, Pdf2VideoError> {
        let mut resumed = Vec::new();
        for job in self.inner.store.load_jobs().await? {
            let job_id = job.id;
            if self.is_active(job_id) {
                continue;
            }
            let interrupted = matches!(job.status, JobStatus::Queued | JobStatus::Running);
            let cancel = job.cancel_requested;
            self.inner.registry.insert(job);

            if !interrupted {
                continue;
            }
            if cancel {
                self.finish(job_id, DriveOutcome::Cancelled).await?;
                continue;
            }
            self.resume(job_id).await?;
            resumed.push(job_id);
        }
        if !resumed.is_empty() {
            info!("Recovered {} interrupted job(s)", resumed.len());
        }
        Ok(resumed)
    }

    /// Drop a terminal job from memory. Its record and artifacts stay in
    /// the store, so later queries load it again. Returns `false` for jobs
    /// that are unknown or not yet terminal.
    pub async fn forget(&self, job_id: JobId) -> bool {
        let _control = self.inner.control.lock().await;
        let terminal = matches!(self.inner.registry.snapshot(job_id), Ok(j) if j.is_terminal());
        if !terminal || self.is_active(job_id) {
            return false;
        }
        self.inner.registry.remove(job_id).is_some()
    }

    // ── Task management ──────────────────────────────────────────────────

    fn lock_active(&self) -> MutexGuard<'_, HashSet<JobId>> {
        match self.inner.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Active-job lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn is_active(&self, job_id: JobId) -> bool {
        self.lock_active().contains(&job_id)
    }

    fn spawn(&self, job_id: JobId, resumed: bool) {
        if !self.lock_active().insert(job_id) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let slot = Arc::clone(&this.inner.run_slots).acquire_owned().await;
            let _slot = match slot {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Job {}: run slot unavailable: {}", job_id, e);
                    this.lock_active().remove(&job_id);
                    return;
                }
            };

            let driver = this.clone();
            let handle = tokio::spawn(async move { driver.drive(job_id, resumed).await });
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let stage = this
                        .inner
                        .registry
                        .snapshot(job_id)
                        .ok()
                        .and_then(|j| j.current_stage)
                        .unwrap_or(Stage::Extract);
                    DriveOutcome::Failed(StageFailure::new(
                        stage,
                        StageError::resource(format!("pipeline task panicked: {e}")),
                    ))
                }
            };
            if let Err(e) = this.finish(job_id, outcome).await {
                error!("Job {}: could not record final status: {}", job_id, e);
                this.lock_active().remove(&job_id);
            }
        });
    }

    // ── Drive loop ───────────────────────────────────────────────────────

    async fn drive(&self, job_id: JobId, resumed: bool) -> DriveOutcome {
        let mut state = DriveState::default();
        for stage in Stage::ALL {
            match self.inner.registry.snapshot(job_id) {
                Ok(job) if job.cancel_requested => return DriveOutcome::Cancelled,
                Ok(_) => {}
                Err(e) => return DriveOutcome::Failed(StageFailure::infra(stage)(e)),
            }

            if resumed {
                match self.inner.store.latest_ref(job_id, stage).await {
                    Ok(Some(existing)) => {
                        info!("Job {}: {} already committed, skipping", job_id, stage);
                        self.record(job_id, stage, existing).await;
                        self.inner.callback.on_stage_skipped(job_id, stage);
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => return DriveOutcome::Failed(StageFailure::infra(stage)(e)),
                }
            }

            if let Err(f) = self.enter_stage(job_id, stage, resumed).await {
                return DriveOutcome::Failed(f);
            }

            let result = match stage {
                Stage::Extract => self.run_extract(job_id).await,
                Stage::Plan => self.run_plan(job_id).await,
                Stage::Codegen => self.run_codegen(job_id, resumed, &mut state).await,
                Stage::Render => self.run_render(job_id, resumed, &mut state).await,
                Stage::Assemble => self.run_assemble(job_id).await,
            };
            match result {
                Ok(reference) => {
                    self.record(job_id, stage, reference.clone()).await;
                    self.inner.callback.on_stage_complete(job_id, stage, &reference);
                }
                Err(failure) => return DriveOutcome::Failed(failure),
            }
        }
        DriveOutcome::Succeeded
    }

    async fn enter_stage(&self, job_id: JobId, stage: Stage, resumed: bool) -> Result<(), StageFailure> {
        self.inner
            .registry
            .update(job_id, |j| {
                j.status = JobStatus::Running;
                j.current_stage = Some(stage);
                j.message = stage.activity().to_string();
            })
            .map_err(StageFailure::infra(stage))?;
        self.persist(job_id).await;
        info!("Job {}: {}", job_id, stage.activity());
        self.inner.callback.on_stage_start(job_id, stage, resumed);
        Ok(())
    }

    /// Point the job at a committed stage artifact and persist the record.
    async fn record(&self, job_id: JobId, stage: Stage, reference: ArtifactRef) {
        let result = self.inner.registry.update(job_id, |j| {
            j.artifacts.insert(stage, reference);
            if let Some(p) = j.stage_progress.get_mut(&stage) {
                p.done = p.total;
            }
        });
        if let Err(e) = result {
            warn!("Job {}: could not record {} artifact: {}", job_id, stage, e);
        }
        self.persist(job_id).await;
    }

    async fn finish(&self, job_id: JobId, outcome: DriveOutcome) -> Result<Job, Pdf2VideoError> {
        let _control = self.inner.control.lock().await;
        self.finish_locked(job_id, outcome).await
    }

    /// Make the outcome durable, release the job's run marker, then publish
    /// the terminal state to waiters and subscribers. A job that is already
    /// terminal is left as it is. Caller holds the control lock.
    async fn finish_locked(&self, job_id: JobId, outcome: DriveOutcome) -> Result<Job, Pdf2VideoError> {
        let current = self.inner.registry.snapshot(job_id)?;
        if current.is_terminal() {
            self.lock_active().remove(&job_id);
            debug!("Job {} already {}, keeping it", job_id, current.status);
            return Ok(current);
        }

        let mut terminal = current;
        apply_outcome(&mut terminal, &outcome);
        if let Err(e) = self.inner.store.save_job(&terminal).await {
            warn!("Job {}: could not persist final status: {}", job_id, e);
        }
        let job = {
            let mut active = self.lock_active();
            active.remove(&job_id);
            self.inner.registry.update(job_id, |j| {
                if !j.is_terminal() {
                    apply_outcome(j, &outcome);
                }
            })?
        };

        match &outcome {
            DriveOutcome::Succeeded => info!("Job {} succeeded", job_id),
            DriveOutcome::Cancelled => info!("Job {} cancelled", job_id),
            DriveOutcome::Failed(f) => warn!(
                "Job {} failed in {} ({}): {}",
                job_id,
                f.stage,
                f.error.kind(),
                status::sanitize_message(f.error.message())
            ),
        }

        self.inner.callback.on_job_finished(job_id, job.status);
        Ok(job)
    }

    // ── Stages ───────────────────────────────────────────────────────────

    async fn run_extract(&self, job_id: JobId) -> Result<ArtifactRef, StageFailure> {
        let stage = Stage::Extract;
        let infra = StageFailure::infra(stage);
        let job = self.inner.registry.snapshot(job_id).map_err(&infra)?;
        let media = self.inner.store.media_dir(job_id, stage).await.map_err(&infra)?;
        let extractor = &self.inner.collaborators.extractor;
        let (input, media) = (&job.input, &media);

        let mut sink = self.attempt_sink(job_id);
        let run = self
            .inner
            .executor
            .run(
                StageCall::stage(stage),
                |_ctx| async move { extractor.extract(input, media).await },
                ExtractedDocument::validate,
                &mut sink,
            )
            .await;
        let doc = run.result.map_err(|e| StageFailure::new(stage, e))?;

        info!(
            "Job {}: extracted {} pages, {} sections, {} figures",
            job_id,
            doc.page_count,
            doc.sections.len(),
            doc.figures.len()
        );
        self.inner.store.put(job_id, stage, &doc).await.map_err(&infra)
    }

    async fn run_plan(&self, job_id: JobId) -> Result<ArtifactRef, StageFailure> {
        let stage = Stage::Plan;
        let infra = StageFailure::infra(stage);
        let job = self.inner.registry.snapshot(job_id).map_err(&infra)?;
        let doc: ExtractedDocument = self.latest(job_id, Stage::Extract).await.map_err(&infra)?;
        let planner = &self.inner.collaborators.planner;
        let allowed = self.inner.config.scene_range();
        let (doc, options) = (&doc, &job.options);

        let mut sink = self.attempt_sink(job_id);
        let run = self
            .inner
            .executor
            .run(
                StageCall::stage(stage),
                |ctx| async move {
                    let generated = planner.plan(doc, options, &ctx).await?;
                    self.add_usage(job_id, generated.usage);
                    Ok::<_, StageError>(generated.value)
                },
                |plan: &ScenePlan| plan.validate(allowed.clone()),
                &mut sink,
            )
            .await;
        let plan = run.result.map_err(|e| StageFailure::new(stage, e))?;

        info!("Job {}: planned {} scenes", job_id, plan.scenes.len());
        self.inner.store.put(job_id, stage, &plan).await.map_err(&infra)
    }

    async fn run_codegen(
        &self,
        job_id: JobId,
        resumed: bool,
        state: &mut DriveState,
    ) -> Result<ArtifactRef, StageFailure> {
        let stage = Stage::Codegen;
        let infra = StageFailure::infra(stage);
        let plan: ScenePlan = self.latest(job_id, Stage::Plan).await.map_err(&infra)?;
        let total = plan.scenes.len();
        self.advance(job_id, stage, 0, total);

        let mut scenes = Vec::with_capacity(total);
        let mut versions = Vec::with_capacity(total);
        for idx in 0..total {
            let reused = if resumed {
                self.latest_scene::<SceneCode>(job_id, stage, idx)
                    .await
                    .map_err(&infra)?
            } else {
                None
            };

            let (code, version) = match reused {
                Some(found) => {
                    debug!("Job {}: reusing code for scene {}", job_id, idx + 1);
                    found
                }
                None => {
                    let (code, version, used) = self
                        .generate_scene(job_id, &plan, idx, StageCall::scene(stage, idx))
                        .await?;
                    state.codegen_attempts.insert(idx, used);
                    (code, version)
                }
            };
            scenes.push(code);
            versions.push(version);
            self.advance(job_id, stage, idx + 1, total);
        }

        self.inner
            .store
            .put(job_id, stage, &GeneratedCode { scenes, versions })
            .await
            .map_err(&infra)
    }

    /// Generate and commit the code of one scene. Returns the code, its
    /// per-scene version and the attempts spent on the scene so far.
    async fn generate_scene(
        &self,
        job_id: JobId,
        plan: &ScenePlan,
        idx: usize,
        call: StageCall,
    ) -> Result<(SceneCode, u32, u32), StageFailure> {
        let stage = Stage::Codegen;
        let job = self
            .inner
            .registry
            .snapshot(job_id)
            .map_err(StageFailure::infra(stage))?;
        let generator = &self.inner.collaborators.code_generator;
        let options = &job.options;

        let mut sink = self.attempt_sink(job_id);
        let run = self
            .inner
            .executor
            .run(
                call,
                |ctx| async move {
                    let generated = generator.generate(plan, idx, options, &ctx).await?;
                    self.add_usage(job_id, generated.usage);
                    let mut code = generated.value;
                    code.scene_index = idx;
                    Ok::<_, StageError>(code)
                },
                SceneCode::validate,
                &mut sink,
            )
            .await;
        let used = run.attempts_used;
        let code = run.result.map_err(|e| StageFailure::new(stage, e))?;

        let reference = self
            .inner
            .store
            .put_scene(job_id, stage, idx, &code)
            .await
            .map_err(StageFailure::infra(stage))?;
        Ok((code, reference.version, used))
    }

    async fn run_render(
        &self,
        job_id: JobId,
        resumed: bool,
        state: &mut DriveState,
    ) -> Result<ArtifactRef, StageFailure> {
        let stage = Stage::Render;
        let infra = StageFailure::infra(stage);
        let plan: ScenePlan = self.latest(job_id, Stage::Plan).await.map_err(&infra)?;
        let mut generated: GeneratedCode = self.latest(job_id, Stage::Codegen).await.map_err(&infra)?;
        let media = self.inner.store.media_dir(job_id, stage).await.map_err(&infra)?;
        let codegen_budget = self.inner.executor.policy(Stage::Codegen).max_attempts;
        let total = generated.scenes.len();
        self.advance(job_id, stage, 0, total);

        let mut segments = Vec::with_capacity(total);
        for idx in 0..total {
            if resumed {
                let existing = self
                    .latest_scene::<RenderedSegment>(job_id, stage, idx)
                    .await
                    .map_err(&infra)?;
                if let Some((seg, _)) = existing {
                    let on_disk = tokio::fs::try_exists(&seg.media).await.unwrap_or(false);
                    if seg.code_version == generated.versions[idx] && on_disk {
                        debug!("Job {}: reusing render of scene {}", job_id, idx + 1);
                        segments.push(seg);
                        self.advance(job_id, stage, idx + 1, total);
                        continue;
                    }
                }
            }

            let segment = loop {
                let scene = &generated.scenes[idx];
                let media = &media;
                let renderer = &self.inner.collaborators.renderer;

                let mut sink = self.attempt_sink(job_id);
                let run = self
                    .inner
                    .executor
                    .run(
                        StageCall::scene(stage, idx),
                        |_ctx| async move { renderer.render(scene, media).await },
                        |_path: &PathBuf| Ok(()),
                        &mut sink,
                    )
                    .await;

                match run.result {
                    Ok(path) => {
                        break RenderedSegment {
                            scene_index: idx,
                            media: path,
                            code_version: generated.versions[idx],
                        }
                    }
                    // The renderer rejected the code itself: back to Codegen.
                    Err(StageError::Validation { message, .. }) => {
                        let used = state.codegen_attempts.get(&idx).copied().unwrap_or(0);
                        if used >= codegen_budget {
                            return Err(StageFailure::new(
                                Stage::Codegen,
                                StageError::validation(format!(
                                    "scene {} still fails to render after {} code generations: {}",
                                    idx + 1,
                                    used,
                                    message
                                )),
                            ));
                        }
                        warn!(
                            "Job {}: scene {} failed to render, regenerating ({}/{} codegen attempts used)",
                            job_id,
                            idx + 1,
                            used,
                            codegen_budget
                        );
                        let _ = self.inner.registry.update(job_id, |j| {
                            j.message = format!("Regenerating scene {} after render failure", idx + 1);
                        });
                        let call = StageCall::scene(Stage::Codegen, idx)
                            .with_attempts_used(used)
                            .with_guidance(retry_guidance(&format!(
                                "the renderer rejected this scene's code:\n{message}"
                            )));
                        let (code, version, used) = self.generate_scene(job_id, &plan, idx, call).await?;
                        state.codegen_attempts.insert(idx, used);

                        generated.scenes[idx] = code;
                        generated.versions[idx] = version;
                        let reference = self
                            .inner
                            .store
                            .put(job_id, Stage::Codegen, &generated)
                            .await
                            .map_err(StageFailure::infra(Stage::Codegen))?;
                        let _ = self.inner.registry.update(job_id, |j| {
                            j.artifacts.insert(Stage::Codegen, reference);
                        });
                        self.persist(job_id).await;
                    }
                    Err(e) => return Err(StageFailure::new(stage, e)),
                }
            };

            self.inner
                .store
                .put_scene(job_id, stage, idx, &segment)
                .await
                .map_err(&infra)?;
            segments.push(segment);
            self.advance(job_id, stage, idx + 1, total);
        }

        self.inner
            .store
            .put(job_id, stage, &RenderedScenes { segments })
            .await
            .map_err(&infra)
    }

    async fn run_assemble(&self, job_id: JobId) -> Result<ArtifactRef, StageFailure> {
        let stage = Stage::Assemble;
        let infra = StageFailure::infra(stage);
        let plan: ScenePlan = self.latest(job_id, Stage::Plan).await.map_err(&infra)?;
        let mut rendered: RenderedScenes = self.latest(job_id, Stage::Render).await.map_err(&infra)?;
        rendered.segments.sort_by_key(|s| s.scene_index);

        let ordered: Vec<usize> = rendered.segments.iter().map(|s| s.scene_index).collect();
        let expected: Vec<usize> = (0..plan.scenes.len()).collect();
        if ordered != expected {
            return Err(StageFailure::new(
                stage,
                StageError::invalid(format!(
                    "rendered scenes {ordered:?} do not match the {} planned scenes",
                    plan.scenes.len()
                )),
            ));
        }

        let paths: Vec<PathBuf> = rendered.segments.iter().map(|s| s.media.clone()).collect();
        let out = self
            .inner
            .store
            .media_dir(job_id, stage)
            .await
            .map_err(&infra)?
            .join("final.mp4");
        let assembler = &self.inner.collaborators.assembler;
        let (paths_ref, out_ref) = (&paths, &out);

        let mut sink = self.attempt_sink(job_id);
        let run = self
            .inner
            .executor
            .run(
                StageCall::stage(stage),
                |_ctx| async move { assembler.assemble(paths_ref, out_ref).await },
                |_path: &PathBuf| Ok(()),
                &mut sink,
            )
            .await;
        let path = run.result.map_err(|e| StageFailure::new(stage, e))?;

        info!("Job {}: final video at {}", job_id, path.display());
        self.inner
            .store
            .put(job_id, stage, &FinalVideo { path, segments: paths })
            .await
            .map_err(&infra)
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    async fn latest<T: DeserializeOwned>(&self, job_id: JobId, stage: Stage) -> Result<T, Pdf2VideoError> {
        Ok(self.inner.store.get::<T>(job_id, stage).await?.payload)
    }

    /// Latest per-scene artifact and its version, if one was committed.
    async fn latest_scene<T: DeserializeOwned>(
        &self,
        job_id: JobId,
        stage: Stage,
        idx: usize,
    ) -> Result<Option<(T, u32)>, Pdf2VideoError> {
        let slot = Slot::scene(job_id, stage, idx);
        match self.inner.store.versions(slot).await?.last() {
            Some(&version) => {
                let artifact = self.inner.store.get_version::<T>(slot, version).await?;
                Ok(Some((artifact.payload, version)))
            }
            None => Ok(None),
        }
    }

    fn advance(&self, job_id: JobId, stage: Stage, done: usize, total: usize) {
        if let Err(e) = self
            .inner
            .registry
            .update(job_id, |j| j.advance_progress(stage, done, total))
        {
            warn!("Job {}: progress update failed: {}", job_id, e);
        }
    }

    fn add_usage(&self, job_id: JobId, usage: JobUsage) {
        let _ = self.inner.registry.update(job_id, |j| j.usage.add(usage));
    }

    /// Records every attempt on the job and reports failed ones.
    fn attempt_sink(&self, job_id: JobId) -> impl FnMut(StageAttempt) + Send + '_ {
        move |attempt: StageAttempt| {
            if attempt.error_kind.is_some() {
                self.inner.callback.on_attempt_failed(job_id, &attempt);
            }
            let _ = self.inner.registry.update(job_id, |j| j.attempts.push(attempt));
        }
    }

    async fn persist(&self, job_id: JobId) {
        let job = match self.inner.registry.snapshot(job_id) {
            Ok(job) => job,
            Err(_) => return,
        };
        if let Err(e) = self.inner.store.save_job(&job).await {
            warn!("Job {}: could not persist job record: {}", job_id, e);
        }
    }
}

fn apply_outcome(job: &mut Job, outcome: &DriveOutcome) {
    match outcome {
        DriveOutcome::Succeeded => {
            job.status = JobStatus::Succeeded;
            job.current_stage = Some(Stage::Assemble);
            job.error = None;
            job.message = "Video ready".to_string();
        }
        DriveOutcome::Cancelled => {
            job.status = JobStatus::Cancelled;
            job.message = "Cancelled".to_string();
        }
        DriveOutcome::Failed(f) => {
            let err = JobError::from_stage_error(f.stage, &f.error);
            job.status = JobStatus::Failed;
            job.current_stage = Some(f.stage);
            job.message = format!("{} failed: {}", f.stage.activity(), err.message);
            job.error = Some(err);
        }
    }
    job.updated_at = chrono::Utc::now();
}

/// File stem of a path or URL, used as a default video title.
fn title_from_source(source: &str) -> Option<String> {
    let last = source.rsplit(['/', '\\']).next()?;
    let stem = last.split(['?', '#']).next()?.trim_end_matches(".pdf");
    let title = stem.replace(['_', '-'], " ").trim().to_string();
    (!title.is_empty()).then_some(title)
}
