//! CLI binary for edgequake-pdf2video.
//!
//! A thin shim over the library crate: maps CLI flags to `PipelineConfig`,
//! submits or resumes one job, and follows it with a progress bar.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pdf2video::{
    Job, JobId, JobOptions, JobStatus, Orchestrator, PipelineConfig, ProgressView, RenderQuality,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

const AFTER_HELP: &str = r#"EXAMPLES:
  # Turn a local paper into a video
  pdf2video paper.pdf

  # From a URL, with an audience hint
  pdf2video https://arxiv.org/pdf/1706.03762 --audience "first-year undergraduates"

  # Higher render quality, custom renderer command
  pdf2video paper.pdf --quality high --renderer "python -m manim"

  # Inspect jobs in the store
  pdf2video --list
  pdf2video --status 6f1c2a9e-0d4b-4c35-9a57-2b8f5f0e7c11 --json

  # Resume a failed or interrupted job; committed stages are not redone
  pdf2video --resume 6f1c2a9e-0d4b-4c35-9a57-2b8f5f0e7c11

STAGES:
  extract   page text + figures (pdfium)
  plan      3-7 scenes (LLM)
  codegen   animation code + narration per scene (LLM)
  render    one video segment per scene (manim)
  assemble  concatenate segments (ffmpeg)

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDF2VIDEO_STORE_DIR     Job and artifact store (default ./jobs)
  PDFIUM_LIB_PATH         Path to an existing libpdfium, skips auto-download

SETUP:
  1. Set API key:     export OPENAI_API_KEY=sk-...
  2. Install tools:   pip install manim  &&  ffmpeg -version
  3. Run:             pdf2video paper.pdf

  Press Ctrl-C once to cancel after the current stage. Cancelled jobs are
  final; failed or interrupted jobs can be resumed with --resume.
"#;

/// Turn STEM papers into narrated explainer videos.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2video",
    version,
    about = "Turn STEM papers (PDF files or URLs) into narrated explainer videos",
    long_about = "Extract a paper, plan 3-7 scenes with an LLM, generate animation code per scene, \
render each scene and assemble the final video. Every stage commits a durable artifact, so failed \
or interrupted jobs can be resumed without redoing finished work.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    #[arg(required_unless_present_any = ["status", "list", "resume"])]
    input: Option<String>,

    /// Print the status of a job and exit.
    #[arg(long, value_name = "JOB_ID", conflicts_with_all = ["input", "list", "resume"])]
    status: Option<JobId>,

    /// List every job in the store and exit.
    #[arg(long, conflicts_with_all = ["input", "resume"])]
    list: bool,

    /// Resume a failed or interrupted job.
    #[arg(long, value_name = "JOB_ID", conflicts_with = "input")]
    resume: Option<JobId>,

    /// Job and artifact store directory.
    #[arg(long, env = "PDF2VIDEO_STORE_DIR", default_value = "./jobs")]
    store_dir: PathBuf,

    /// Video title (defaults to the PDF title or file name).
    #[arg(long)]
    title: Option<String>,

    /// Audience hint for the planner, e.g. "high-school students".
    #[arg(long)]
    audience: Option<String>,

    /// LLM model ID (e.g. gpt-4.1-mini, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,

    /// Renderer command, optionally with leading arguments.
    #[arg(long, env = "PDF2VIDEO_RENDERER", default_value = "manim")]
    renderer: String,

    /// ffmpeg command used to assemble the final video.
    #[arg(long, env = "PDF2VIDEO_FFMPEG", default_value = "ffmpeg")]
    ffmpeg: String,

    /// Render quality.
    #[arg(long, value_enum, default_value = "low")]
    quality: QualityArg,

    /// Minimum number of scenes in a plan.
    #[arg(long, default_value_t = 3)]
    min_scenes: usize,

    /// Maximum number of scenes in a plan.
    #[arg(long, default_value_t = 7)]
    max_scenes: usize,

    /// Attempts per LLM-backed stage (plan, codegen per scene).
    #[arg(long, env = "PDF2VIDEO_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PDF2VIDEO_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Print the final job record (or --status / --list) as JSON.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF2VIDEO_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2VIDEO_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2VIDEO_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum QualityArg {
    Low,
    Medium,
    High,
}

impl From<QualityArg> for RenderQuality {
    fn from(v: QualityArg) -> Self {
        match v {
            QualityArg::Low => RenderQuality::Low,
            QualityArg::Medium => RenderQuality::Medium,
            QualityArg::High => RenderQuality::High,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless --verbose is given.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;
    let orchestrator = Orchestrator::new(config)
        .await
        .context("Failed to open the job store")?;

    // ── Read-only modes ──────────────────────────────────────────────────
    if cli.list {
        let jobs = orchestrator
            .store()
            .load_jobs()
            .await
            .context("Failed to read jobs")?;
        return print_list(&jobs, cli.json);
    }

    if let Some(job_id) = cli.status {
        let job = orchestrator
            .get_status(job_id)
            .await
            .with_context(|| format!("No job {job_id} in {}", cli.store_dir.display()))?;
        return print_job(&job, cli.json);
    }

    // ── Running modes need the PDF engine ────────────────────────────────
    ensure_pdf_engine(cli.quiet)?;

    let job_id = match (cli.resume, cli.input.as_deref()) {
        (Some(job_id), _) => {
            orchestrator
                .resume(job_id)
                .await
                .with_context(|| format!("Cannot resume job {job_id}"))?;
            job_id
        }
        (None, Some(input)) => {
            let options = JobOptions {
                title: cli.title.clone(),
                audience: cli.audience.clone(),
                ..Default::default()
            };
            orchestrator
                .submit_path(input, options)
                .await
                .with_context(|| format!("Failed to submit '{input}'"))?
        }
        (None, None) => anyhow::bail!("Nothing to do: give a PDF, --resume, --status or --list"),
    };

    if !cli.quiet && !cli.json {
        eprintln!("{} {} {}", cyan("◆"), bold("Job"), job_id);
    }

    let job = follow(&orchestrator, job_id, show_progress).await?;

    if cli.json {
        print_job(&job, true)?;
    } else if !cli.quiet {
        print_summary(&job);
    }

    match outcome_error(job_id, job.status) {
        None => Ok(()),
        Some(msg) => anyhow::bail!(msg),
    }
}

/// Exit message for a job that did not produce a video. Only jobs that
/// `Orchestrator::resume` accepts get the `--resume` hint.
fn outcome_error(job_id: JobId, status: JobStatus) -> Option<String> {
    match status {
        JobStatus::Succeeded => None,
        JobStatus::Cancelled => Some(format!("Job {job_id} was cancelled")),
        _ => Some(format!("Job {job_id} failed; resume with --resume {job_id}")),
    }
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .store_dir(&cli.store_dir)
        .scene_range(cli.min_scenes, cli.max_scenes)
        .max_llm_attempts(cli.max_attempts)
        .renderer_command(&cli.renderer)
        .assembler_command(&cli.ffmpeg)
        .render_quality(cli.quality.into())
        .download_timeout_secs(cli.download_timeout);

    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }

    builder.build().context("Invalid configuration")
}

/// Make sure a pdfium library is available before the Extract stage runs.
fn ensure_pdf_engine(quiet: bool) -> Result<()> {
    #[cfg(feature = "bundled")]
    {
        let _ = quiet;
        tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_bundled())
            .context("Failed to extract bundled PDFium engine")?;
        return Ok(());
    }

    #[cfg(not(feature = "bundled"))]
    {
        if pdfium_auto::is_pdfium_cached() {
            return Ok(());
        }
        if quiet {
            tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
                .context("Failed to download PDFium engine")?;
            return Ok(());
        }

        let dl_bar = ProgressBar::new(0);
        dl_bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        dl_bar.set_prefix("PDF engine");
        dl_bar.enable_steady_tick(Duration::from_millis(80));

        let bar = dl_bar.clone();
        tokio::task::block_in_place(|| {
            pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
                if let Some(t) = total {
                    if bar.length().unwrap_or(0) != t {
                        bar.set_length(t);
                    }
                }
                bar.set_position(downloaded);
            }))
        })
        .context("Failed to download PDFium engine")?;

        dl_bar.finish_with_message("ready ✓");
        Ok(())
    }
}

/// Follow a job to its end. Ctrl-C requests cancellation once; the stage in
/// flight still finishes.
async fn follow(orchestrator: &Orchestrator, job_id: JobId, show_progress: bool) -> Result<Job> {
    let bar = show_progress.then(progress_bar);
    let mut views = orchestrator.subscribe(job_id).await?;
    let mut cancel_sent = false;

    loop {
        tokio::select! {
            view = views.next() => match view {
                Some(view) => {
                    if let Some(ref bar) = bar {
                        update_bar(bar, &view);
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                cancel_sent = true;
                if let Some(ref bar) = bar {
                    bar.println(format!("  {} cancelling after the current stage…", cyan("⚠")));
                }
                orchestrator.cancel(job_id).await?;
            }
        }
    }

    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    Ok(orchestrator.get_status(job_id).await?)
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::with_template(
        "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}%  ⏱ {elapsed_precise}  {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ")
    .tick_strings(TICKS);
    bar.set_style(style);
    bar.set_prefix("Queued");
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

fn update_bar(bar: &ProgressBar, view: &ProgressView) {
    if let Some(stage) = view.stage {
        bar.set_prefix(stage.to_string());
    }
    bar.set_position(u64::from(view.percent));
    bar.set_message(view.message.clone());
}

fn print_summary(job: &Job) {
    let view = edgequake_pdf2video::status::render(job);
    match job.status {
        JobStatus::Succeeded => {
            let video = job
                .final_video()
                .map(|r| r.location.display().to_string())
                .unwrap_or_default();
            eprintln!("{} {}  {}", green("✔"), bold(&view.message), dim(&video));
        }
        _ => eprintln!("{} {}", red("✘"), bold(&view.message)),
    }
    if let Some(ref err) = job.error {
        eprintln!("   {}", red(&err.message));
    }
    eprintln!(
        "   {} LLM calls  {} tokens in  /  {} tokens out",
        dim(&job.usage.llm_calls.to_string()),
        dim(&job.usage.input_tokens.to_string()),
        dim(&job.usage.output_tokens.to_string()),
    );
}

fn print_job(job: &Job, json: bool) -> Result<()> {
    let view = edgequake_pdf2video::status::render(job);
    if json {
        let out = serde_json::json!({ "progress": view, "job": job });
        println!(
            "{}",
            serde_json::to_string_pretty(&out).context("Failed to serialise job")?
        );
        return Ok(());
    }

    println!("Job:       {}", job.id);
    println!("Status:    {}", job.status);
    if let Some(stage) = job.current_stage {
        println!("Stage:     {}", stage);
    }
    println!("Progress:  {}%", view.percent);
    println!("Message:   {}", view.message);
    if let Some(ref err) = job.error {
        println!("Error:     {} in {}: {}", err.kind, err.stage, err.message);
    }
    for (stage, artifact) in &job.artifacts {
        println!(
            "Artifact:  {:<9} v{}  {}",
            stage.to_string(),
            artifact.version,
            artifact.location.display()
        );
    }
    Ok(())
}

fn print_list(jobs: &[Job], json: bool) -> Result<()> {
    if json {
        let views: Vec<ProgressView> = jobs.iter().map(edgequake_pdf2video::status::render).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&views).context("Failed to serialise jobs")?
        );
        return Ok(());
    }
    if jobs.is_empty() {
        eprintln!("{}", dim("No jobs yet."));
    }
    for job in jobs {
        let view = edgequake_pdf2video::status::render(job);
        println!(
            "{}  {:<9} {:>3}%  {}",
            job.id,
            job.status.to_string(),
            view.percent,
            view.message
        );
    }
    Ok(())
}
