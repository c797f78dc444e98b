//! Filesystem artifact store.
//!
//! ## Layout
//!
//! ```text
//! <root>/<job_id>/job.json                     job record (replaced atomically)
//! <root>/<job_id>/input.pdf                    submitted PDF
//! <root>/<job_id>/<stage>/v0001.json           stage-level artifact versions
//! <root>/<job_id>/<stage>/scene-03/v0002.json  per-scene artifact versions
//! <root>/<job_id>/media/<stage>/…              large binaries (figures, video)
//! ```
//!
//! ## Write-once commits
//!
//! Every version is written to a temp file in the target directory, fsynced,
//! then linked into place with `persist_noclobber`. A version file is
//! therefore either complete or absent, and an existing version can never be
//! overwritten: a second write of the same version fails with
//! [`Pdf2VideoError::Conflict`]. Re-running a stage simply commits the next
//! version; [`ArtifactStore::get`] always returns the highest one.

use crate::artifact::{Artifact, ArtifactRef};
use crate::error::Pdf2VideoError;
use crate::job::{Job, JobId, Stage};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const JOB_RECORD: &str = "job.json";
const INPUT_FILE: &str = "input.pdf";

/// Identity of an artifact slot: one stage of one job, optionally narrowed
/// to a single scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub job_id: JobId,
    pub stage: Stage,
    pub scene: Option<usize>,
}

impl Slot {
    pub fn stage(job_id: JobId, stage: Stage) -> Self {
        Self {
            job_id,
            stage,
            scene: None,
        }
    }

    pub fn scene(job_id: JobId, stage: Stage, scene: usize) -> Self {
        Self {
            job_id,
            stage,
            scene: Some(scene),
        }
    }
}

/// Durable per-job artifact and job-record storage.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, Pdf2VideoError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| io_err(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    fn slot_dir(&self, slot: Slot) -> PathBuf {
        let dir = self.job_dir(slot.job_id).join(slot.stage.as_str());
        match slot.scene {
            Some(idx) => dir.join(format!("scene-{:02}", idx + 1)),
            None => dir,
        }
    }

    /// Directory where a stage's collaborator writes large binaries.
    pub async fn media_dir(&self, job_id: JobId, stage: Stage) -> Result<PathBuf, Pdf2VideoError> {
        let dir = self.job_dir(job_id).join("media").join(stage.as_str());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err(&dir, e))?;
        Ok(dir)
    }

    // ── Artifacts ────────────────────────────────────────────────────────

    /// Commit the next version of a stage artifact.
    pub async fn put<T: Serialize>(
        &self,
        job_id: JobId,
        stage: Stage,
        payload: &T,
    ) -> Result<ArtifactRef, Pdf2VideoError> {
        self.put_next(Slot::stage(job_id, stage), payload).await
    }

    /// Commit the next version of one scene's artifact.
    pub async fn put_scene<T: Serialize>(
        &self,
        job_id: JobId,
        stage: Stage,
        scene: usize,
        payload: &T,
    ) -> Result<ArtifactRef, Pdf2VideoError> {
        self.put_next(Slot::scene(job_id, stage, scene), payload).await
    }

    async fn put_next<T: Serialize>(
        &self,
        slot: Slot,
        payload: &T,
    ) -> Result<ArtifactRef, Pdf2VideoError> {
        let next = self.versions(slot).await?.last().copied().unwrap_or(0) + 1;
        self.put_version(slot, next, payload).await
    }

    /// Commit exactly `version` of a slot; fails with `Conflict` if that
    /// version already exists.
    pub async fn put_version<T: Serialize>(
        &self,
        slot: Slot,
        version: u32,
        payload: &T,
    ) -> Result<ArtifactRef, Pdf2VideoError> {
        let dir = self.slot_dir(slot);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err(&dir, e))?;
        let location = dir.join(version_file(version));

        let reference = ArtifactRef {
            job_id: slot.job_id,
            stage: slot.stage,
            scene: slot.scene,
            version,
            location: location.clone(),
            created_at: Utc::now(),
        };
        let record = Artifact {
            reference: reference.clone(),
            payload,
        };
        let bytes = serde_json::to_vec_pretty(&record).map_err(|e| Pdf2VideoError::Serialization {
            path: location.clone(),
            source: e,
        })?;

        let target = location.clone();
        let committed = tokio::task::spawn_blocking(move || commit_blocking(&dir, &target, &bytes, false))
            .await
            .map_err(|e| Pdf2VideoError::Internal(format!("Commit task panicked: {e}")))?;

        match committed {
            Ok(()) => {
                debug!(
                    "Committed {} v{} for job {}",
                    slot_label(slot),
                    version,
                    slot.job_id
                );
                Ok(reference)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(Pdf2VideoError::Conflict {
                job_id: slot.job_id,
                stage: slot.stage,
                scene: slot.scene,
                version,
            }),
            Err(e) => Err(io_err(&location, e)),
        }
    }

    /// Latest committed stage artifact.
    pub async fn get<T: DeserializeOwned>(
        &self,
        job_id: JobId,
        stage: Stage,
    ) -> Result<Artifact<T>, Pdf2VideoError> {
        self.get_latest(Slot::stage(job_id, stage)).await
    }

    /// Latest committed artifact of one scene.
    pub async fn get_scene<T: DeserializeOwned>(
        &self,
        job_id: JobId,
        stage: Stage,
        scene: usize,
    ) -> Result<Artifact<T>, Pdf2VideoError> {
        self.get_latest(Slot::scene(job_id, stage, scene)).await
    }

    async fn get_latest<T: DeserializeOwned>(&self, slot: Slot) -> Result<Artifact<T>, Pdf2VideoError> {
        match self.versions(slot).await?.last() {
            Some(&version) => self.get_version(slot, version).await,
            None => Err(not_found(slot)),
        }
    }

    /// A specific version of a slot.
    pub async fn get_version<T: DeserializeOwned>(
        &self,
        slot: Slot,
        version: u32,
    ) -> Result<Artifact<T>, Pdf2VideoError> {
        let path = self.slot_dir(slot).join(version_file(version));
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found(slot)),
            Err(e) => return Err(io_err(&path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| Pdf2VideoError::Serialization { path, source: e })
    }

    /// Reference to the latest version of a stage artifact, if any.
    pub async fn latest_ref(&self, job_id: JobId, stage: Stage) -> Result<Option<ArtifactRef>, Pdf2VideoError> {
        let slot = Slot::stage(job_id, stage);
        match self.versions(slot).await?.last() {
            Some(&version) => {
                let artifact: Artifact<serde_json::Value> = self.get_version(slot, version).await?;
                Ok(Some(artifact.reference))
            }
            None => Ok(None),
        }
    }

    /// Committed versions of a slot, ascending.
    pub async fn versions(&self, slot: Slot) -> Result<Vec<u32>, Pdf2VideoError> {
        let dir = self.slot_dir(slot);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&dir, e)),
        };
        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&dir, e))? {
            if let Some(v) = entry.file_name().to_str().and_then(parse_version_file) {
                versions.push(v);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Latest stage-level artifact of every committed stage, in stage order.
    pub async fn list(&self, job_id: JobId) -> Result<Vec<ArtifactRef>, Pdf2VideoError> {
        let mut refs = Vec::new();
        for stage in Stage::ALL {
            if let Some(r) = self.latest_ref(job_id, stage).await? {
                refs.push(r);
            }
        }
        Ok(refs)
    }

    // ── Inputs & job records ─────────────────────────────────────────────

    /// Store the submitted PDF and return its location handle.
    pub async fn save_input(&self, job_id: JobId, pdf: Vec<u8>) -> Result<PathBuf, Pdf2VideoError> {
        let dir = self.job_dir(job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err(&dir, e))?;
        let target = dir.join(INPUT_FILE);
        let path = target.clone();
        tokio::task::spawn_blocking(move || commit_blocking(&dir, &target, &pdf, false))
            .await
            .map_err(|e| Pdf2VideoError::Internal(format!("Input write panicked: {e}")))?
            .map_err(|e| io_err(&path, e))?;
        Ok(path)
    }

    /// Persist a job record, atomically replacing the previous one.
    pub async fn save_job(&self, job: &Job) -> Result<(), Pdf2VideoError> {
        let dir = self.job_dir(job.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err(&dir, e))?;
        let target = dir.join(JOB_RECORD);
        let bytes = serde_json::to_vec_pretty(job).map_err(|e| Pdf2VideoError::Serialization {
            path: target.clone(),
            source: e,
        })?;
        let path = target.clone();
        tokio::task::spawn_blocking(move || commit_blocking(&dir, &target, &bytes, true))
            .await
            .map_err(|e| Pdf2VideoError::Internal(format!("Job write panicked: {e}")))?
            .map_err(|e| io_err(&path, e))
    }

    pub async fn load_job(&self, job_id: JobId) -> Result<Job, Pdf2VideoError> {
        let path = self.job_dir(job_id).join(JOB_RECORD);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Pdf2VideoError::JobNotFound { job_id })
            }
            Err(e) => return Err(io_err(&path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| Pdf2VideoError::Serialization { path, source: e })
    }

    /// Every persisted job record, oldest first. Unreadable records are
    /// skipped with a warning so one corrupt job cannot block recovery.
    pub async fn load_jobs(&self) -> Result<Vec<Job>, Pdf2VideoError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| io_err(&self.root, e))?;
        let mut jobs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&self.root, e))? {
            let Some(job_id) = entry.file_name().to_str().and_then(|n| n.parse::<JobId>().ok()) else {
                continue;
            };
            match self.load_job(job_id).await {
                Ok(job) => jobs.push(job),
                Err(Pdf2VideoError::JobNotFound { .. }) => {}
                Err(e) => warn!("Skipping unreadable job record {}: {}", job_id, e),
            }
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn version_file(version: u32) -> String {
    format!("v{version:04}.json")
}

fn parse_version_file(name: &str) -> Option<u32> {
    name.strip_prefix('v')?.strip_suffix(".json")?.parse().ok()
}

fn slot_label(slot: Slot) -> String {
    match slot.scene {
        Some(idx) => format!("{}/scene-{}", slot.stage, idx + 1),
        None => slot.stage.to_string(),
    }
}

fn not_found(slot: Slot) -> Pdf2VideoError {
    Pdf2VideoError::ArtifactNotFound {
        job_id: slot.job_id,
        stage: slot.stage,
        scene: slot.scene,
    }
}

fn io_err(path: &Path, source: std::io::Error) -> Pdf2VideoError {
    Pdf2VideoError::Store {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `bytes` to a temp file in `dir`, fsync it, then move it to
/// `target`. With `clobber == false` the move fails with `AlreadyExists`
/// if `target` is present.
fn commit_blocking(dir: &Path, target: &Path, bytes: &[u8], clobber: bool) -> std::io::Result<()> {
    let mut tmp = tempfile::Builder::new().prefix(".tmp-").tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    if clobber {
        tmp.persist(target).map_err(|e| e.error)?;
    } else {
        tmp.persist_noclobber(target).map_err(|e| e.error)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobOptions, JobStatus};
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    fn note(s: &str) -> Note {
        Note { text: s.into() }
    }

    async fn store() -> (TempDir, ArtifactStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = ArtifactStore::open(dir.path().join("jobs")).await.expect("open");
        (dir, store)
    }

    #[tokio::test]
    async fn get_returns_latest_version() {
        let (_dir, store) = store().await;
        let id = JobId::new();
        let v1 = store.put(id, Stage::Plan, &note("first")).await.unwrap();
        let v2 = store.put(id, Stage::Plan, &note("second")).await.unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));

        let latest: Artifact<Note> = store.get(id, Stage::Plan).await.unwrap();
        assert_eq!(latest.payload, note("second"));
        assert_eq!(latest.reference, v2);

        // The first version is still on disk, untouched.
        let old: Artifact<Note> = store.get_version(Slot::stage(id, Stage::Plan), 1).await.unwrap();
        assert_eq!(old.payload, note("first"));
    }

    #[tokio::test]
    async fn put_version_is_write_once() {
        let (_dir, store) = store().await;
        let id = JobId::new();
        let slot = Slot::stage(id, Stage::Extract);
        store.put_version(slot, 1, &note("a")).await.unwrap();
        let err = store.put_version(slot, 1, &note("b")).await.unwrap_err();
        assert!(matches!(err, Pdf2VideoError::Conflict { version: 1, .. }), "got {err:?}");

        let kept: Artifact<Note> = store.get(id, Stage::Extract).await.unwrap();
        assert_eq!(kept.payload, note("a"));
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let (_dir, store) = store().await;
        let err = store.get::<Note>(JobId::new(), Stage::Render).await.unwrap_err();
        assert!(matches!(err, Pdf2VideoError::ArtifactNotFound { .. }));
    }

    #[tokio::test]
    async fn scene_slots_are_independent_of_stage_slot() {
        let (_dir, store) = store().await;
        let id = JobId::new();
        store.put_scene(id, Stage::Codegen, 0, &note("s1")).await.unwrap();
        store.put_scene(id, Stage::Codegen, 2, &note("s3")).await.unwrap();
        store.put_scene(id, Stage::Codegen, 2, &note("s3 again")).await.unwrap();

        assert!(store.get::<Note>(id, Stage::Codegen).await.is_err());
        let s3: Artifact<Note> = store.get_scene(id, Stage::Codegen, 2).await.unwrap();
        assert_eq!(s3.reference.version, 2);
        assert_eq!(s3.reference.scene, Some(2));
    }

    #[tokio::test]
    async fn list_is_in_stage_order() {
        let (_dir, store) = store().await;
        let id = JobId::new();
        store.put(id, Stage::Codegen, &note("c")).await.unwrap();
        store.put(id, Stage::Extract, &note("e")).await.unwrap();
        store.put(id, Stage::Plan, &note("p")).await.unwrap();
        let stages: Vec<Stage> = store.list(id).await.unwrap().iter().map(|r| r.stage).collect();
        assert_eq!(stages, vec![Stage::Extract, Stage::Plan, Stage::Codegen]);
    }

    #[tokio::test]
    async fn job_records_survive_reopen() {
        let (dir, store) = store().await;
        let id = JobId::new();
        let input = store.save_input(id, b"%PDF-1.7".to_vec()).await.unwrap();
        let mut job = Job::new(id, input, JobOptions::default());
        store.save_job(&job).await.unwrap();
        job.status = JobStatus::Running;
        store.save_job(&job).await.unwrap();

        let reopened = ArtifactStore::open(dir.path().join("jobs")).await.unwrap();
        let jobs = reopened.load_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Running);
        assert_eq!(std::fs::read(&jobs[0].input).unwrap(), b"%PDF-1.7");
    }

    #[test]
    fn version_file_names_parse_back() {
        assert_eq!(parse_version_file(&version_file(12)), Some(12));
        assert_eq!(parse_version_file(".tmp-abc"), None);
        assert_eq!(parse_version_file("job.json"), None);
    }
}
