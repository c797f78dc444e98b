//! Process-wide job registry.
//!
//! Each job lives in its own `tokio::sync::watch` channel holding the
//! authoritative snapshot. Readers clone the snapshot or subscribe for
//! change notifications; the orchestrator mutates through
//! [`JobRegistry::update`], which runs the whole closure under the channel's
//! write lock so a reader never observes half a transition.

use crate::error::Pdf2VideoError;
use crate::job::{Job, JobId};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use tracing::warn;

#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, watch::Sender<Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_map(&self) -> RwLockReadGuard<'_, HashMap<JobId, watch::Sender<Job>>> {
        match self.jobs.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Job registry lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, HashMap<JobId, watch::Sender<Job>>> {
        match self.jobs.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Job registry lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Register a job, replacing any stale entry with the same id.
    pub(crate) fn insert(&self, job: Job) {
        let mut map = self.write_map();
        match map.get(&job.id) {
            // Keep existing subscribers attached.
            Some(tx) => {
                tx.send_replace(job);
            }
            None => {
                let (tx, _rx) = watch::channel(job.clone());
                map.insert(job.id, tx);
            }
        }
    }

    /// Apply `f` to the job atomically, bump `updated_at`, and return the
    /// resulting snapshot.
    pub(crate) fn update<F>(&self, job_id: JobId, f: F) -> Result<Job, Pdf2VideoError>
    where
        F: FnOnce(&mut Job),
    {
        let map = self.read_map();
        let tx = map.get(&job_id).ok_or(Pdf2VideoError::JobNotFound { job_id })?;
        tx.send_modify(|job| {
            f(job);
            job.updated_at = Utc::now();
        });
        let snapshot = tx.borrow().clone();
        Ok(snapshot)
    }

    /// Drop a job and close its channel. Receivers keep the last snapshot.
    pub(crate) fn remove(&self, job_id: JobId) -> Option<Job> {
        self.write_map()
            .remove(&job_id)
            .map(|tx| tx.borrow().clone())
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.read_map().contains_key(&job_id)
    }

    /// Point-in-time copy of a job.
    pub fn snapshot(&self, job_id: JobId) -> Result<Job, Pdf2VideoError> {
        self.read_map()
            .get(&job_id)
            .map(|tx| tx.borrow().clone())
            .ok_or(Pdf2VideoError::JobNotFound { job_id })
    }

    /// Receiver that wakes on every change to the job.
    pub fn subscribe(&self, job_id: JobId) -> Result<watch::Receiver<Job>, Pdf2VideoError> {
        self.read_map()
            .get(&job_id)
            .map(|tx| tx.subscribe())
            .ok_or(Pdf2VideoError::JobNotFound { job_id })
    }

    /// Snapshots of every registered job, oldest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .read_map()
            .values()
            .map(|tx| tx.borrow().clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Resolve once the job reaches a terminal status.
    pub async fn wait(&self, job_id: JobId) -> Result<Job, Pdf2VideoError> {
        let mut rx = self.subscribe(job_id)?;
        let job = rx
            .wait_for(|j| j.status.is_terminal())
            .await
            .map_err(|_| Pdf2VideoError::Internal(format!("Job {job_id} channel closed")))?
            .clone();
        Ok(job)
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.read_map().len())
            .finish()
    }
}
