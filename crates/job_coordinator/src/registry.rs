use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::progress::ProgressSnapshot;

#[derive(Debug, Clone)]
pub struct MonitorEntry {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub polls: u32,
    pub last_snapshot: Option<ProgressSnapshot>,
}

/// In-memory set of jobs that currently have a poller attached.
///
/// Its only job is duplicate suppression: one job handle, one poller. Nothing
/// here is persisted; restart recovery works from the sessions instead.
#[derive(Default)]
pub struct JobMonitorRegistry {
    active: Mutex<HashMap<String, MonitorEntry>>,
}

impl JobMonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job_name` for `session_id`. Returns `false` if it was already registered.
    pub async fn start_monitoring(&self, job_name: &str, session_id: &str) -> bool {
        let mut active = self.active.lock().await;
        if active.contains_key(job_name) {
            tracing::debug!("Already monitoring job {}", job_name);
            return false;
        }
        active.insert(
            job_name.to_string(),
            MonitorEntry {
                session_id: session_id.to_string(),
                started_at: Utc::now(),
                polls: 0,
                last_snapshot: None,
            },
        );
        true
    }

    pub async fn stop_monitoring(&self, job_name: &str) -> Option<MonitorEntry> {
        let removed = self.active.lock().await.remove(job_name);
        if removed.is_some() {
            tracing::info!("Stopped monitoring job {}", job_name);
        }
        removed
    }

    pub async fn is_monitoring(&self, job_name: &str) -> bool {
        self.active.lock().await.contains_key(job_name)
    }

    pub async fn record_snapshot(&self, job_name: &str, snapshot: ProgressSnapshot) {
        if let Some(entry) = self.active.lock().await.get_mut(job_name) {
            entry.polls += 1;
            entry.last_snapshot = Some(snapshot);
        }
    }

    pub async fn entry(&self, job_name: &str) -> Option<MonitorEntry> {
        self.active.lock().await.get(job_name).cloned()
    }

    /// `(job handle, session id)` pairs currently being polled.
    pub async fn active_jobs(&self) -> Vec<(String, String)> {
        let active = self.active.lock().await;
        let mut jobs: Vec<(String, String)> = active
            .iter()
            .map(|(job, entry)| (job.clone(), entry.session_id.clone()))
            .collect();
        jobs.sort();
        jobs
    }

    pub async fn len(&self) -> usize {
        self.active.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.active.lock().await.is_empty()
    }
}
