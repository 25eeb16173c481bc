use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use ml_service::MlService;
use state_store::{SessionStore, Stage};

use crate::completion::{CompletionOutcome, CompletionWorkflow};
use crate::progress::{elapsed_since, estimate, observation_failed, ProgressSnapshot};
use crate::registry::JobMonitorRegistry;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    /// Hard ceiling after which a still-running job is abandoned by its poller.
    pub max_duration: Duration,
    pub sweep_interval: Duration,
    /// Consecutive retriable status failures tolerated before the job is treated as
    /// failed. Non-retriable failures end polling at once.
    pub status_error_tolerance: u32,
}

impl PollerConfig {
    /// Whether a single failed status call is enough to fail the job.
    pub fn fails_fast(&self) -> bool {
        self.status_error_tolerance <= 1
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_duration: Duration::from_secs(45 * 60),
            sweep_interval: Duration::from_secs(30),
            status_error_tolerance: 1,
        }
    }
}

/// How a poller task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollExit {
    /// The service reported a terminal state and completion ran.
    Terminal(CompletionOutcome),
    /// Status calls kept failing; completion ran and took the failure branch.
    StatusErrors(CompletionOutcome),
    /// The ceiling was hit while the job was still running.
    Abandoned,
}

/// Progress published on every poll.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub job_name: String,
    pub session_id: String,
    pub snapshot: ProgressSnapshot,
}

/// Timer-driven status polling plus the slower recovery sweep.
pub struct JobPoller {
    store: Arc<SessionStore>,
    service: Arc<dyn MlService>,
    workflow: Arc<CompletionWorkflow>,
    registry: Arc<JobMonitorRegistry>,
    config: PollerConfig,
    updates: broadcast::Sender<ProgressUpdate>,
    /// Consecutive failed status calls seen by the sweep, per session.
    sweep_errors: Mutex<HashMap<String, u32>>,
}

impl JobPoller {
    pub fn new(
        store: Arc<SessionStore>,
        service: Arc<dyn MlService>,
        workflow: Arc<CompletionWorkflow>,
        registry: Arc<JobMonitorRegistry>,
        config: PollerConfig,
    ) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            store,
            service,
            workflow,
            registry,
            config,
            updates,
            sweep_errors: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.updates.subscribe()
    }

    /// Start polling `job_name` on behalf of `session_id`.
    ///
    /// Returns `None` without spawning anything if the job already has a poller.
    pub async fn monitor(self: &Arc<Self>, job_name: &str, session_id: &str) -> Option<JoinHandle<PollExit>> {
        if !self.registry.start_monitoring(job_name, session_id).await {
            return None;
        }

        let poller = Arc::clone(self);
        let job_name = job_name.to_string();
        let session_id = session_id.to_string();

        Some(tokio::spawn(async move {
            tracing::info!("Started monitoring job {} for session {}", job_name, session_id);
            let exit = poller.poll_until_done(&job_name, &session_id).await;
            poller.registry.stop_monitoring(&job_name).await;
            tracing::info!("Finished monitoring job {}: {:?}", job_name, exit);
            exit
        }))
    }

    async fn poll_until_done(&self, job_name: &str, session_id: &str) -> PollExit {
        let started = Instant::now();
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_errors = 0u32;

        loop {
            ticker.tick().await;

            if started.elapsed() >= self.config.max_duration {
                tracing::warn!(
                    "Abandoning job {} after {:?}; session {} stays in training",
                    job_name,
                    self.config.max_duration,
                    session_id
                );
                return PollExit::Abandoned;
            }

            match self.service.get_training_job(job_name).await {
                Ok(job) => {
                    consecutive_errors = 0;
                    let snapshot = estimate(job.state, elapsed_since(job.create_time));
                    tracing::debug!(
                        "Job {} is {} ({}%: {})",
                        job_name,
                        job.state.as_str(),
                        snapshot.percentage,
                        snapshot.stage
                    );
                    self.publish(job_name, session_id, snapshot).await;

                    if job.state.is_terminal() {
                        // Unregister before completing so a resumed poller can't double up.
                        self.registry.stop_monitoring(job_name).await;
                        let outcome = self
                            .workflow
                            .run_completion(session_id, self.config.fails_fast())
                            .await;
                        return PollExit::Terminal(outcome);
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        "Status check {}/{} for job {} failed: {}",
                        consecutive_errors,
                        self.config.status_error_tolerance,
                        job_name,
                        e
                    );
                    self.publish(job_name, session_id, observation_failed(&e.to_string()))
                        .await;

                    if !e.is_retriable()
                        || consecutive_errors >= self.config.status_error_tolerance.max(1)
                    {
                        self.registry.stop_monitoring(job_name).await;
                        let outcome = self.workflow.run_completion(session_id, true).await;
                        return PollExit::StatusErrors(outcome);
                    }
                }
            }
        }
    }

    async fn publish(&self, job_name: &str, session_id: &str, snapshot: ProgressSnapshot) {
        self.registry.record_snapshot(job_name, snapshot.clone()).await;
        // No subscribers is fine.
        let _ = self.updates.send(ProgressUpdate {
            job_name: job_name.to_string(),
            session_id: session_id.to_string(),
            snapshot,
        });
    }

    /// Run completion for every session still in `training`. Returns how many
    /// sessions reached a terminal outcome on this pass.
    ///
    /// Failed status calls count against the same tolerance as the poller's,
    /// tracked per session across passes.
    pub async fn sweep_once(&self) -> usize {
        let sessions = self.store.sessions_in_stage(Stage::Training).await;
        let mut finished = 0;

        self.sweep_errors
            .lock()
            .await
            .retain(|id, _| sessions.iter().any(|s| &s.id == id));

        for session in sessions {
            if session.completion_notified || !session.has_active_job() {
                continue;
            }

            let seen = self.sweep_errors.lock().await.get(&session.id).copied().unwrap_or(0);
            let out_of_budget = seen + 1 >= self.config.status_error_tolerance.max(1);

            match self.workflow.run_completion(&session.id, out_of_budget).await {
                CompletionOutcome::Unobserved(_) => {
                    tracing::warn!(
                        "Sweep could not check session {} ({}/{})",
                        session.id,
                        seen + 1,
                        self.config.status_error_tolerance
                    );
                    self.sweep_errors.lock().await.insert(session.id, seen + 1);
                }
                outcome => {
                    self.sweep_errors.lock().await.remove(&session.id);
                    if matches!(
                        outcome,
                        CompletionOutcome::Failed
                            | CompletionOutcome::RegistrationFailed
                            | CompletionOutcome::Deployed { .. }
                    ) {
                        finished += 1;
                    }
                }
            }
        }

        if finished > 0 {
            tracing::info!("Sweep finished {} training session(s)", finished);
        }
        finished
    }

    pub fn spawn_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(poller.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                poller.sweep_once().await;
            }
        })
    }

    /// Re-attach pollers to every persisted session with an outstanding job.
    pub async fn resume_active_jobs(self: &Arc<Self>) -> Vec<JoinHandle<PollExit>> {
        let sessions = self.store.sessions_in_stage(Stage::Training).await;
        let mut handles = Vec::new();

        for session in sessions {
            if session.completion_notified {
                continue;
            }
            if let Some(job_name) = &session.current_training_job {
                if let Some(handle) = self.monitor(job_name, &session.id).await {
                    handles.push(handle);
                }
            }
        }

        if !handles.is_empty() {
            tracing::info!("Resumed monitoring for {} training job(s)", handles.len());
        }
        handles
    }
}
