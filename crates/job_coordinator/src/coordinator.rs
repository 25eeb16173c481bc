use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use ml_service::{MlService, RemoteJob, TrainingRequest};
use state_store::{EndpointRecord, SessionStore, TrainingJobRecord};

use crate::completion::{CompletionOutcome, CompletionWorkflow};
use crate::poller::{JobPoller, PollExit};
use crate::progress::ProgressSnapshot;
use crate::registry::JobMonitorRegistry;
use crate::ui::UiGenerator;
use crate::{CoordinatorConfig, CoordinatorError, CoordinatorResult};

/// Answer to an explicit "how is my training going" request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingStatus {
    pub has_active_job: bool,
    pub job_status: Option<String>,
    pub progress: ProgressSnapshot,
    pub is_complete: bool,
    pub has_failed: bool,
    pub stage: String,
}

/// Owns the registry, poller and completion workflow and wires them to the store.
pub struct TrainingCoordinator {
    store: Arc<SessionStore>,
    service: Arc<dyn MlService>,
    workflow: Arc<CompletionWorkflow>,
    registry: Arc<JobMonitorRegistry>,
    poller: Arc<JobPoller>,
    config: CoordinatorConfig,
}

impl TrainingCoordinator {
    pub fn new(
        store: Arc<SessionStore>,
        service: Arc<dyn MlService>,
        ui: Arc<dyn UiGenerator>,
        config: CoordinatorConfig,
    ) -> Self {
        let workflow = Arc::new(CompletionWorkflow::new(
            Arc::clone(&store),
            Arc::clone(&service),
            ui,
        ));
        let registry = Arc::new(JobMonitorRegistry::new());
        let poller = Arc::new(JobPoller::new(
            Arc::clone(&store),
            Arc::clone(&service),
            Arc::clone(&workflow),
            Arc::clone(&registry),
            config.poller(),
        ));

        Self {
            store,
            service,
            workflow,
            registry,
            poller,
            config,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn workflow(&self) -> &Arc<CompletionWorkflow> {
        &self.workflow
    }

    pub fn registry(&self) -> &Arc<JobMonitorRegistry> {
        &self.registry
    }

    pub fn poller(&self) -> &Arc<JobPoller> {
        &self.poller
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Submit a training job for `session_id` and attach a poller to it.
    pub async fn start_training(
        &self,
        session_id: &str,
        request: TrainingRequest,
        dataset_id: Option<String>,
    ) -> CoordinatorResult<(RemoteJob, Option<JoinHandle<PollExit>>)> {
        let job = {
            let _guard = self.store.lock_session(session_id).await;
            let mut session = self.store.get(session_id).await;
            if session.has_active_job() && !session.completion_notified {
                return Err(CoordinatorError::TrainingInProgress(session_id.to_string()));
            }

            let job = self.service.create_training_job(&request).await?;
            tracing::info!(
                "Submitted training job {} for session {} (target: {})",
                job.name,
                session_id,
                request.target_column
            );

            self.store
                .insert_training_job(TrainingJobRecord {
                    id: Uuid::new_v4().to_string(),
                    job_name: job.name.clone(),
                    display_name: request.display_name.clone(),
                    dataset_id: dataset_id.clone(),
                    target_column: Some(request.target_column.clone()),
                    session_id: session_id.to_string(),
                    created_at: Utc::now(),
                })
                .await?;

            session.begin_training(&job.name);
            session.target_column = Some(request.target_column.clone());
            if dataset_id.is_some() {
                session.current_dataset = dataset_id;
            }
            self.store.put(session).await?;
            job
        };

        let handle = self.poller.monitor(&job.name, session_id).await;
        Ok((job, handle))
    }

    /// Current progress for the session's outstanding job. A terminal answer
    /// also drives the completion workflow, same as a poller would.
    pub async fn training_status(&self, session_id: &str) -> TrainingStatus {
        let session = self.store.get(session_id).await;

        let Some(job_name) = session.current_training_job.clone() else {
            return TrainingStatus {
                has_active_job: false,
                job_status: None,
                progress: ProgressSnapshot::idle(),
                is_complete: false,
                has_failed: false,
                stage: session.stage.as_str().to_string(),
            };
        };

        let (remote, progress) = self.workflow.fetch_progress(&job_name).await;

        if progress.is_terminal() && !session.completion_notified {
            let outcome = self
                .workflow
                .run_completion(session_id, self.poller.config().fails_fast())
                .await;
            tracing::debug!("Status check completed session {}: {:?}", session_id, outcome);
        }

        // Re-read: completion may have moved the stage on.
        let stage = self.store.get(session_id).await.stage;
        TrainingStatus {
            has_active_job: true,
            job_status: remote.map(|j| j.state.as_str().to_string()),
            is_complete: progress.is_complete,
            has_failed: progress.has_failed,
            progress,
            stage: stage.as_str().to_string(),
        }
    }

    /// Deploy a registered model by hand, defaulting to the session's current model.
    pub async fn deploy_model(
        &self,
        session_id: &str,
        model_id: Option<&str>,
    ) -> CoordinatorResult<EndpointRecord> {
        let _guard = self.store.lock_session(session_id).await;
        let mut session = self.store.get(session_id).await;

        let model = match model_id {
            Some(id) => self.store.find_model(id).await,
            None => {
                self.store
                    .find_model_or_latest(session.current_model.as_deref())
                    .await
            }
        }
        .ok_or_else(|| CoordinatorError::NotFound(format!("model {}", model_id.unwrap_or("(latest)"))))?;

        let endpoint = self.workflow.deploy_endpoint(&model).await?;
        session.current_model = Some(model.id.clone());
        session.current_endpoint = Some(endpoint.id.clone());
        session.updated_at = Utc::now();
        self.store.put(session).await?;

        tracing::info!("Deployed model {} to endpoint {}", model.id, endpoint.id);
        Ok(endpoint)
    }

    /// Re-hydrate pollers for persisted jobs and start the recovery sweep.
    pub async fn start_background(&self) -> JoinHandle<()> {
        self.poller.resume_active_jobs().await;
        self.poller.spawn_sweep()
    }

    /// Run completion for a session outside of any poller. A failed status call
    /// fails the job only when the configured tolerance is one.
    pub async fn complete(&self, session_id: &str) -> CompletionOutcome {
        self.workflow
            .run_completion(session_id, self.poller.config().fails_fast())
            .await
    }
}
