use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use ml_service::{MlService, RemoteJob};
use state_store::{ChatMessage, EndpointRecord, ModelRecord, Session, SessionStore, Stage};

use crate::progress::{elapsed_since, estimate, observation_failed, ProgressSnapshot};
use crate::ui::{UiGenerator, UiRequest};
use crate::{CoordinatorError, CoordinatorResult};

/// `metadata.type` of the message appended when the workflow itself blew up.
const SYSTEM_ERROR_KIND: &str = "completion_error";

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// The session has no outstanding job.
    NoActiveJob,
    /// Another trigger already handled this job.
    AlreadyNotified,
    /// The job is not terminal yet; nothing was changed.
    StillRunning(ProgressSnapshot),
    /// The status call failed and the caller still has error budget left;
    /// nothing was changed.
    Unobserved(ProgressSnapshot),
    Failed,
    RegistrationFailed,
    Deployed {
        model_id: String,
        endpoint_id: String,
        simulated: bool,
        ui_path: Option<PathBuf>,
    },
    /// An unexpected error escaped the workflow; the user got a generic notice
    /// and the session will not be retried.
    SystemError,
}

/// Runs the register → deploy → generate UI → notify sequence for a finished job.
///
/// Any number of triggers (poller, sweep, explicit status checks) may call
/// [`run_completion`](CompletionWorkflow::run_completion) for the same session.
/// The per-session lock makes them single-flight and the `completion_notified`
/// flag, re-read under that lock, makes every call after the first a no-op.
pub struct CompletionWorkflow {
    store: Arc<SessionStore>,
    service: Arc<dyn MlService>,
    ui: Arc<dyn UiGenerator>,
}

impl CompletionWorkflow {
    pub fn new(
        store: Arc<SessionStore>,
        service: Arc<dyn MlService>,
        ui: Arc<dyn UiGenerator>,
    ) -> Self {
        Self { store, service, ui }
    }

    /// Query the service and estimate progress. Errors become a failure snapshot.
    pub async fn fetch_progress(&self, job_name: &str) -> (Option<RemoteJob>, ProgressSnapshot) {
        match self.service.get_training_job(job_name).await {
            Ok(job) => {
                let snapshot = estimate(job.state, elapsed_since(job.create_time));
                (Some(job), snapshot)
            }
            Err(e) => {
                tracing::warn!("Status check for {} failed: {}", job_name, e);
                (None, observation_failed(&e.to_string()))
            }
        }
    }

    /// Finish the session's outstanding job if the service reports it terminal.
    ///
    /// A failed status call takes the failure branch only when
    /// `fail_on_observation_error` is set; otherwise it yields
    /// [`CompletionOutcome::Unobserved`] and the session is left as it was.
    pub async fn run_completion(
        &self,
        session_id: &str,
        fail_on_observation_error: bool,
    ) -> CompletionOutcome {
        let _guard = self.store.lock_session(session_id).await;

        match self
            .complete_locked(session_id, fail_on_observation_error)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Completion workflow for session {} failed: {}", session_id, e);
                if let Err(report_err) = self.report_system_error(session_id).await {
                    tracing::error!(
                        "Could not record completion failure for session {}: {}",
                        session_id,
                        report_err
                    );
                }
                CompletionOutcome::SystemError
            }
        }
    }

    async fn complete_locked(
        &self,
        session_id: &str,
        fail_on_observation_error: bool,
    ) -> CoordinatorResult<CompletionOutcome> {
        let session = self.store.get(session_id).await;

        let Some(job_name) = session.current_training_job.clone() else {
            return Ok(CompletionOutcome::NoActiveJob);
        };
        if session.completion_notified {
            return Ok(CompletionOutcome::AlreadyNotified);
        }

        let (remote, snapshot) = self.fetch_progress(&job_name).await;

        if remote.is_none() && !fail_on_observation_error {
            return Ok(CompletionOutcome::Unobserved(snapshot));
        }
        if snapshot.has_failed {
            self.complete_failure(session, &job_name, remote.as_ref(), &snapshot)
                .await?;
            return Ok(CompletionOutcome::Failed);
        }
        if !snapshot.is_complete {
            return Ok(CompletionOutcome::StillRunning(snapshot));
        }

        self.complete_success(session, &job_name, remote).await
    }

    async fn complete_failure(
        &self,
        mut session: Session,
        job_name: &str,
        remote: Option<&RemoteJob>,
        snapshot: &ProgressSnapshot,
    ) -> CoordinatorResult<()> {
        let display_name = remote
            .map(|j| j.display_name.as_str())
            .filter(|n| !n.is_empty())
            .unwrap_or(job_name);
        let reason = remote
            .and_then(|j| j.error_message.as_deref())
            .unwrap_or(snapshot.stage.as_str());

        let text = format!(
            "Training job \"{}\" did not finish successfully (state: {}).\n\n\
             Reason: {}\n\n\
             You can pick a different target column or upload a cleaner dataset, \
             then ask me to start training again.",
            display_name, snapshot.real_state, reason
        );

        session.finish_training(Stage::TrainingFailed);
        session.push_message(ChatMessage::assistant(text).with_metadata(json!({
            "type": "training_failed",
            "jobName": job_name,
            "progress": snapshot,
        })));
        self.store.put(session).await?;

        tracing::warn!("Training job {} failed ({})", job_name, snapshot.real_state);
        Ok(())
    }

    async fn complete_success(
        &self,
        mut session: Session,
        job_name: &str,
        remote: Option<RemoteJob>,
    ) -> CoordinatorResult<CompletionOutcome> {
        if let Err(e) = self.register_completed_models().await {
            tracing::warn!("Model registration scan failed: {}", e);
        }
        if !self.store.has_model_for_job(job_name).await {
            if let Some(job) = &remote {
                self.register_job(job).await?;
            }
        }

        let Some(model) = self.store.find_model_by_job(job_name).await else {
            tracing::error!("No model registered for succeeded job {}", job_name);
            session.finish_training(Stage::TrainingFailed);
            session.push_message(
                ChatMessage::assistant(
                    "Training finished, but I couldn't register the resulting model, \
                     so nothing was deployed. Please try training again.",
                )
                .with_metadata(json!({ "type": "registration_failed", "jobName": job_name })),
            );
            self.store.put(session).await?;
            return Ok(CompletionOutcome::RegistrationFailed);
        };

        let endpoint = self.deploy_endpoint(&model).await?;

        let dataset = self
            .store
            .find_dataset_or_latest(model.dataset_id.as_deref().or(session.current_dataset.as_deref()))
            .await;
        let ui_request = UiRequest {
            model: model.clone(),
            endpoint: endpoint.clone(),
            dataset,
        };
        let ui_path = match self.ui.generate(&ui_request).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!("UI generation for model {} failed: {}", model.id, e);
                None
            }
        };

        let text = success_message(&model, &endpoint, ui_path.as_ref());
        session.current_model = Some(model.id.clone());
        session.current_endpoint = Some(endpoint.id.clone());
        session.custom_ui_path = ui_path.as_ref().map(|p| p.display().to_string());
        session.finish_training(Stage::Deployed);
        session.push_message(ChatMessage::assistant(text).with_metadata(json!({
            "type": "training_complete",
            "jobName": job_name,
            "modelId": model.id,
            "endpointId": endpoint.id,
            "endpointUrl": endpoint.url,
            "simulatedEndpoint": endpoint.simulated,
            "customUiPath": session.custom_ui_path,
        })));
        self.store.put(session).await?;

        tracing::info!(
            "Job {} completed: model {} deployed to endpoint {}",
            job_name,
            model.id,
            endpoint.id
        );

        Ok(CompletionOutcome::Deployed {
            model_id: model.id,
            endpoint_id: endpoint.id,
            simulated: endpoint.simulated,
            ui_path,
        })
    }

    /// Mirror every succeeded remote job that has no model record yet.
    /// Returns how many records were inserted.
    pub async fn register_completed_models(&self) -> CoordinatorResult<usize> {
        let jobs = self.service.list_succeeded_jobs().await?;
        let mut inserted = 0;
        for job in &jobs {
            if self.register_job(job).await? {
                inserted += 1;
            }
        }
        if inserted > 0 {
            tracing::info!("Registered {} new model(s) from completed jobs", inserted);
        }
        Ok(inserted)
    }

    async fn register_job(&self, job: &RemoteJob) -> CoordinatorResult<bool> {
        if job.model_name.is_none() {
            tracing::debug!("Job {} reports no uploaded model, skipping registration", job.name);
            return Ok(false);
        }
        if self.store.has_model_for_job(&job.name).await {
            return Ok(false);
        }
        let local = self.store.find_training_job(&job.name).await;
        let display_name = if job.display_name.is_empty() {
            local
                .as_ref()
                .map(|j| j.display_name.clone())
                .unwrap_or_else(|| job.name.clone())
        } else {
            job.display_name.clone()
        };

        let record = ModelRecord {
            id: Uuid::new_v4().to_string(),
            display_name,
            training_job_name: job.name.clone(),
            remote_model_name: job.model_name.clone(),
            dataset_id: local.as_ref().and_then(|j| j.dataset_id.clone()),
            target_column: local.as_ref().and_then(|j| j.target_column.clone()),
            created_at: Utc::now(),
        };
        Ok(self.store.insert_model_if_absent(record).await?)
    }

    /// Deploy `model`, falling back to a simulated endpoint record if the service refuses.
    pub async fn deploy_endpoint(&self, model: &ModelRecord) -> CoordinatorResult<EndpointRecord> {
        let id = Uuid::new_v4().to_string();

        let deployed = match &model.remote_model_name {
            Some(remote_model) => match self
                .service
                .deploy_model(remote_model, &model.display_name)
                .await
            {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    tracing::warn!(
                        "Deploying model {} failed, using a simulated endpoint: {}",
                        model.id,
                        e
                    );
                    None
                }
            },
            None => {
                tracing::warn!(
                    "Model {} has no remote model name, using a simulated endpoint",
                    model.id
                );
                None
            }
        };

        let record = match deployed {
            Some(endpoint) => EndpointRecord {
                id,
                model_id: model.id.clone(),
                remote_endpoint_name: Some(endpoint.endpoint_name),
                simulated: false,
                url: endpoint.url,
                created_at: Utc::now(),
            },
            None => EndpointRecord {
                url: format!("/predict/{}", id),
                id,
                model_id: model.id.clone(),
                remote_endpoint_name: None,
                simulated: true,
                created_at: Utc::now(),
            },
        };

        self.store.insert_endpoint(record.clone()).await?;
        Ok(record)
    }

    /// Tell the user that auto-notification broke and retire the job handle so
    /// the poller and sweep stop retrying. The handle moves to `last_training_job`.
    async fn report_system_error(&self, session_id: &str) -> CoordinatorResult<()> {
        let mut session = self.store.get(session_id).await;
        if session.completion_notified {
            return Ok(());
        }

        session.finish_training(Stage::TrainingFailed);
        session.push_message(
            ChatMessage::assistant(
                "Sorry, the auto-notification system hit an error while finishing your \
                 training job. Check the models list or start a new training run.",
            )
            .with_metadata(json!({ "type": SYSTEM_ERROR_KIND })),
        );
        self.store.put(session).await.map_err(CoordinatorError::from)
    }
}

fn success_message(model: &ModelRecord, endpoint: &EndpointRecord, ui_path: Option<&PathBuf>) -> String {
    let mut text = format!(
        "Your model \"{}\" finished training and has been deployed.\n\n\
         - Model ID: {}\n\
         - Endpoint: {}",
        model.display_name, model.id, endpoint.url
    );
    if endpoint.simulated {
        text.push_str(" (simulated: the live deployment could not be created)");
    }
    if let Some(target) = &model.target_column {
        text.push_str(&format!("\n- Predicts: {}", target));
    }
    match ui_path {
        Some(path) => text.push_str(&format!("\n- Prediction UI: {}", path.display())),
        None => text.push_str(
            "\n\nThe prediction UI could not be generated, but the endpoint is ready to use.",
        ),
    }
    text
}
