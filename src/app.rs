use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use job_coordinator::{CoordinatorError, TrainingCoordinator};
use ml_service::{BlobStore, TrainingRequest};
use state_store::{ChatMessage, DatasetRecord, Session, SessionStore, Stage};

use crate::config::LuantraConfig;
use crate::dataset;
use crate::intent::{classify, Intent};
use crate::LuantraResult;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<LuantraConfig>,
    pub store: Arc<SessionStore>,
    pub coordinator: Arc<TrainingCoordinator>,
    pub blobs: Arc<dyn BlobStore>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub session_id: String,
    pub message: String,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hints: Option<Value>,
}

struct Reply {
    text: String,
    hints: Option<Value>,
}

impl Reply {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            hints: None,
        }
    }

    fn with_hints(text: impl Into<String>, hints: Value) -> Self {
        Self {
            text: text.into(),
            hints: Some(hints),
        }
    }
}

const APOLOGY: &str = "Sorry, something went wrong on my side while handling that. \
                       Please try again in a moment.";

impl AppState {
    pub fn new(
        config: LuantraConfig,
        store: Arc<SessionStore>,
        coordinator: Arc<TrainingCoordinator>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            coordinator,
            blobs,
        }
    }

    /// Append under the session lock so completion can't overwrite it.
    async fn append(&self, session_id: &str, message: ChatMessage) -> LuantraResult<Session> {
        let _guard = self.store.lock_session(session_id).await;
        let mut session = self.store.get(session_id).await;
        session.push_message(message);
        self.store.put(session.clone()).await?;
        Ok(session)
    }

    /// Store an uploaded dataset and, when a session is given, make it that
    /// session's current dataset.
    pub async fn ingest_dataset(
        &self,
        session_id: Option<&str>,
        file_name: &str,
        bytes: &[u8],
    ) -> LuantraResult<DatasetRecord> {
        let format = dataset::detect_format(file_name)?;
        let analysis = dataset::analyze(format, bytes);
        let id = Uuid::new_v4().to_string();
        let stored_name = format!("{}.{}", id, format);
        let storage_uri = self
            .blobs
            .put(&format!("datasets/{}", stored_name), bytes)
            .await?;

        let record = DatasetRecord {
            id,
            name: stored_name,
            original_name: file_name.to_string(),
            size: bytes.len() as u64,
            analysis,
            storage_uri,
            uploaded_at: Utc::now(),
        };
        self.store.insert_dataset(record.clone()).await?;
        tracing::info!(
            "Stored dataset {} ({}, {} bytes, {} columns)",
            record.id,
            record.original_name,
            record.size,
            record.analysis.columns.len()
        );

        if let Some(session_id) = session_id {
            let _guard = self.store.lock_session(session_id).await;
            let mut session = self.store.get(session_id).await;
            session.current_dataset = Some(record.id.clone());
            session.target_column = None;
            session.push_message(
                ChatMessage::assistant(describe_dataset(&record))
                    .with_metadata(json!({ "type": "dataset_uploaded", "datasetId": record.id })),
            );
            self.store.put(session).await?;
        }

        Ok(record)
    }

    /// Handle one chat turn. Internal failures become an apology, never an error.
    pub async fn chat(&self, session_id: &str, message: &str) -> ChatReply {
        let reply = match self.respond(session_id, message).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("Chat handling for session {} failed: {}", session_id, e);
                Reply::text(APOLOGY)
            }
        };

        let mut assistant = ChatMessage::assistant(reply.text.clone());
        if let Some(hints) = &reply.hints {
            assistant = assistant.with_metadata(hints.clone());
        }
        let stage = match self.append(session_id, assistant).await {
            Ok(session) => session.stage,
            Err(e) => {
                tracing::error!("Could not record reply for session {}: {}", session_id, e);
                self.store.get(session_id).await.stage
            }
        };

        ChatReply {
            session_id: session_id.to_string(),
            message: reply.text,
            stage,
            hints: reply.hints,
        }
    }

    async fn respond(&self, session_id: &str, message: &str) -> LuantraResult<Reply> {
        let session = self.append(session_id, ChatMessage::user(message)).await?;
        let dataset = match &session.current_dataset {
            Some(id) => self.store.find_dataset(id).await,
            None => None,
        };
        let columns = dataset
            .as_ref()
            .map(|d| d.analysis.columns.clone())
            .unwrap_or_default();

        match classify(message, &columns) {
            Intent::Reset => {
                {
                    let _guard = self.store.lock_session(session_id).await;
                    self.store.clear(session_id).await?;
                }
                Ok(Reply::text(
                    "Starting fresh. Upload a dataset whenever you're ready.",
                ))
            }
            Intent::CheckStatus => Ok(self.status_reply(session_id).await),
            Intent::Deploy => self.deploy_reply(session_id).await,
            Intent::SelectTarget(column) => {
                {
                    let _guard = self.store.lock_session(session_id).await;
                    self.store
                        .update(session_id, |s| s.target_column = Some(column.clone()))
                        .await?;
                }
                Ok(Reply::with_hints(
                    format!(
                        "Got it, I'll train a model that predicts \"{}\". Say \"train\" when you're ready.",
                        column
                    ),
                    json!({ "type": "target_selected", "targetColumn": column }),
                ))
            }
            Intent::StartTraining { target } => {
                let target = target.or(session.target_column.clone());
                self.training_reply(session_id, dataset, target).await
            }
            Intent::Help | Intent::Other => Ok(Reply::text(help_text(&session, &columns))),
        }
    }

    async fn training_reply(
        &self,
        session_id: &str,
        dataset: Option<DatasetRecord>,
        target: Option<String>,
    ) -> LuantraResult<Reply> {
        let Some(dataset) = dataset else {
            return Ok(Reply::text(
                "I need a dataset before I can train anything. Upload a CSV, JSON or Excel file first.",
            ));
        };
        let Some(target) = target else {
            return Ok(Reply::with_hints(
                format!(
                    "Which column should the model predict? Your dataset has: {}.",
                    dataset.analysis.columns.join(", ")
                ),
                json!({ "type": "choose_target", "columns": dataset.analysis.columns }),
            ));
        };

        let request = TrainingRequest {
            display_name: training_display_name(&dataset, &target),
            dataset_uri: dataset.storage_uri.clone(),
            target_column: target.clone(),
            feature_columns: dataset
                .analysis
                .columns
                .iter()
                .filter(|c| **c != target)
                .cloned()
                .collect(),
        };

        match self
            .coordinator
            .start_training(session_id, request, Some(dataset.id.clone()))
            .await
        {
            Ok((job, _)) => Ok(Reply::with_hints(
                format!(
                    "Training has started on \"{}\" to predict \"{}\". This usually takes about \
                     10 minutes; I'll post here as soon as the model is deployed.",
                    dataset.original_name, target
                ),
                json!({ "type": "training_started", "jobName": job.name, "targetColumn": target }),
            )),
            Err(CoordinatorError::TrainingInProgress(_)) => Ok(Reply::text(
                "A training job is already running for this session. Ask me for the status any time.",
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn status_reply(&self, session_id: &str) -> Reply {
        let status = self.coordinator.training_status(session_id).await;
        let hints = json!({ "type": "training_status", "status": &status });

        if !status.has_active_job {
            let session = self.store.get(session_id).await;
            let text = match session.stage {
                Stage::Deployed => "Your latest model is trained and deployed.".to_string(),
                Stage::TrainingFailed => {
                    "The last training run failed. Pick a target and say \"train\" to try again."
                        .to_string()
                }
                _ => "There's no training job running right now.".to_string(),
            };
            return Reply::with_hints(text, hints);
        }

        let progress = &status.progress;
        let text = if progress.is_complete {
            "Training finished. Your model is being deployed.".to_string()
        } else if progress.has_failed && status.stage == Stage::Training.as_str() {
            "I couldn't reach the training service just now. The job is still being \
             tracked, so ask again in a moment."
                .to_string()
        } else if progress.has_failed {
            format!("Training did not succeed: {}.", progress.stage)
        } else {
            format!(
                "Training is {}% done: {}. {}.",
                progress.percentage, progress.stage, progress.eta
            )
        };
        Reply::with_hints(text, hints)
    }

    async fn deploy_reply(&self, session_id: &str) -> LuantraResult<Reply> {
        match self.coordinator.deploy_model(session_id, None).await {
            Ok(endpoint) => Ok(Reply::with_hints(
                format!("Deployed to {}.", endpoint.url),
                json!({ "type": "deployed", "endpoint": endpoint }),
            )),
            Err(CoordinatorError::NotFound(_)) => Ok(Reply::text(
                "There's no trained model to deploy yet.",
            )),
            Err(e) => Err(e.into()),
        }
    }
}

fn training_display_name(dataset: &DatasetRecord, target: &str) -> String {
    let stem = dataset
        .original_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(&dataset.original_name);
    let raw = format!("{}-{}-{}", stem, target, Utc::now().format("%Y%m%d%H%M%S"));
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

fn describe_dataset(record: &DatasetRecord) -> String {
    let analysis = &record.analysis;
    if analysis.columns.is_empty() {
        return format!(
            "I saved \"{}\", but couldn't read its columns. Tell me which column to predict.",
            record.original_name
        );
    }
    let rows = analysis
        .row_count
        .map(|n| format!(" and {} rows", n))
        .unwrap_or_default();
    format!(
        "I found {} columns{} in \"{}\": {}. Which one should I predict?",
        analysis.columns.len(),
        rows,
        record.original_name,
        analysis.columns.join(", ")
    )
}

fn help_text(session: &Session, columns: &[String]) -> String {
    match session.stage {
        Stage::Training => {
            "Your model is training. Ask \"what's the status?\" to check on it.".to_string()
        }
        Stage::Deployed => {
            "Your model is live. Upload a new dataset to train another, or say \"start over\"."
                .to_string()
        }
        _ if session.current_dataset.is_none() => {
            "Upload a CSV, JSON or Excel dataset and I'll help you train a model on it."
                .to_string()
        }
        _ if session.target_column.is_some() => {
            "Say \"train\" to start training, or name a different column to predict.".to_string()
        }
        _ => format!(
            "Tell me which column to predict. Options: {}.",
            columns.join(", ")
        ),
    }
}
