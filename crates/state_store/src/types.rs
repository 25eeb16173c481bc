use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Where a session sits in the upload → train → deploy pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Initial,
    Training,
    Deployed,
    TrainingFailed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initial => "initial",
            Stage::Training => "training",
            Stage::Deployed => "deployed",
            Stage::TrainingFailed => "training_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Per-conversation record: chat history plus pointers into the platform state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub conversation_history: Vec<ChatMessage>,
    #[serde(default)]
    pub current_dataset: Option<String>,
    #[serde(default)]
    pub current_model: Option<String>,
    #[serde(default)]
    pub current_endpoint: Option<String>,
    #[serde(default)]
    pub target_column: Option<String>,
    #[serde(default)]
    pub custom_ui_path: Option<String>,
    /// Outstanding job handle. Non-null only while `stage == Training`.
    #[serde(default)]
    pub current_training_job: Option<String>,
    #[serde(default)]
    pub last_training_job: Option<String>,
    #[serde(default)]
    pub stage: Stage,
    #[serde(default)]
    pub completion_notified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            conversation_history: Vec::new(),
            current_dataset: None,
            current_model: None,
            current_endpoint: None,
            target_column: None,
            custom_ui_path: None,
            current_training_job: None,
            last_training_job: None,
            stage: Stage::Initial,
            completion_notified: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push_message(&mut self, message: ChatMessage) {
        self.updated_at = message.timestamp;
        self.conversation_history.push(message);
    }

    /// Point the session at a freshly submitted job and re-arm the completion guard.
    pub fn begin_training(&mut self, job_name: &str) {
        self.current_training_job = Some(job_name.to_string());
        self.stage = Stage::Training;
        self.completion_notified = false;
        self.updated_at = Utc::now();
    }

    /// Retire the outstanding job handle after the completion workflow has handled it.
    pub fn finish_training(&mut self, stage: Stage) {
        if let Some(job) = self.current_training_job.take() {
            self.last_training_job = Some(job);
        }
        self.stage = stage;
        self.completion_notified = true;
        self.updated_at = Utc::now();
    }

    pub fn has_active_job(&self) -> bool {
        self.current_training_job.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetAnalysis {
    pub format: String,
    pub columns: Vec<String>,
    pub row_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetRecord {
    pub id: String,
    pub name: String,
    pub original_name: String,
    pub size: u64,
    #[serde(default)]
    pub analysis: DatasetAnalysis,
    pub storage_uri: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJobRecord {
    pub id: String,
    pub job_name: String,
    pub display_name: String,
    pub dataset_id: Option<String>,
    pub target_column: Option<String>,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    pub id: String,
    pub display_name: String,
    /// Job handle this model was produced by; used for duplicate-safe registration.
    pub training_job_name: String,
    #[serde(default)]
    pub remote_model_name: Option<String>,
    #[serde(default)]
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub target_column: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRecord {
    pub id: String,
    pub model_id: String,
    #[serde(default)]
    pub remote_endpoint_name: Option<String>,
    /// Locally synthesized when the real deployment call failed.
    #[serde(default)]
    pub simulated: bool,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// The whole persisted document. Its shape is the on-disk format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformState {
    #[serde(default)]
    pub datasets: Vec<DatasetRecord>,
    #[serde(default)]
    pub models: Vec<ModelRecord>,
    #[serde(default)]
    pub training_jobs: Vec<TrainingJobRecord>,
    #[serde(default)]
    pub endpoints: Vec<EndpointRecord>,
    #[serde(default)]
    pub sessions: HashMap<String, Session>,
}
