use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse lifecycle state reported by the managed ML service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Unspecified,
    Queued,
    /// Resources are being provisioned ("preparing").
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelling,
    Cancelled,
    Paused,
    Expired,
}

impl JobState {
    /// Parse the service's enum names, e.g. `PIPELINE_STATE_RUNNING` or `JOB_STATE_RUNNING`.
    pub fn from_remote(raw: &str) -> Self {
        let name = raw
            .trim_start_matches("PIPELINE_STATE_")
            .trim_start_matches("JOB_STATE_");
        match name {
            "QUEUED" => JobState::Queued,
            "PENDING" => JobState::Pending,
            "RUNNING" => JobState::Running,
            "SUCCEEDED" => JobState::Succeeded,
            "FAILED" => JobState::Failed,
            "CANCELLING" => JobState::Cancelling,
            "CANCELLED" => JobState::Cancelled,
            "PAUSED" => JobState::Paused,
            "EXPIRED" => JobState::Expired,
            _ => JobState::Unspecified,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled | JobState::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Unspecified => "unspecified",
            JobState::Queued => "queued",
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelling => "cancelling",
            JobState::Cancelled => "cancelled",
            JobState::Paused => "paused",
            JobState::Expired => "expired",
        }
    }
}

/// One training run as seen by the external service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteJob {
    /// Opaque job handle (full resource name).
    pub name: String,
    pub display_name: String,
    pub state: JobState,
    pub create_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Resource name of the uploaded model, once the run has succeeded.
    pub model_name: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingRequest {
    pub display_name: String,
    pub dataset_uri: String,
    pub target_column: String,
    #[serde(default)]
    pub feature_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedEndpoint {
    pub endpoint_name: String,
    pub url: String,
}
