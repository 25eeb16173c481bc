/*!
# ML Service

Thin clients for the external collaborators Luantra depends on: the managed
training/model/endpoint service (Vertex AI) and dataset object storage.

The coordinator only talks to these through [`MlService`] and [`BlobStore`], so
tests and alternative backends can swap them out.
*/

use async_trait::async_trait;

pub mod storage;
pub mod types;
pub mod vertex;

pub use storage::{BlobStore, GcsBlobStore, LocalBlobStore};
pub use types::{DeployedEndpoint, JobState, RemoteJob, TrainingRequest};
pub use vertex::{VertexClient, VertexConfig};

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Service returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ServiceError {
    /// Whether retrying the same call later could plausibly succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            ServiceError::Http(e) => e.is_timeout() || e.is_connect(),
            ServiceError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Operations Luantra needs from the managed training service.
#[async_trait]
pub trait MlService: Send + Sync {
    /// Submit a training run and return its handle and initial state.
    async fn create_training_job(&self, request: &TrainingRequest) -> ServiceResult<RemoteJob>;

    async fn get_training_job(&self, job_name: &str) -> ServiceResult<RemoteJob>;

    /// All runs the service reports as succeeded.
    async fn list_succeeded_jobs(&self) -> ServiceResult<Vec<RemoteJob>>;

    /// Create an endpoint and deploy `model_name` onto it.
    async fn deploy_model(&self, model_name: &str, display_name: &str) -> ServiceResult<DeployedEndpoint>;
}
