/*!
# Luantra

Dataset upload, scripted chat and auto-deployment of managed training jobs.

The HTTP surface in [`routes`] is thin: uploads become dataset records, chat
messages are matched by [`intent`] and turned into calls on the
[`TrainingCoordinator`](job_coordinator::TrainingCoordinator), which owns
polling and the completion workflow.
*/

pub mod app;
pub mod config;
pub mod dataset;
pub mod intent;
pub mod routes;

pub use app::{AppState, ChatReply};
pub use config::{LuantraConfig, ServerConfig};

use job_coordinator::CoordinatorError;
use ml_service::ServiceError;
use state_store::StateError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub type LuantraResult<T> = Result<T, LuantraError>;

#[derive(Debug, thiserror::Error)]
pub enum LuantraError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid dataset: {0}")]
    InvalidDataset(String),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("ML service error: {0}")]
    Service(#[from] ServiceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
