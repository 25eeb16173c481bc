/*!
# State Store

Persisted platform state for Luantra: chat sessions plus the dataset, training
job, model and endpoint collections, held in memory and written to disk as a
single JSON document.
*/

pub mod store;
pub mod types;

pub use store::{spawn_autosave, SessionStore};
pub use types::{
    ChatMessage, DatasetAnalysis, DatasetRecord, EndpointRecord, ModelRecord, PlatformState, Role,
    Session, Stage, TrainingJobRecord,
};

/// Result type for state store operations
pub type StateResult<T> = Result<T, StateError>;

/// State store specific errors
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
