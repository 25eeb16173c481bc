/*!
# Job Coordinator

Lifecycle coordination for managed training jobs: heuristic progress,
duplicate-free monitoring, timer-driven polling with a recovery sweep, and the
exactly-once completion workflow that registers, deploys and announces a
finished model.
*/

use serde::{Deserialize, Serialize};
use std::time::Duration;

use ml_service::ServiceError;
use state_store::StateError;

pub mod completion;
pub mod coordinator;
pub mod poller;
pub mod progress;
pub mod registry;
pub mod ui;

pub use completion::{CompletionOutcome, CompletionWorkflow};
pub use coordinator::{TrainingCoordinator, TrainingStatus};
pub use poller::{JobPoller, PollExit, PollerConfig, ProgressUpdate};
pub use progress::{estimate, ProgressSnapshot};
pub use registry::{JobMonitorRegistry, MonitorEntry};
pub use ui::{FileUiGenerator, UiGenerator, UiRequest};

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("ML service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Session {0} already has a training job in progress")]
    TrainingInProgress(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("UI generation failed: {0}")]
    UiGeneration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Timing knobs, loaded from the `[coordinator]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub poll_interval_secs: u64,
    pub max_monitor_minutes: u64,
    pub sweep_interval_secs: u64,
    pub autosave_interval_secs: u64,
    /// 1 means the first failed status call fails the job.
    pub status_error_tolerance: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            max_monitor_minutes: 45,
            sweep_interval_secs: 30,
            autosave_interval_secs: 30,
            status_error_tolerance: 1,
        }
    }
}

impl CoordinatorConfig {
    pub fn poller(&self) -> PollerConfig {
        PollerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            max_duration: Duration::from_secs(self.max_monitor_minutes * 60),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            status_error_tolerance: self.status_error_tolerance.max(1),
        }
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs.max(1))
    }
}
