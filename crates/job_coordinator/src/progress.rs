//! Heuristic progress for training jobs.
//!
//! The managed service only reports a coarse lifecycle state, so percentages,
//! stage labels and ETAs are derived from that state plus the time elapsed since
//! the job was created. The bands below are the display contract; they are not
//! measurements.

use chrono::{DateTime, Utc};
use ml_service::JobState;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Minutes a typical run is assumed to take once past the fixed bands.
pub const ASSUMED_TOTAL_MINUTES: f64 = 10.0;

/// Running jobs never report more than this until the service says they succeeded.
pub const MAX_RUNNING_PERCENTAGE: u8 = 98;

/// `real_state` reported when the status call itself failed.
pub const ERROR_STATE: &str = "ERROR";

/// (upper bound in minutes, percentage, stage, eta)
const RUNNING_BANDS: [(f64, u8, &str, &str); 6] = [
    (1.0, 20, "Loading and validating dataset", "About 9 minutes remaining"),
    (2.0, 35, "Engineering features", "About 8 minutes remaining"),
    (3.0, 50, "Training candidate models", "About 7 minutes remaining"),
    (4.0, 70, "Tuning hyperparameters", "About 5 minutes remaining"),
    (5.0, 85, "Evaluating model performance", "About 3 minutes remaining"),
    (7.0, 95, "Finalizing and exporting model", "About 1-2 minutes remaining"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub percentage: u8,
    pub stage: String,
    pub eta: String,
    pub is_complete: bool,
    pub has_failed: bool,
    pub real_state: String,
}

impl ProgressSnapshot {
    fn new(state: JobState, percentage: u8, stage: &str, eta: &str) -> Self {
        Self {
            percentage: percentage.min(100),
            stage: stage.to_string(),
            eta: eta.to_string(),
            is_complete: state == JobState::Succeeded,
            has_failed: matches!(
                state,
                JobState::Failed | JobState::Cancelled | JobState::Expired
            ),
            real_state: state.as_str().to_ascii_uppercase(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.is_complete || self.has_failed
    }

    /// Snapshot for a session with nothing in flight.
    pub fn idle() -> Self {
        Self {
            percentage: 0,
            stage: "No active training".to_string(),
            eta: "N/A".to_string(),
            is_complete: false,
            has_failed: false,
            real_state: "NONE".to_string(),
        }
    }
}

/// Map a lifecycle state and the time since job creation to a display snapshot.
pub fn estimate(state: JobState, elapsed: Duration) -> ProgressSnapshot {
    match state {
        JobState::Succeeded => ProgressSnapshot::new(state, 100, "Training complete", "Complete"),
        JobState::Failed => ProgressSnapshot::new(state, 0, "Training failed", "N/A"),
        JobState::Cancelled => ProgressSnapshot::new(state, 0, "Training cancelled", "N/A"),
        JobState::Expired => ProgressSnapshot::new(state, 0, "Training expired", "N/A"),
        JobState::Queued => ProgressSnapshot::new(
            state,
            5,
            "Job queued",
            "Waiting for resources (1-2 minutes)",
        ),
        JobState::Pending => ProgressSnapshot::new(
            state,
            15,
            "Preparing training environment",
            "About 10 minutes remaining",
        ),
        JobState::Running => running(elapsed),
        JobState::Cancelling => ProgressSnapshot::new(state, 0, "Cancelling training", "Stopping"),
        JobState::Paused => {
            ProgressSnapshot::new(state, 0, "Training paused", "Waiting for the job to resume")
        }
        JobState::Unspecified => {
            ProgressSnapshot::new(state, 0, "Initializing training job", "Estimating...")
        }
    }
}

fn running(elapsed: Duration) -> ProgressSnapshot {
    let minutes = elapsed.as_secs_f64() / 60.0;

    for (upper, percentage, stage, eta) in RUNNING_BANDS {
        if minutes < upper {
            return ProgressSnapshot::new(JobState::Running, percentage, stage, eta);
        }
    }

    // Past the last band: approach but never reach MAX_RUNNING_PERCENTAGE, and
    // never fall back below the last band.
    let floor = RUNNING_BANDS[RUNNING_BANDS.len() - 1].1;
    let projected = (minutes / ASSUMED_TOTAL_MINUTES * 100.0).floor();
    let percentage = projected.clamp(floor as f64, MAX_RUNNING_PERCENTAGE as f64) as u8;
    ProgressSnapshot::new(
        JobState::Running,
        percentage,
        "Wrapping up training",
        "Almost done, taking longer than usual",
    )
}

/// Snapshot used when the status call failed. Failure to observe counts as failure.
pub fn observation_failed(reason: &str) -> ProgressSnapshot {
    ProgressSnapshot {
        percentage: 0,
        stage: format!("Unable to check training status: {}", reason),
        eta: "Unknown".to_string(),
        is_complete: false,
        has_failed: true,
        real_state: ERROR_STATE.to_string(),
    }
}

/// Wall-clock time since `created`, zero if the service clock is ahead of ours.
pub fn elapsed_since(created: DateTime<Utc>) -> Duration {
    (Utc::now() - created).to_std().unwrap_or_default()
}
