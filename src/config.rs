use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use job_coordinator::CoordinatorConfig;
use ml_service::VertexConfig;

use crate::{LuantraError, LuantraResult};

/// HTTP server and local storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub state_file: PathBuf,
    /// Where uploads land when no bucket is configured.
    pub upload_dir: PathBuf,
    pub ui_dir: PathBuf,
    /// Upload datasets to this GCS bucket instead of `upload_dir`.
    pub gcs_bucket: Option<String>,
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3001".to_string(),
            state_file: PathBuf::from("data/platform-state.json"),
            upload_dir: PathBuf::from("data/uploads"),
            ui_dir: PathBuf::from("data/generated-ui"),
            gcs_bucket: None,
            max_upload_mb: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LuantraConfig {
    pub server: ServerConfig,
    pub vertex: VertexConfig,
    pub coordinator: CoordinatorConfig,
}

impl LuantraConfig {
    /// Read `path` if it exists, otherwise start from defaults. Environment
    /// overrides are applied on top either way.
    pub fn load(path: &Path) -> LuantraResult<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| LuantraError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            tracing::info!("No config file at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `LUANTRA_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> LuantraResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LUANTRA_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = lookup("LUANTRA_STATE_FILE") {
            self.server.state_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("LUANTRA_UPLOAD_DIR") {
            self.server.upload_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("LUANTRA_UI_DIR") {
            self.server.ui_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("LUANTRA_GCS_BUCKET") {
            self.server.gcs_bucket = Some(v);
        }
        if let Some(v) = lookup("LUANTRA_PROJECT_ID") {
            self.vertex.project_id = v;
        }
        if let Some(v) = lookup("LUANTRA_REGION") {
            self.vertex.region = v;
        }
        if let Some(v) = lookup("LUANTRA_ACCESS_TOKEN") {
            self.vertex.access_token = Some(v);
        }
        if let Some(v) = lookup("LUANTRA_POLL_INTERVAL_SECS") {
            self.coordinator.poll_interval_secs = parse_number("LUANTRA_POLL_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("LUANTRA_STATUS_ERROR_TOLERANCE") {
            self.coordinator.status_error_tolerance =
                parse_number("LUANTRA_STATUS_ERROR_TOLERANCE", &v)?;
        }
        Ok(())
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.server.max_upload_mb * 1024 * 1024
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> LuantraResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| LuantraError::Config(format!("{} must be a number, got {:?}", key, value)))
}
