use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use tokio::fs;

use state_store::{DatasetRecord, EndpointRecord, ModelRecord};

use crate::{CoordinatorError, CoordinatorResult};

/// Everything needed to describe a prediction form for a deployed model.
#[derive(Debug, Clone)]
pub struct UiRequest {
    pub model: ModelRecord,
    pub endpoint: EndpointRecord,
    pub dataset: Option<DatasetRecord>,
}

/// Produces the prediction UI for a deployed model. Best effort: callers log
/// failures and carry on.
#[async_trait]
pub trait UiGenerator: Send + Sync {
    /// Returns the path of the generated UI.
    async fn generate(&self, request: &UiRequest) -> CoordinatorResult<PathBuf>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UiManifest<'a> {
    title: String,
    model_id: &'a str,
    endpoint_url: &'a str,
    simulated_endpoint: bool,
    target_column: Option<&'a str>,
    fields: Vec<UiField<'a>>,
}

#[derive(Debug, Serialize)]
struct UiField<'a> {
    name: &'a str,
    label: String,
}

/// Writes a JSON manifest the frontend renders into a prediction form.
pub struct FileUiGenerator {
    output_dir: PathBuf,
}

impl FileUiGenerator {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

fn label_for(column: &str) -> String {
    column
        .split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl UiGenerator for FileUiGenerator {
    async fn generate(&self, request: &UiRequest) -> CoordinatorResult<PathBuf> {
        let target = request.model.target_column.as_deref();
        let fields = request
            .dataset
            .as_ref()
            .map(|d| {
                d.analysis
                    .columns
                    .iter()
                    .filter(|c| Some(c.as_str()) != target)
                    .map(|c| UiField {
                        name: c,
                        label: label_for(c),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let manifest = UiManifest {
            title: format!("{} predictor", request.model.display_name),
            model_id: &request.model.id,
            endpoint_url: &request.endpoint.url,
            simulated_endpoint: request.endpoint.simulated,
            target_column: target,
            fields,
        };

        let model_id = &request.model.id;
        if model_id.is_empty() || model_id.contains(['/', '\\']) || model_id.contains("..") {
            return Err(CoordinatorError::UiGeneration(format!(
                "model id {:?} is not usable as a directory name",
                model_id
            )));
        }

        let dir = self.output_dir.join(model_id);
        fs::create_dir_all(&dir).await?;
        let path = dir.join("prediction-ui.json");
        fs::write(&path, serde_json::to_vec_pretty(&manifest)?).await?;

        tracing::info!("Generated prediction UI for model {} at {}", request.model.id, path.display());
        Ok(path)
    }
}
