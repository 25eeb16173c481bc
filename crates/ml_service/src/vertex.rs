use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::types::{DeployedEndpoint, JobState, RemoteJob, TrainingRequest};
use crate::{MlService, ServiceError, ServiceResult};

/// Connection and training settings for Vertex AI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VertexConfig {
    pub project_id: String,
    pub region: String,
    /// OAuth bearer token. Minting and refreshing it is left to the deployment.
    pub access_token: Option<String>,
    /// Override for the regional API root, mostly for tests and proxies.
    pub base_url: Option<String>,
    pub trainer_image: String,
    pub serving_image: String,
    pub machine_type: String,
    pub output_uri_prefix: String,
    pub request_timeout_secs: u64,
}

impl Default for VertexConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            region: "us-central1".to_string(),
            access_token: None,
            base_url: None,
            trainer_image: "us-docker.pkg.dev/vertex-ai/training/sklearn-cpu.1-0:latest".to_string(),
            serving_image: "us-docker.pkg.dev/vertex-ai/prediction/sklearn-cpu.1-0:latest"
                .to_string(),
            machine_type: "n1-standard-4".to_string(),
            output_uri_prefix: String::new(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VertexPipeline {
    name: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    state: String,
    create_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    model_to_upload: Option<VertexModelRef>,
    error: Option<VertexStatus>,
}

#[derive(Debug, Deserialize)]
struct VertexModelRef {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VertexStatus {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPipelinesResponse {
    #[serde(default)]
    training_pipelines: Vec<VertexPipeline>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VertexOperation {
    name: String,
}

#[derive(Debug, Deserialize)]
struct VertexError {
    error: VertexErrorDetails,
}

#[derive(Debug, Deserialize)]
struct VertexErrorDetails {
    message: String,
}

impl From<VertexPipeline> for RemoteJob {
    fn from(p: VertexPipeline) -> Self {
        RemoteJob {
            state: JobState::from_remote(&p.state),
            name: p.name,
            display_name: p.display_name,
            create_time: p.create_time,
            end_time: p.end_time,
            model_name: p.model_to_upload.and_then(|m| m.name),
            error_message: p.error.and_then(|e| e.message),
        }
    }
}

/// REST client for Vertex AI training pipelines and endpoints.
#[derive(Clone)]
pub struct VertexClient {
    client: Client,
    config: VertexConfig,
    base_url: String,
}

impl VertexClient {
    pub fn new(config: VertexConfig) -> ServiceResult<Self> {
        if config.project_id.is_empty() {
            return Err(ServiceError::Config("vertex project_id is not set".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}-aiplatform.googleapis.com/v1", config.region))
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client,
            config,
            base_url,
        })
    }

    fn location_path(&self) -> String {
        format!(
            "{}/projects/{}/locations/{}",
            self.base_url, self.config.project_id, self.config.region
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> ServiceResult<T> {
        let response = self.authorize(request).send().await?;
        let response = Self::check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))
    }

    async fn check_status(response: Response) -> ServiceResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<VertexError>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);
        Err(ServiceError::Api {
            status: status.as_u16(),
            message,
        })
    }

    fn pipeline_body(&self, request: &TrainingRequest) -> Value {
        let mut args = vec![
            "--dataset-uri".to_string(),
            request.dataset_uri.clone(),
            "--target-column".to_string(),
            request.target_column.clone(),
        ];
        if !request.feature_columns.is_empty() {
            args.push("--feature-columns".to_string());
            args.push(request.feature_columns.join(","));
        }

        json!({
            "displayName": request.display_name,
            "trainingTaskDefinition":
                "gs://google-cloud-aiplatform/schema/trainingjob/definition/custom_task_1.0.0.yaml",
            "trainingTaskInputs": {
                "workerPoolSpecs": [{
                    "machineSpec": { "machineType": self.config.machine_type },
                    "replicaCount": 1,
                    "containerSpec": {
                        "imageUri": self.config.trainer_image,
                        "args": args,
                    },
                }],
                "baseOutputDirectory": { "outputUriPrefix": self.config.output_uri_prefix },
            },
            "modelToUpload": {
                "displayName": format!("{}-model", request.display_name),
                "containerSpec": { "imageUri": self.config.serving_image },
            },
        })
    }
}

/// `projects/p/locations/l/endpoints/123/operations/456` → `projects/p/locations/l/endpoints/123`
fn endpoint_from_operation(operation: &str) -> ServiceResult<String> {
    operation
        .split_once("/operations/")
        .map(|(endpoint, _)| endpoint.to_string())
        .ok_or_else(|| {
            ServiceError::InvalidResponse(format!("unexpected operation name: {}", operation))
        })
}

#[async_trait]
impl MlService for VertexClient {
    async fn create_training_job(&self, request: &TrainingRequest) -> ServiceResult<RemoteJob> {
        let url = format!("{}/trainingPipelines", self.location_path());
        let pipeline: VertexPipeline = self
            .send(self.client.post(url).json(&self.pipeline_body(request)))
            .await?;
        tracing::info!("Submitted training pipeline {}", pipeline.name);
        Ok(pipeline.into())
    }

    async fn get_training_job(&self, job_name: &str) -> ServiceResult<RemoteJob> {
        let url = format!("{}/{}", self.base_url, job_name);
        let pipeline: VertexPipeline = self.send(self.client.get(url)).await?;
        Ok(pipeline.into())
    }

    async fn list_succeeded_jobs(&self) -> ServiceResult<Vec<RemoteJob>> {
        let url = format!("{}/trainingPipelines", self.location_path());
        let mut jobs = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![(
                "filter".to_string(),
                "state=\"PIPELINE_STATE_SUCCEEDED\"".to_string(),
            )];
            if let Some(token) = &page_token {
                query.push(("pageToken".to_string(), token.clone()));
            }

            let page: ListPipelinesResponse =
                self.send(self.client.get(&url).query(&query)).await?;
            jobs.extend(page.training_pipelines.into_iter().map(RemoteJob::from));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(jobs)
    }

    async fn deploy_model(&self, model_name: &str, display_name: &str) -> ServiceResult<DeployedEndpoint> {
        let create_url = format!("{}/endpoints", self.location_path());
        let operation: VertexOperation = self
            .send(
                self.client
                    .post(create_url)
                    .json(&json!({ "displayName": format!("{}-endpoint", display_name) })),
            )
            .await?;
        let endpoint_name = endpoint_from_operation(&operation.name)?;

        let deploy_url = format!("{}/{}:deployModel", self.base_url, endpoint_name);
        let deploy_body = json!({
            "deployedModel": {
                "model": model_name,
                "displayName": display_name,
                "dedicatedResources": {
                    "machineSpec": { "machineType": self.config.machine_type },
                    "minReplicaCount": 1,
                    "maxReplicaCount": 1,
                },
            },
            "trafficSplit": { "0": 100 },
        });
        let _: VertexOperation = self
            .send(self.client.post(deploy_url).json(&deploy_body))
            .await?;

        tracing::info!("Deploying model {} to endpoint {}", model_name, endpoint_name);
        Ok(DeployedEndpoint {
            url: format!("{}/{}:predict", self.base_url, endpoint_name),
            endpoint_name,
        })
    }
}
