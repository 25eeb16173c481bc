use async_trait::async_trait;
use reqwest::{Client, Url};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::{ServiceError, ServiceResult};

/// Blob storage for uploaded datasets.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key`, returning a URI the training service can read.
    async fn put(&self, key: &str, bytes: &[u8]) -> ServiceResult<String>;

    async fn get(&self, uri: &str) -> ServiceResult<Vec<u8>>;
}

/// Keeps blobs under a local directory. URIs are `file://` paths.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> ServiceResult<PathBuf> {
        let relative = Path::new(key);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(ServiceError::Config(format!("invalid blob key: {}", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> ServiceResult<String> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;
        let absolute = fs::canonicalize(&path).await?;
        Ok(format!("file://{}", absolute.display()))
    }

    async fn get(&self, uri: &str) -> ServiceResult<Vec<u8>> {
        let path = uri
            .strip_prefix("file://")
            .ok_or_else(|| ServiceError::Config(format!("not a local blob uri: {}", uri)))?;
        Ok(fs::read(path).await?)
    }
}

/// Google Cloud Storage via the JSON API. URIs are `gs://bucket/key`.
pub struct GcsBlobStore {
    client: Client,
    bucket: String,
    access_token: Option<String>,
}

impl GcsBlobStore {
    pub fn new(bucket: impl Into<String>, access_token: Option<String>) -> ServiceResult<Self> {
        let client = Client::builder().timeout(Duration::from_secs(300)).build()?;
        Ok(Self {
            client,
            bucket: bucket.into(),
            access_token,
        })
    }

    fn object_url(&self, key: &str) -> ServiceResult<Url> {
        let mut url = Url::parse("https://storage.googleapis.com/storage/v1/b")
            .map_err(|e| ServiceError::Config(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ServiceError::Config("storage url cannot be a base".to_string()))?
            .push(&self.bucket)
            .push("o")
            .push(key);
        Ok(url)
    }

    async fn check(response: reqwest::Response) -> ServiceResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(ServiceError::Api {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl BlobStore for GcsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> ServiceResult<String> {
        let url = format!(
            "https://storage.googleapis.com/upload/storage/v1/b/{}/o",
            self.bucket
        );
        let mut request = self
            .client
            .post(url)
            .query(&[("uploadType", "media"), ("name", key)])
            .body(bytes.to_vec());
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        Self::check(request.send().await?).await?;
        Ok(format!("gs://{}/{}", self.bucket, key))
    }

    async fn get(&self, uri: &str) -> ServiceResult<Vec<u8>> {
        let prefix = format!("gs://{}/", self.bucket);
        let key = uri
            .strip_prefix(&prefix)
            .ok_or_else(|| ServiceError::Config(format!("not an object in {}: {}", self.bucket, uri)))?;
        let mut request = self.client.get(self.object_url(key)?).query(&[("alt", "media")]);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        let response = Self::check(request.send().await?).await?;
        Ok(response.bytes().await?.to_vec())
    }
}
