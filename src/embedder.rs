// Embedder Client
// Typed wrapper over the external embedding service. The dimension is fixed
// at configuration time; every returned vector is checked against it.

use anyhow::{bail, ensure, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EmbedderSettings;
use crate::errors::ExternalError;

/// Capability contract for the external embedder
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed text into a fixed-dimension vector
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimension(&self) -> usize;
}

/// HTTP implementation against the embedding service
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    dimension: usize,
}

#[derive(Serialize)]
struct WireEmbedRequest<'a> {
    input: &'a str,
}

#[derive(Deserialize)]
struct WireEmbedResponse {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        settings: &EmbedderSettings,
    ) -> Result<Self> {
        ensure!(settings.dimension > 0, "Embedding dimension must be positive");
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
            dimension: settings.dimension,
        })
    }

    fn classify(err: reqwest::Error) -> ExternalError {
        if err.is_timeout() || err.is_connect() {
            return ExternalError::transient("embedder", err.to_string());
        }
        match err.status() {
            Some(status) if status.is_server_error() => {
                ExternalError::transient("embedder", err.to_string())
            }
            _ => ExternalError::permanent("embedder", err.to_string()),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut request = self
            .client
            .post(format!("{}/v1/embed", self.base_url))
            .json(&WireEmbedRequest { input: text });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(Self::classify)?;

        if response.status().is_server_error() {
            bail!(ExternalError::transient(
                "embedder",
                format!("embed returned {}", response.status())
            ));
        }
        if !response.status().is_success() {
            bail!(ExternalError::permanent(
                "embedder",
                format!("embed returned {}", response.status())
            ));
        }

        let payload: WireEmbedResponse = response
            .json()
            .await
            .map_err(|e| ExternalError::malformed("embedder", e.to_string()))?;

        ensure!(
            payload.embedding.len() == self.dimension,
            ExternalError::malformed(
                "embedder",
                format!(
                    "expected dimension {}, got {}",
                    self.dimension,
                    payload.embedding.len()
                )
            )
        );
        Ok(payload.embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
