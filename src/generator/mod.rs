//! Request/response adapter for the external text-generation service.
//!
//! The backend exposes an Ollama-shaped HTTP surface: a model catalog
//! (`GET /api/tags`), a generation endpoint (`POST /api/generate`, single
//! payload, no streaming), and a health probe (`GET /`). Every request is
//! bounded by the configured deadline; timeouts and network failures both map
//! to `Unavailable` so the caller can skip the cycle and move on.

mod postprocess;
mod prompt;

pub use postprocess::postprocess;
pub use prompt::{response_prompt, spontaneous_prompt};

use crate::config::GeneratorConfig;
use crate::store::StoredMessage;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// How long a model catalog fetch stays fresh.
const CATALOG_TTL: Duration = Duration::from_secs(300);

/// Generator failures.
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// Backend unreachable, timed out, or returned a server error. The cycle
    /// is skipped; nothing is retried.
    #[error("generator unavailable: {0}")]
    Unavailable(String),

    /// The backend answered but produced nothing usable.
    #[error("generator returned invalid output")]
    Invalid,

    /// Startup validation failed; the process must not come up.
    #[error("{0}")]
    StartupFatal(String),
}

impl GeneratorError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "generator_unavailable",
            Self::Invalid => "invalid_output",
            Self::StartupFatal(_) => "startup_fatal",
        }
    }
}

/// Generation seam; the Processor only sees this trait.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn list_models(&self) -> Result<Vec<String>, GeneratorError>;

    /// Lightweight liveness probe.
    async fn is_available(&self) -> bool;

    async fn generate_spontaneous(
        &self,
        model: &str,
        context: &[StoredMessage],
        byte_limit: usize,
    ) -> Result<String, GeneratorError>;

    async fn generate_response(
        &self,
        model: &str,
        context: &[StoredMessage],
        user_name: &str,
        user_text: &str,
        byte_limit: usize,
    ) -> Result<String, GeneratorError>;

    /// Fail startup when the configured default model is not in the catalog.
    async fn validate_startup_model(&self, default_model: &str) -> Result<(), GeneratorError>;
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

/// HTTP client for the generation backend.
pub struct HttpGenerator {
    client: reqwest::Client,
    base_url: String,
    catalog: Mutex<Option<(Instant, Vec<String>)>>,
}

impl HttpGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self, GeneratorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GeneratorError::StartupFatal(format!("http client init failed: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            catalog: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn fetch_models(&self) -> Result<Vec<String>, GeneratorError> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(map_reqwest)?;
        if !response.status().is_success() {
            return Err(GeneratorError::Unavailable(format!(
                "model list returned {}",
                response.status()
            )));
        }
        let tags: TagsResponse = response.json().await.map_err(map_reqwest)?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn generate(
        &self,
        model: &str,
        prompt: String,
        byte_limit: usize,
    ) -> Result<String, GeneratorError> {
        let body = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": 0.8,
                "top_p": 0.9,
                "num_predict": 150,
            },
        });

        let started = Instant::now();
        let response = self
            .client
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest)?;

        if !response.status().is_success() {
            return Err(GeneratorError::Unavailable(format!(
                "generate returned {}",
                response.status()
            )));
        }

        let payload: GenerateResponse = response.json().await.map_err(map_reqwest)?;
        let raw = payload.response.ok_or(GeneratorError::Invalid)?;
        let text = postprocess(&raw, byte_limit)?;
        debug!(
            model = %model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            bytes = text.len(),
            "Generation complete"
        );
        Ok(text)
    }

    async fn invalidate_catalog(&self) {
        *self.catalog.lock().await = None;
    }
}

fn map_reqwest(e: reqwest::Error) -> GeneratorError {
    if e.is_timeout() {
        GeneratorError::Unavailable("request timed out".into())
    } else {
        GeneratorError::Unavailable(e.to_string())
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn list_models(&self) -> Result<Vec<String>, GeneratorError> {
        let mut cached = self.catalog.lock().await;
        if let Some((fetched_at, models)) = cached.as_ref() {
            if fetched_at.elapsed() < CATALOG_TTL {
                return Ok(models.clone());
            }
        }
        let models = self.fetch_models().await?;
        *cached = Some((Instant::now(), models.clone()));
        Ok(models)
    }

    async fn is_available(&self) -> bool {
        match self.client.get(self.url("/")).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "Generator health probe failed");
                false
            }
        }
    }

    async fn generate_spontaneous(
        &self,
        model: &str,
        context: &[StoredMessage],
        byte_limit: usize,
    ) -> Result<String, GeneratorError> {
        self.generate(model, spontaneous_prompt(context), byte_limit)
            .await
    }

    async fn generate_response(
        &self,
        model: &str,
        context: &[StoredMessage],
        user_name: &str,
        user_text: &str,
        byte_limit: usize,
    ) -> Result<String, GeneratorError> {
        self.generate(model, response_prompt(context, user_name, user_text), byte_limit)
            .await
    }

    async fn validate_startup_model(&self, default_model: &str) -> Result<(), GeneratorError> {
        let models = match self.list_models().await {
            Ok(models) => models,
            Err(e) => {
                self.invalidate_catalog().await;
                return Err(GeneratorError::StartupFatal(format!(
                    "could not list models for startup validation: {e}"
                )));
            }
        };
        if models.iter().any(|m| m == default_model) {
            Ok(())
        } else {
            self.invalidate_catalog().await;
            warn!(model = %default_model, "Default model missing from catalog");
            Err(GeneratorError::StartupFatal(format!(
                "default model '{default_model}' is not available; catalog: [{}]",
                models.join(", ")
            )))
        }
    }
}
