// LLM Client
// Typed wrapper over the external completion service. Carries the process-wide
// prompt cache (LRU + TTL), cacheable-system-prefix annotation, and token
// accounting so every call site logs its cached/total ratio.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::LlmSettings;
use crate::errors::ExternalError;
use crate::observability::record_llm_usage;
use crate::wrappers::TtlCache;

/// Options for a completion call
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    /// Stable instruction prefix; mark cacheable to get the reduced rate on
    /// repeats within the provider's cache TTL
    pub system_prefix: Option<String>,
    pub cache_system_prefix: bool,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            system_prefix: None,
            cache_system_prefix: true,
            max_tokens: 1024,
            temperature: 0.0,
        }
    }
}

/// Completion result with token accounting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub cached_tokens: u64,
    pub total_tokens: u64,
}

/// Capability contract for the external LLM
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str, opts: &CompletionOptions) -> Result<LlmResponse>;

    /// Complete with output constrained to JSON matching `schema`
    ///
    /// Un-parseable output gets exactly one retry with a stricter prompt;
    /// a second failure surfaces as a malformed-external error.
    async fn complete_json(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let opts = CompletionOptions::default();
        let framed = format!(
            "{prompt}\n\nRespond with a single JSON object matching this schema, and nothing else:\n{schema}"
        );

        let first = self.complete(&framed, &opts).await?;
        match parse_json_output(&first.text) {
            Ok(value) => Ok(value),
            Err(first_err) => {
                warn!(error = %first_err, "LLM returned unparseable JSON, retrying stricter");
                let stricter = format!(
                    "{framed}\n\nIMPORTANT: your previous output was not valid JSON. \
                     Output ONLY the JSON object. No prose, no markdown fences."
                );
                let second = self.complete(&stricter, &opts).await?;
                parse_json_output(&second.text).map_err(|e| {
                    ExternalError::malformed("llm", format!("invalid JSON after retry: {e}"))
                        .into()
                })
            }
        }
    }
}

/// Extract a JSON value from model output, tolerating markdown fences and
/// surrounding prose
pub fn parse_json_output(text: &str) -> Result<serde_json::Value> {
    let trimmed = text.trim();

    // Direct parse first
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    // Strip ```json fences
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim);
    if let Some(candidate) = unfenced {
        if let Ok(value) = serde_json::from_str(candidate) {
            return Ok(value);
        }
    }

    // Last resort: widest braces span
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                return Ok(value);
            }
        }
    }

    bail!("No JSON object found in model output")
}

/// HTTP implementation with the process-wide prompt cache
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    prompt_cache: Mutex<TtlCache<u64, LlmResponse>>,
}

#[derive(Serialize)]
struct WireCompletionRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<WireSystemPrefix<'a>>,
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct WireSystemPrefix<'a> {
    text: &'a str,
    /// Provider-side cache annotation for the reduced repeat rate
    cache: bool,
}

#[derive(Deserialize)]
struct WireCompletionResponse {
    text: String,
    #[serde(default)]
    cached_tokens: u64,
    total_tokens: u64,
}

impl HttpLlmClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        settings: &LlmSettings,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            prompt_cache: Mutex::new(TtlCache::new(
                settings.prompt_cache_capacity,
                settings.prompt_cache_ttl(),
            )),
        })
    }

    fn cache_key(prompt: &str, opts: &CompletionOptions) -> u64 {
        let mut hasher = DefaultHasher::new();
        opts.system_prefix.hash(&mut hasher);
        prompt.hash(&mut hasher);
        opts.max_tokens.hash(&mut hasher);
        hasher.finish()
    }

    fn classify(err: reqwest::Error) -> ExternalError {
        if err.is_timeout() || err.is_connect() {
            return ExternalError::transient("llm", err.to_string());
        }
        match err.status() {
            Some(status) if status.is_server_error() => {
                ExternalError::transient("llm", err.to_string())
            }
            _ => ExternalError::permanent("llm", err.to_string()),
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str, opts: &CompletionOptions) -> Result<LlmResponse> {
        let key = Self::cache_key(prompt, opts);
        {
            let mut cache = self.prompt_cache.lock().await;
            if let Some(hit) = cache.get(&key) {
                debug!("Prompt cache hit");
                let mut response = hit.clone();
                // A local hit costs nothing new; report fully cached
                response.cached_tokens = response.total_tokens;
                record_llm_usage("cache_hit", response.cached_tokens, response.total_tokens);
                return Ok(response);
            }
        }

        let request = WireCompletionRequest {
            model: &self.model,
            system: opts.system_prefix.as_deref().map(|text| WireSystemPrefix {
                text,
                cache: opts.cache_system_prefix,
            }),
            prompt,
            max_tokens: opts.max_tokens,
            temperature: opts.temperature,
        };

        let response = self
            .client
            .post(format!("{}/v1/complete", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(Self::classify)?;

        if response.status().is_server_error() {
            bail!(ExternalError::transient(
                "llm",
                format!("completion returned {}", response.status())
            ));
        }
        if !response.status().is_success() {
            bail!(ExternalError::permanent(
                "llm",
                format!("completion returned {}", response.status())
            ));
        }

        let payload: WireCompletionResponse = response
            .json()
            .await
            .map_err(|e| ExternalError::malformed("llm", e.to_string()))?;

        let result = LlmResponse {
            text: payload.text,
            cached_tokens: payload.cached_tokens,
            total_tokens: payload.total_tokens,
        };
        record_llm_usage("completion", result.cached_tokens, result.total_tokens);

        self.prompt_cache.lock().await.insert(key, result.clone());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_output_variants() {
        let direct = parse_json_output(r#"{"intent": "retrieve"}"#).unwrap();
        assert_eq!(direct["intent"], "retrieve");

        let fenced = parse_json_output("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(fenced["a"], 1);

        let prose = parse_json_output("Here you go: {\"b\": 2} hope that helps").unwrap();
        assert_eq!(prose["b"], 2);

        assert!(parse_json_output("no json here").is_err());
    }

    #[test]
    fn test_cache_key_sensitivity() {
        let opts = CompletionOptions::default();
        let with_prefix = CompletionOptions {
            system_prefix: Some("You classify documents.".to_string()),
            ..CompletionOptions::default()
        };

        assert_eq!(
            HttpLlmClient::cache_key("prompt", &opts),
            HttpLlmClient::cache_key("prompt", &opts)
        );
        assert_ne!(
            HttpLlmClient::cache_key("prompt", &opts),
            HttpLlmClient::cache_key("other", &opts)
        );
        assert_ne!(
            HttpLlmClient::cache_key("prompt", &opts),
            HttpLlmClient::cache_key("prompt", &with_prefix)
        );
    }
}
