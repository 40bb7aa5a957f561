// Parser Client
// Typed wrapper over the external document parser. Parsing happens once per
// physical file; every later extraction references the parse by opaque job id
// (`jobid://<id>`), never by re-uploading bytes.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::contracts::{FieldSpec, ParseChunk, ParsedDocument};
use crate::errors::ExternalError;
use crate::types::BoundingBox;

/// Reference to the bytes a structured extraction should run against
///
/// The `JobId` form MUST reuse a prior parse; an implementation that cannot
/// honor it fails rather than silently re-parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRef<'a> {
    Bytes(&'a [u8]),
    JobId(&'a str),
}

impl<'a> SourceRef<'a> {
    /// Parse the wire form: anything starting with `jobid://` is a job ref
    pub fn from_wire(raw: &'a str) -> Self {
        match raw.strip_prefix("jobid://") {
            Some(id) => SourceRef::JobId(id),
            None => SourceRef::Bytes(raw.as_bytes()),
        }
    }

    pub fn is_job_ref(&self) -> bool {
        matches!(self, SourceRef::JobId(_))
    }
}

impl fmt::Display for SourceRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            SourceRef::JobId(id) => write!(f, "jobid://{id}"),
        }
    }
}

/// One extracted field as returned by the parser, before normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawExtraction {
    pub value: Option<serde_json::Value>,
    pub confidence: f64,
    pub page: Option<u32>,
    pub bbox: Option<[f64; 4]>,
}

/// Capability contract for the external parser service
#[async_trait]
pub trait Parser: Send + Sync {
    /// Parse raw bytes into positioned chunks and full text
    ///
    /// # Postconditions
    /// - Returns an opaque job id that later `extract_structured` calls can
    ///   reference without re-uploading the bytes
    async fn parse(&self, bytes: &[u8]) -> Result<(String, ParsedDocument)>;

    /// Run structured extraction for the given field specs
    ///
    /// # Postconditions
    /// - `SourceRef::JobId` reuses the prior parse (no re-parse, no re-upload)
    /// - Field names absent from the response mean the parser found nothing;
    ///   callers normalize them to null-value, zero-confidence entries
    async fn extract_structured(
        &self,
        source: SourceRef<'_>,
        fields: &[FieldSpec],
    ) -> Result<HashMap<String, RawExtraction>>;
}

/// HTTP implementation against the parser service
pub struct HttpParser {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct WireParseResponse {
    job_id: Option<String>,
    chunks: Option<Vec<WireChunk>>,
    full_text: Option<String>,
}

#[derive(Deserialize)]
struct WireChunk {
    page: u32,
    bbox: Option<[f64; 4]>,
    text: String,
}

#[derive(Serialize)]
struct WireExtractRequest<'a> {
    source: String,
    fields: Vec<WireFieldSpec<'a>>,
}

#[derive(Serialize)]
struct WireFieldSpec<'a> {
    name: &'a str,
    field_type: String,
    description: &'a str,
    extraction_hints: &'a [String],
}

impl HttpParser {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    fn classify(err: reqwest::Error) -> ExternalError {
        if err.is_timeout() || err.is_connect() {
            return ExternalError::transient("parser", err.to_string());
        }
        match err.status() {
            Some(status) if status.is_server_error() => {
                ExternalError::transient("parser", err.to_string())
            }
            _ => ExternalError::permanent("parser", err.to_string()),
        }
    }

    fn validate_parse_payload(payload: WireParseResponse) -> Result<(String, ParsedDocument)> {
        let job_id = match payload.job_id {
            Some(id) if !id.is_empty() => id,
            _ => bail!(ExternalError::malformed("parser", "response missing job_id")),
        };
        let chunks = match payload.chunks {
            Some(chunks) => chunks,
            None => bail!(ExternalError::malformed("parser", "response missing chunks")),
        };
        let full_text = match payload.full_text {
            Some(text) => text,
            None => bail!(ExternalError::malformed(
                "parser",
                "response missing full_text"
            )),
        };

        let parsed = ParsedDocument {
            chunks: chunks
                .into_iter()
                .map(|c| ParseChunk {
                    page: c.page,
                    bbox: c.bbox.and_then(BoundingBox::from_tuple),
                    text: c.text,
                })
                .collect(),
            full_text,
        };
        Ok((job_id, parsed))
    }
}

#[async_trait]
impl Parser for HttpParser {
    async fn parse(&self, bytes: &[u8]) -> Result<(String, ParsedDocument)> {
        let response = self
            .request(reqwest::Method::POST, "/v1/parse")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(Self::classify)?;

        if response.status().is_server_error() {
            bail!(ExternalError::transient(
                "parser",
                format!("parse returned {}", response.status())
            ));
        }
        if !response.status().is_success() {
            bail!(ExternalError::permanent(
                "parser",
                format!("parse returned {}", response.status())
            ));
        }

        let payload: WireParseResponse = response
            .json()
            .await
            .map_err(|e| ExternalError::malformed("parser", e.to_string()))?;
        Self::validate_parse_payload(payload)
    }

    async fn extract_structured(
        &self,
        source: SourceRef<'_>,
        fields: &[FieldSpec],
    ) -> Result<HashMap<String, RawExtraction>> {
        let request = match source {
            SourceRef::JobId(id) => WireExtractRequest {
                source: format!("jobid://{id}"),
                fields: Self::wire_fields(fields),
            },
            SourceRef::Bytes(_) => {
                // Raw-bytes extraction exists for one-shot callers; the
                // pipeline always goes through a cached job id.
                let (job_id, _) = self.parse(match source {
                    SourceRef::Bytes(bytes) => bytes,
                    SourceRef::JobId(_) => unreachable!(),
                })
                .await?;
                WireExtractRequest {
                    source: format!("jobid://{job_id}"),
                    fields: Self::wire_fields(fields),
                }
            }
        };

        let response = self
            .request(reqwest::Method::POST, "/v1/extract")
            .json(&request)
            .send()
            .await
            .map_err(Self::classify)?;

        if response.status().is_server_error() {
            bail!(ExternalError::transient(
                "parser",
                format!("extract returned {}", response.status())
            ));
        }
        if !response.status().is_success() {
            bail!(ExternalError::permanent(
                "parser",
                format!("extract returned {}", response.status())
            ));
        }

        response
            .json::<HashMap<String, RawExtraction>>()
            .await
            .map_err(|e| ExternalError::malformed("parser", e.to_string()).into())
    }
}

impl HttpParser {
    fn wire_fields<'a>(fields: &'a [FieldSpec]) -> Vec<WireFieldSpec<'a>> {
        fields
            .iter()
            .map(|f| WireFieldSpec {
                name: f.name.as_str(),
                field_type: f.field_type.to_string(),
                description: &f.description,
                extraction_hints: &f.extraction_hints,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_ref_wire_form() {
        let job = SourceRef::from_wire("jobid://abc-123");
        assert_eq!(job, SourceRef::JobId("abc-123"));
        assert!(job.is_job_ref());
        assert_eq!(job.to_string(), "jobid://abc-123");

        let bytes = SourceRef::from_wire("not a job ref");
        assert!(!bytes.is_job_ref());
    }

    #[test]
    fn test_malformed_parse_payload_rejected() {
        // Missing chunks
        let payload = WireParseResponse {
            job_id: Some("j1".to_string()),
            chunks: None,
            full_text: Some("text".to_string()),
        };
        assert!(HttpParser::validate_parse_payload(payload).is_err());

        // Missing full_text
        let payload = WireParseResponse {
            job_id: Some("j1".to_string()),
            chunks: Some(vec![]),
            full_text: None,
        };
        assert!(HttpParser::validate_parse_payload(payload).is_err());

        // Implausible bounding boxes are dropped, not fatal
        let payload = WireParseResponse {
            job_id: Some("j1".to_string()),
            chunks: Some(vec![WireChunk {
                page: 1,
                bbox: Some([50_000.0, 0.0, 10.0, 10.0]),
                text: "chunk".to_string(),
            }]),
            full_text: Some("chunk".to_string()),
        };
        let (job_id, parsed) = HttpParser::validate_parse_payload(payload).unwrap();
        assert_eq!(job_id, "j1");
        assert!(parsed.chunks[0].bbox.is_none());
    }
}
