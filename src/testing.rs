// Deterministic Test Doubles
// In-process fakes for the three external collaborators. Deterministic on
// purpose: the same input always produces the same parse, completion, or
// embedding, so tests and local runs are reproducible without any service.

use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::contracts::{FieldSpec, ParseChunk, ParsedDocument};
use crate::embedder::Embedder;
use crate::llm_client::{CompletionOptions, LlmClient, LlmResponse};
use crate::parser_client::{Parser, RawExtraction, SourceRef};
use crate::types::ContentHash;

/// Parser fake that "parses" UTF-8 bytes into line chunks
///
/// Structured extraction reads `Label: value` lines, with explicit per-field
/// overrides for anything a test wants to pin down. Counters expose how many
/// times raw bytes reached the service, which is what the pipelining
/// invariant is asserted against.
#[derive(Default)]
pub struct StubParser {
    jobs: DashMap<String, ParsedDocument>,
    by_hash: DashMap<ContentHash, String>,
    overrides: DashMap<String, RawExtraction>,
    job_counter: AtomicU64,
    bytes_parse_count: AtomicU64,
    bytes_extract_count: AtomicU64,
}

impl StubParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the extraction result for one field name
    pub fn with_extraction(
        self,
        field_name: &str,
        value: serde_json::Value,
        confidence: f64,
        page: Option<u32>,
    ) -> Self {
        self.overrides.insert(
            field_name.to_string(),
            RawExtraction {
                value: Some(value),
                confidence,
                page,
                bbox: None,
            },
        );
        self
    }

    /// Times `parse` was called with raw bytes
    pub fn bytes_parse_count(&self) -> u64 {
        self.bytes_parse_count.load(Ordering::SeqCst)
    }

    /// Times `extract_structured` was called with raw bytes instead of a job id
    pub fn bytes_extract_count(&self) -> u64 {
        self.bytes_extract_count.load(Ordering::SeqCst)
    }

    fn parse_text(text: &str) -> ParsedDocument {
        let chunks: Vec<ParseChunk> = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(i, line)| ParseChunk {
                page: (i / 40) as u32 + 1,
                bbox: None,
                text: line.trim().to_string(),
            })
            .collect();
        ParsedDocument {
            chunks,
            full_text: text.to_string(),
        }
    }

    fn extract_from_parsed(
        &self,
        parsed: &ParsedDocument,
        fields: &[FieldSpec],
    ) -> HashMap<String, RawExtraction> {
        let mut result = HashMap::new();
        for spec in fields {
            let name = spec.name.as_str();
            if let Some(pinned) = self.overrides.get(name) {
                result.insert(name.to_string(), pinned.clone());
                continue;
            }
            // Default behavior: match a "Label: value" line, where the label
            // is the field name with underscores as spaces.
            let label = name.replace('_', " ").to_lowercase();
            let found = parsed.chunks.iter().find_map(|chunk| {
                let lowered = chunk.text.to_lowercase();
                lowered
                    .strip_prefix(&format!("{label}:"))
                    .map(|_| {
                        let value = chunk.text[label.len() + 1..].trim().to_string();
                        (value, chunk.page)
                    })
            });
            if let Some((value, page)) = found {
                result.insert(
                    name.to_string(),
                    RawExtraction {
                        value: Some(serde_json::Value::String(value)),
                        confidence: 0.9,
                        page: Some(page),
                        bbox: None,
                    },
                );
            }
        }
        result
    }
}

#[async_trait]
impl Parser for StubParser {
    async fn parse(&self, bytes: &[u8]) -> Result<(String, ParsedDocument)> {
        self.bytes_parse_count.fetch_add(1, Ordering::SeqCst);
        let hash = ContentHash::of_bytes(bytes);

        if let Some(job_id) = self.by_hash.get(&hash) {
            let job_id = job_id.clone();
            let parsed = self
                .jobs
                .get(&job_id)
                .map(|entry| entry.clone())
                .expect("job for known hash");
            return Ok((job_id, parsed));
        }

        let job_id = format!("J{}", self.job_counter.fetch_add(1, Ordering::SeqCst) + 1);
        let parsed = Self::parse_text(&String::from_utf8_lossy(bytes));
        self.jobs.insert(job_id.clone(), parsed.clone());
        self.by_hash.insert(hash, job_id.clone());
        Ok((job_id, parsed))
    }

    async fn extract_structured(
        &self,
        source: SourceRef<'_>,
        fields: &[FieldSpec],
    ) -> Result<HashMap<String, RawExtraction>> {
        let parsed = match source {
            SourceRef::JobId(job_id) => match self.jobs.get(job_id) {
                Some(parsed) => parsed.clone(),
                None => bail!("Unknown parse job: {job_id}"),
            },
            SourceRef::Bytes(bytes) => {
                self.bytes_extract_count.fetch_add(1, Ordering::SeqCst);
                Self::parse_text(&String::from_utf8_lossy(bytes))
            }
        };
        Ok(self.extract_from_parsed(&parsed, fields))
    }
}

/// LLM fake fed from a queue of scripted responses
///
/// Each `complete` pops the next scripted text; an empty queue falls back to
/// an empty JSON object so JSON-mode callers still parse. Every prompt is
/// recorded for assertions.
#[derive(Default)]
pub struct ScriptedLlm {
    responses: Mutex<std::collections::VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    call_count: AtomicU64,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, text: impl Into<String>) {
        self.responses
            .lock()
            .expect("scripted llm lock")
            .push_back(text.into());
    }

    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.push_response(text);
        self
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("scripted llm lock").clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, prompt: &str, _opts: &CompletionOptions) -> Result<LlmResponse> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .expect("scripted llm lock")
            .push(prompt.to_string());

        let text = self
            .responses
            .lock()
            .expect("scripted llm lock")
            .pop_front()
            .unwrap_or_else(|| "{}".to_string());
        let total_tokens = (prompt.len() / 4) as u64 + 64;
        Ok(LlmResponse {
            text,
            cached_tokens: 0,
            total_tokens,
        })
    }
}

/// Embedder fake producing deterministic pseudo-embeddings
///
/// Vectors are seeded from a byte hash of the text, so identical text embeds
/// identically and different texts land apart.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let hash = ContentHash::of_bytes(text.as_bytes());
        let seed = hash.as_bytes();
        let mut embedding = Vec::with_capacity(self.dimension);
        for i in 0..self.dimension {
            let byte = seed[i % seed.len()] as f32;
            let position = (i as f32) * 0.37;
            embedding.push(((byte / 255.0) - 0.5 + position.sin() * 0.1).clamp(-1.0, 1.0));
        }
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
