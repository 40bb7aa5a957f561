// Template Matcher
// Given a parsed document, pick the template that best describes it: derive a
// field-name candidate set from the chunks, run MoreLikeThis over the template
// fingerprints, and only escalate to the LLM when the signature score fails
// the confidence gate.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::MatcherSettings;
use crate::contracts::{ParsedDocument, SearchIndex, Store, Template};
use crate::llm_client::LlmClient;
use crate::types::{Confidence, ValidatedTemplateId};

/// A label run like "Invoice Number" or "Effective Date"
static CAPITALIZED_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Z][a-zA-Z]+(?:\s+[A-Z][a-zA-Z]+){0,3})\b").expect("Invalid label pattern")
});

/// How the matcher arrived at its decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    FastMatch,
    LlmFallback,
    NeedsNewTemplate,
}

/// Matcher decision for one parsed document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub template_id: Option<ValidatedTemplateId>,
    pub confidence: Confidence,
    pub source: MatchSource,
    pub reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LlmClassification {
    template_id: Option<String>,
    confidence: f64,
    #[serde(default)]
    reasoning: Option<String>,
}

pub struct TemplateMatcher {
    store: Arc<dyn Store>,
    search_index: Arc<dyn SearchIndex>,
    llm: Option<Arc<dyn LlmClient>>,
    settings: MatcherSettings,
}

impl TemplateMatcher {
    pub fn new(
        store: Arc<dyn Store>,
        search_index: Arc<dyn SearchIndex>,
        llm: Option<Arc<dyn LlmClient>>,
        settings: MatcherSettings,
    ) -> Self {
        Self {
            store,
            search_index,
            llm,
            settings,
        }
    }

    /// Derive candidate field names from parsed chunks: keys before colons,
    /// capitalized label runs, and tokens that recur across chunks
    pub fn derive_field_candidates(parsed: &ParsedDocument) -> Vec<String> {
        let mut candidates: Vec<String> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut push = |raw: &str| {
            let normalized = normalize_label(raw);
            if normalized.len() >= 2 && seen.insert(normalized.clone()) {
                candidates.push(normalized);
            }
        };

        for chunk in &parsed.chunks {
            // Keys before colons ("Invoice Number: 1234")
            if let Some(idx) = chunk.text.find(':') {
                if idx > 0 && idx <= 60 {
                    push(&chunk.text[..idx]);
                }
            }
            // Capitalized label runs
            for capture in CAPITALIZED_LABEL.captures_iter(&chunk.text) {
                if let Some(label) = capture.get(1) {
                    push(label.as_str());
                }
            }
        }

        // Recurring header tokens: words showing up in three or more chunks
        let mut token_chunks: HashMap<String, usize> = HashMap::new();
        for chunk in &parsed.chunks {
            let tokens: std::collections::HashSet<String> = crate::pure::tokenize(&chunk.text)
                .into_iter()
                .filter(|t| t.len() > 3)
                .collect();
            for token in tokens {
                *token_chunks.entry(token).or_insert(0) += 1;
            }
        }
        let mut recurring: Vec<(String, usize)> = token_chunks
            .into_iter()
            .filter(|(_, count)| *count >= 3)
            .collect();
        recurring.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (token, _) in recurring.into_iter().take(10) {
            push(&token);
        }

        candidates
    }

    /// Sample text for signature matching and the classification prompt
    fn sample_text(&self, parsed: &ParsedDocument) -> String {
        parsed
            .chunks
            .iter()
            .take(self.settings.max_sample_chunks)
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Pick the best template for a parsed document
    pub async fn match_document(&self, parsed: &ParsedDocument) -> Result<MatchOutcome> {
        let candidates = Self::derive_field_candidates(parsed);
        let sample = self.sample_text(parsed);
        debug!(candidates = candidates.len(), "Matching document against templates");

        let similar = self
            .search_index
            .find_similar_templates(&candidates, Some(&sample), 3)
            .await?;

        if let Some(best) = similar.first() {
            if best.score >= self.settings.fast_match_threshold {
                info!(
                    template = %best.template_name,
                    score = best.score,
                    "Template matched on the fast path"
                );
                return Ok(MatchOutcome {
                    template_id: Some(best.template_id),
                    confidence: Confidence::clamped(best.score),
                    source: MatchSource::FastMatch,
                    reasoning: None,
                });
            }
        }

        if self.settings.enable_llm_fallback {
            if let Some(llm) = &self.llm {
                return self
                    .llm_classify(llm.as_ref(), &sample, &similar, &candidates)
                    .await;
            }
        }

        // No LLM available: the best signature score stands, but it failed
        // the gate, so a human decides.
        let confidence = similar
            .first()
            .map(|s| Confidence::clamped(s.score))
            .unwrap_or(Confidence::ZERO);
        Ok(MatchOutcome {
            template_id: None,
            confidence,
            source: MatchSource::NeedsNewTemplate,
            reasoning: None,
        })
    }

    async fn llm_classify(
        &self,
        llm: &dyn LlmClient,
        sample: &str,
        similar: &[crate::contracts::TemplateSimilarity],
        candidates: &[String],
    ) -> Result<MatchOutcome> {
        // Candidate templates: signature hits first, then the rest of the
        // catalog up to the configured cap
        let mut templates: Vec<Template> = Vec::new();
        for sim in similar.iter().take(self.settings.max_candidate_templates) {
            if let Some(template) = self.store.get_template(&sim.template_id).await? {
                templates.push(template);
            }
        }
        if templates.is_empty() {
            templates = self
                .store
                .list_templates()
                .await?
                .into_iter()
                .take(self.settings.max_candidate_templates)
                .collect();
        }

        let mut template_listing = String::new();
        for template in &templates {
            template_listing.push_str(&format!(
                "- id: {} name: {} fields: [{}]\n",
                template.id,
                template.name,
                template.field_names().join(", ")
            ));
        }

        let prompt = format!(
            "You match business documents to extraction templates.\n\n\
             Document sample:\n{sample}\n\n\
             Detected labels: {labels}\n\n\
             Candidate templates:\n{template_listing}\n\
             Pick the template that describes this document, or null if none fits.",
            labels = candidates.join(", "),
        );
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "template_id": {"type": ["string", "null"]},
                "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                "reasoning": {"type": "string"}
            },
            "required": ["template_id", "confidence"]
        });

        let raw = llm.complete_json(&prompt, &schema).await?;
        let classification: LlmClassification =
            serde_json::from_value(raw).context("LLM classification had unexpected shape")?;
        let confidence = Confidence::clamped(classification.confidence);

        let chosen = classification
            .template_id
            .as_deref()
            .and_then(|raw_id| ValidatedTemplateId::parse(raw_id).ok())
            .filter(|id| templates.iter().any(|t| t.id == *id));

        match chosen {
            Some(template_id) => {
                info!(
                    template_id = %template_id,
                    confidence = confidence.get(),
                    "Template matched via LLM fallback"
                );
                Ok(MatchOutcome {
                    template_id: Some(template_id),
                    confidence,
                    source: MatchSource::LlmFallback,
                    reasoning: classification.reasoning,
                })
            }
            None => Ok(MatchOutcome {
                template_id: None,
                confidence,
                source: MatchSource::NeedsNewTemplate,
                reasoning: classification.reasoning,
            }),
        }
    }
}

fn normalize_label(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect();
    cleaned
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}
