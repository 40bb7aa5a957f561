// Process-Wide Configuration
// Every tunable has a default from the product configuration table; the whole
// Settings tree serializes to the store's settings file so operator overrides
// survive restarts.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Template-matching thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherSettings {
    /// Best signature score at or above this commits without the LLM
    pub fast_match_threshold: f64,
    /// LLM confidence below this means a new template is needed
    pub create_new_threshold: f64,
    /// Whether low-score matches escalate to the LLM at all
    pub enable_llm_fallback: bool,
    /// Candidate templates offered to the LLM classifier
    pub max_candidate_templates: usize,
    /// Parsed chunks included in the classification prompt
    pub max_sample_chunks: usize,
}

impl Default for MatcherSettings {
    fn default() -> Self {
        Self {
            fast_match_threshold: 0.70,
            create_new_threshold: 0.60,
            enable_llm_fallback: true,
            max_candidate_templates: 5,
            max_sample_chunks: 8,
        }
    }
}

/// Audit thresholds shared by the validator, extractor, and citation tracker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSettings {
    /// Confidence strictly below this needs human review
    pub review_threshold: f64,
    /// Confidence at or above this counts as high for severity promotion
    pub high_confidence: f64,
    /// Confidence below this demotes rule failures to warnings
    pub low_confidence: f64,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            review_threshold: 0.60,
            high_confidence: 0.85,
            low_confidence: 0.60,
        }
    }
}

/// Query-planner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerSettings {
    /// Plans at or above this confidence skip LLM refinement
    pub fast_path_threshold: f64,
    /// Synonyms added per token during query expansion
    pub max_expansions: usize,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            fast_path_threshold: 0.70,
            max_expansions: 3,
        }
    }
}

/// Ingestion-pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub worker_pool_size: usize,
    pub parse_deadline_ms: u64,
    pub extract_deadline_ms: u64,
    /// Rough per-call cost used for batch analytics, in cents
    pub llm_cost_estimate_cents: f64,
}

impl PipelineSettings {
    pub fn parse_deadline(&self) -> Duration {
        Duration::from_millis(self.parse_deadline_ms)
    }

    pub fn extract_deadline(&self) -> Duration {
        Duration::from_millis(self.extract_deadline_ms)
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: 8,
            parse_deadline_ms: 60_000,
            extract_deadline_ms: 60_000,
            llm_cost_estimate_cents: 2.0,
        }
    }
}

/// Retrieval and answer-generation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySettings {
    pub query_deadline_ms: u64,
    /// Candidates fetched from the index before fusion
    pub top_k: usize,
    /// Hits fed to the LLM for answer generation
    pub answer_k: usize,
    /// Reciprocal-rank-fusion constant
    pub rrf_k: f64,
    /// Keyword-vs-semantic mixing weight
    pub rrf_alpha: f64,
    /// Whether to rerank with the semantic index when it has entries
    pub enable_semantic_rerank: bool,
    /// Trigram similarity floor for the fuzzy fallback
    pub fuzzy_similarity_threshold: f64,
    /// Score penalty applied to unverified fields at ordering time
    pub unverified_penalty: f64,
    pub query_cache_ttl_s: u64,
    pub query_cache_capacity: usize,
}

impl QuerySettings {
    pub fn query_deadline(&self) -> Duration {
        Duration::from_millis(self.query_deadline_ms)
    }

    pub fn query_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.query_cache_ttl_s)
    }
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            query_deadline_ms: 5_000,
            top_k: 50,
            answer_k: 10,
            rrf_k: 60.0,
            rrf_alpha: 0.5,
            enable_semantic_rerank: false,
            fuzzy_similarity_threshold: 0.3,
            unverified_penalty: 0.05,
            query_cache_ttl_s: 300,
            query_cache_capacity: 512,
        }
    }
}

/// Index-time weights and protection caps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSettings {
    /// Band A: filename and explicit identifiers
    pub weight_identifier: u32,
    /// Band B: primary fields declared by the template
    pub weight_primary: u32,
    /// Band C: body text and everything else
    pub weight_body: u32,
    /// Reject documents that would push the dynamic field count past this
    pub max_dynamic_fields: usize,
    /// Values longer than this are stored but not keyword-indexed
    pub max_keyword_length: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            weight_identifier: 3,
            weight_primary: 2,
            weight_body: 1,
            max_dynamic_fields: 1000,
            max_keyword_length: 256,
        }
    }
}

/// LLM client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub prompt_cache_ttl_s: u64,
    pub prompt_cache_capacity: usize,
}

impl LlmSettings {
    pub fn prompt_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.prompt_cache_ttl_s)
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            prompt_cache_ttl_s: 300,
            prompt_cache_capacity: 256,
        }
    }
}

/// Embedder client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedderSettings {
    /// Fixed output dimension, configured once
    pub dimension: usize,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
}

impl Default for EmbedderSettings {
    fn default() -> Self {
        Self {
            dimension: 384,
            max_retries: 3,
            retry_base_ms: 500,
            retry_cap_ms: 8_000,
        }
    }
}

/// The full process-wide configuration tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub matcher: MatcherSettings,
    pub audit: AuditSettings,
    pub planner: PlannerSettings,
    pub pipeline: PipelineSettings,
    pub query: QuerySettings,
    pub index: IndexSettings,
    pub llm: LlmSettings,
    pub embedder: EmbedderSettings,
}

impl Settings {
    /// Validate cross-field constraints that individual setters cannot see
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("fast_match_threshold", self.matcher.fast_match_threshold),
            ("create_new_threshold", self.matcher.create_new_threshold),
            ("review_threshold", self.audit.review_threshold),
            ("high_confidence", self.audit.high_confidence),
            ("fast_path_threshold", self.planner.fast_path_threshold),
            ("rrf_alpha", self.query.rrf_alpha),
        ] {
            ensure!(
                (0.0..=1.0).contains(&value),
                "Setting {} must be in [0, 1], got {}",
                name,
                value
            );
        }
        ensure!(
            self.audit.review_threshold <= self.audit.high_confidence,
            "review_threshold must not exceed high_confidence"
        );
        ensure!(
            self.pipeline.worker_pool_size > 0,
            "worker_pool_size must be positive"
        );
        ensure!(self.query.top_k > 0, "top_k must be positive");
        ensure!(
            self.query.answer_k <= self.query.top_k,
            "answer_k cannot exceed top_k"
        );
        ensure!(self.embedder.dimension > 0, "embedder dimension must be positive");
        Ok(())
    }

    /// Load settings from a JSON file, falling back to defaults if absent
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        let settings: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Persist settings to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let raw = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, raw)
            .with_context(|| format!("Failed to write settings file: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_match_product_configuration() {
        let settings = Settings::default();
        assert_eq!(settings.matcher.fast_match_threshold, 0.70);
        assert_eq!(settings.matcher.create_new_threshold, 0.60);
        assert!(settings.matcher.enable_llm_fallback);
        assert_eq!(settings.audit.review_threshold, 0.60);
        assert_eq!(settings.audit.high_confidence, 0.85);
        assert_eq!(settings.planner.fast_path_threshold, 0.70);
        assert_eq!(settings.planner.max_expansions, 3);
        assert_eq!(settings.pipeline.worker_pool_size, 8);
        assert_eq!(settings.pipeline.parse_deadline_ms, 60_000);
        assert_eq!(settings.pipeline.extract_deadline_ms, 60_000);
        assert_eq!(settings.query.query_deadline_ms, 5_000);
        assert_eq!(settings.query.rrf_k, 60.0);
        assert_eq!(settings.query.rrf_alpha, 0.5);
        assert_eq!(settings.query.top_k, 50);
        assert_eq!(settings.query.answer_k, 10);
        assert_eq!(settings.query.query_cache_ttl_s, 300);
        assert_eq!(settings.llm.prompt_cache_ttl_s, 300);
        assert_eq!(
            (
                settings.index.weight_identifier,
                settings.index.weight_primary,
                settings.index.weight_body
            ),
            (3, 2, 1)
        );
        assert_eq!(settings.index.max_dynamic_fields, 1000);
        assert_eq!(settings.index.max_keyword_length, 256);
        settings.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_bad_thresholds() {
        let mut settings = Settings::default();
        settings.matcher.fast_match_threshold = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.audit.review_threshold = 0.9;
        settings.audit.high_confidence = 0.8;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.query.answer_k = 100;
        settings.query.top_k = 50;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings = Settings::default();
        settings.query.enable_semantic_rerank = true;
        settings.save(&path).unwrap();

        let loaded = Settings::load_or_default(&path).unwrap();
        assert!(loaded.query.enable_semantic_rerank);

        // Missing file falls back to defaults
        let missing = Settings::load_or_default(&dir.path().join("absent.json")).unwrap();
        assert!(!missing.query.enable_semantic_rerank);
    }
}
