// Template Signature Index
// One fingerprint per template: the space-joined field names plus optional
// sample text. FindSimilarTemplates is a MoreLikeThis over these fingerprints,
// scoring field-name overlap heavily and fingerprint-token coverage lightly.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

use crate::contracts::{TemplateSignature, TemplateSimilarity};
use crate::pure::tokenize;
use crate::types::ValidatedTemplateId;

/// Relative weight of exact field-name overlap vs. loose token coverage
const FIELD_OVERLAP_WEIGHT: f64 = 0.7;
const TOKEN_COVERAGE_WEIGHT: f64 = 0.3;

pub struct SignatureIndex {
    state: RwLock<HashMap<ValidatedTemplateId, StoredSignature>>,
}

struct StoredSignature {
    signature: TemplateSignature,
    field_set: HashSet<String>,
    tokens: HashSet<String>,
}

impl Default for SignatureIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureIndex {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
        }
    }

    /// Write or overwrite a template fingerprint
    pub async fn index_signature(&self, signature: &TemplateSignature) -> Result<()> {
        let field_set: HashSet<String> = signature
            .field_names
            .iter()
            .map(|f| f.to_lowercase())
            .collect();
        let tokens: HashSet<String> = tokenize(&signature.fingerprint_text())
            .into_iter()
            .collect();

        let mut state = self.state.write().await;
        debug!(
            template_id = %signature.template_id,
            version = signature.signature_version,
            "Signature indexed"
        );
        state.insert(
            signature.template_id,
            StoredSignature {
                signature: signature.clone(),
                field_set,
                tokens,
            },
        );
        Ok(())
    }

    pub async fn remove_signature(&self, id: &ValidatedTemplateId) -> Result<()> {
        self.state.write().await.remove(id);
        Ok(())
    }

    pub async fn get_signature(&self, id: &ValidatedTemplateId) -> Option<TemplateSignature> {
        self.state.read().await.get(id).map(|s| s.signature.clone())
    }

    pub async fn signature_count(&self) -> usize {
        self.state.read().await.len()
    }

    /// MoreLikeThis: templates most similar to a candidate field-name set
    ///
    /// Scores are in [0, 1]. Ties break toward more overlapping field names,
    /// then lexicographic template name.
    pub async fn find_similar(
        &self,
        field_names: &[String],
        sample_text: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<TemplateSimilarity>> {
        let candidate_fields: HashSet<String> =
            field_names.iter().map(|f| f.to_lowercase()).collect();
        let mut candidate_tokens: HashSet<String> = field_names
            .iter()
            .flat_map(|f| tokenize(f))
            .collect();
        if let Some(sample) = sample_text {
            candidate_tokens.extend(tokenize(sample));
        }

        if candidate_fields.is_empty() && candidate_tokens.is_empty() {
            return Ok(Vec::new());
        }

        let state = self.state.read().await;
        let mut results: Vec<TemplateSimilarity> = state
            .values()
            .filter_map(|stored| {
                let overlap = stored
                    .field_set
                    .intersection(&candidate_fields)
                    .count();
                // Coverage of the template's declared fields; candidate sets
                // are noisy, so extra unmatched candidates do not penalize
                let field_ratio = if stored.field_set.is_empty() {
                    0.0
                } else {
                    overlap as f64 / stored.field_set.len() as f64
                };

                let token_hits = stored
                    .tokens
                    .intersection(&candidate_tokens)
                    .count();
                let token_ratio = if candidate_tokens.is_empty() {
                    0.0
                } else {
                    token_hits as f64 / candidate_tokens.len() as f64
                };

                let score =
                    FIELD_OVERLAP_WEIGHT * field_ratio + TOKEN_COVERAGE_WEIGHT * token_ratio;
                if score <= 0.0 {
                    return None;
                }
                Some(TemplateSimilarity {
                    template_id: stored.signature.template_id,
                    template_name: stored.signature.template_name.clone(),
                    score: score.clamp(0.0, 1.0),
                    overlap,
                })
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.overlap.cmp(&a.overlap))
                .then_with(|| a.template_name.cmp(&b.template_name))
        });
        results.truncate(top_k);
        Ok(results)
    }
}
