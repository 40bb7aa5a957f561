// Keyword Index Implementation
// Inverted index over the three weighted text bands of a SearchDoc with
// BM25-style ranking. Filters evaluate against the stored field values, with
// canonical names resolved through each document's canonical-field mapping.

use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::IndexSettings;
use crate::contracts::{FieldFilter, FilterOp, IndexQuery, SearchDoc, SearchHit};
use crate::pure::{normalize_scores, parse_date, parse_number, snippet_window, tokenize};
use crate::types::ValidatedDocumentId;

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

/// Inverted keyword index with weighted term frequencies
///
/// The index is a projection of the store: it lives in memory and is rebuilt
/// by re-indexing from authoritative state, so there is no on-disk format to
/// keep compatible.
pub struct KeywordIndex {
    settings: IndexSettings,
    state: RwLock<KeywordState>,
}

#[derive(Default)]
struct KeywordState {
    /// token -> document -> weighted term frequency
    postings: HashMap<String, HashMap<ValidatedDocumentId, f64>>,
    docs: HashMap<ValidatedDocumentId, IndexedDoc>,
    /// Every distinct field name ever indexed, guarded by the dynamic cap
    dynamic_fields: HashSet<String>,
    total_weighted_length: f64,
}

struct IndexedDoc {
    search_doc: SearchDoc,
    token_weights: HashMap<String, f64>,
    weighted_length: f64,
}

impl KeywordIndex {
    pub fn new(settings: IndexSettings) -> Self {
        Self {
            settings,
            state: RwLock::new(KeywordState::default()),
        }
    }

    /// Weighted token map across the three bands (A=identifiers, B=primary
    /// fields, C=body). Weighting is precomputed here at index time.
    fn weighted_tokens(&self, doc: &SearchDoc) -> HashMap<String, f64> {
        let mut weights: HashMap<String, f64> = HashMap::new();
        let bands = [
            (&doc.identifier_text, self.settings.weight_identifier as f64),
            (&doc.primary_text, self.settings.weight_primary as f64),
            (&doc.body_text, self.settings.weight_body as f64),
        ];
        for (text, weight) in bands {
            for token in tokenize(text) {
                *weights.entry(token).or_insert(0.0) += weight;
            }
        }
        weights
    }

    /// Insert or overwrite a document (idempotent)
    pub async fn index_document(&self, doc: &SearchDoc) -> Result<()> {
        let mut state = self.state.write().await;

        // Index protection: refuse documents that would push the distinct
        // field count past the cap. Checked before any mutation so a refusal
        // leaves the index untouched.
        let new_fields: Vec<&String> = doc
            .fields
            .keys()
            .filter(|name| !state.dynamic_fields.contains(*name))
            .collect();
        if state.dynamic_fields.len() + new_fields.len() > self.settings.max_dynamic_fields {
            bail!(
                "Indexing {} would exceed the dynamic field cap of {}",
                doc.document_id,
                self.settings.max_dynamic_fields
            );
        }

        Self::remove_locked(&mut state, &doc.document_id);

        let token_weights = self.weighted_tokens(doc);
        let weighted_length: f64 = token_weights.values().sum();

        for (token, weight) in &token_weights {
            state
                .postings
                .entry(token.clone())
                .or_default()
                .insert(doc.document_id, *weight);
        }
        for name in doc.fields.keys() {
            state.dynamic_fields.insert(name.clone());
        }
        state.total_weighted_length += weighted_length;
        state.docs.insert(
            doc.document_id,
            IndexedDoc {
                search_doc: doc.clone(),
                token_weights,
                weighted_length,
            },
        );

        debug!(
            doc_id = %doc.document_id,
            fields = doc.fields.len(),
            "Keyword index updated"
        );
        Ok(())
    }

    fn remove_locked(state: &mut KeywordState, id: &ValidatedDocumentId) {
        if let Some(old) = state.docs.remove(id) {
            for token in old.token_weights.keys() {
                if let Some(posting) = state.postings.get_mut(token) {
                    posting.remove(id);
                    if posting.is_empty() {
                        state.postings.remove(token);
                    }
                }
            }
            state.total_weighted_length -= old.weighted_length;
        }
    }

    pub async fn remove_document(&self, id: &ValidatedDocumentId) -> Result<()> {
        let mut state = self.state.write().await;
        Self::remove_locked(&mut state, id);
        Ok(())
    }

    /// The stored search representation, if indexed
    pub async fn get_doc(&self, id: &ValidatedDocumentId) -> Option<SearchDoc> {
        let state = self.state.read().await;
        state.docs.get(id).map(|d| d.search_doc.clone())
    }

    pub async fn doc_count(&self) -> usize {
        self.state.read().await.docs.len()
    }

    /// Execute a resolved query: filters AND'ed, then BM25 text scoring
    pub async fn search(&self, query: &IndexQuery) -> Result<Vec<SearchHit>> {
        let state = self.state.read().await;

        let candidates: Vec<&IndexedDoc> = state
            .docs
            .values()
            .filter(|doc| {
                query
                    .template_id
                    .map(|tid| doc.search_doc.template_id == Some(tid))
                    .unwrap_or(true)
            })
            .filter(|doc| {
                query
                    .filters
                    .iter()
                    .all(|filter| Self::filter_matches(&doc.search_doc, filter))
            })
            .collect();

        let query_tokens: Vec<String> = query
            .text
            .as_deref()
            .map(tokenize)
            .unwrap_or_default();

        let doc_count = state.docs.len() as f64;
        let avg_length = if doc_count > 0.0 {
            state.total_weighted_length / doc_count
        } else {
            0.0
        };

        let mut hits: Vec<SearchHit> = Vec::new();
        let mut raw_scores: Vec<f64> = Vec::new();

        for doc in candidates {
            let (score, matched_fields) = if query_tokens.is_empty() {
                // Filter-only query: every candidate matches equally
                (1.0, Vec::new())
            } else {
                let score =
                    Self::bm25_score(&state, doc, &query_tokens, doc_count, avg_length);
                if score <= 0.0 {
                    continue;
                }
                (score, Self::matched_fields(&doc.search_doc, &query_tokens))
            };

            let snippet = query_tokens
                .first()
                .and_then(|t| {
                    let lowered = doc.search_doc.full_text.to_lowercase();
                    lowered.find(t.as_str()).map(|pos| {
                        snippet_window(&doc.search_doc.full_text, pos, pos + t.len(), 80)
                    })
                });

            raw_scores.push(score);
            hits.push(SearchHit {
                document_id: doc.search_doc.document_id,
                score,
                matched_fields,
                snippet,
                created_at: doc.search_doc.created_at,
                has_verified_fields: !doc.search_doc.verified_fields.is_empty(),
            });
        }

        normalize_scores(&mut raw_scores);
        for (hit, normalized) in hits.iter_mut().zip(raw_scores.iter()) {
            hit.score = *normalized;
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        hits.truncate(query.limit);
        Ok(hits)
    }

    fn bm25_score(
        state: &KeywordState,
        doc: &IndexedDoc,
        query_tokens: &[String],
        doc_count: f64,
        avg_length: f64,
    ) -> f64 {
        let mut score = 0.0;
        let length_norm = if avg_length > 0.0 {
            1.0 - BM25_B + BM25_B * (doc.weighted_length / avg_length)
        } else {
            1.0
        };

        for token in query_tokens {
            let tf = match doc.token_weights.get(token) {
                Some(tf) => *tf,
                None => continue,
            };
            let df = state
                .postings
                .get(token)
                .map(|p| p.len() as f64)
                .unwrap_or(0.0);
            let idf = ((doc_count - df + 0.5) / (df + 0.5) + 1.0).ln();
            score += idf * (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * length_norm);
        }
        score
    }

    /// Field names whose stored value contains any query token
    fn matched_fields(doc: &SearchDoc, query_tokens: &[String]) -> Vec<String> {
        doc.fields
            .iter()
            .filter(|(_, value)| {
                let lowered = value.to_lowercase();
                query_tokens.iter().any(|t| lowered.contains(t.as_str()))
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Evaluate one filter against a document
    ///
    /// Canonical filters resolve through the document's canonical-field
    /// mapping; a document whose template has no field in that category never
    /// matches.
    fn filter_matches(doc: &SearchDoc, filter: &FieldFilter) -> bool {
        let field_name: &str = if filter.canonical {
            match doc.canonical_fields.get(&filter.field) {
                Some(concrete) => concrete.as_str(),
                None => return false,
            }
        } else {
            filter.field.as_str()
        };

        let value = match doc.fields.get(field_name) {
            Some(value) => value,
            None => return false,
        };

        match &filter.op {
            FilterOp::Gte { value: bound } => {
                parse_number(value).map(|v| v >= *bound).unwrap_or(false)
            }
            FilterOp::Lte { value: bound } => {
                parse_number(value).map(|v| v <= *bound).unwrap_or(false)
            }
            FilterOp::Between { low, high } => parse_number(value)
                .map(|v| v >= *low && v <= *high)
                .unwrap_or(false),
            FilterOp::Equals { value: target } => {
                let lowered = value.to_lowercase();
                let target = target.to_lowercase();
                lowered == target || lowered.contains(&target)
            }
            FilterOp::DateRange { from, to } => parse_date(value)
                .map(|d| {
                    let date = d
                        .and_hms_opt(0, 0, 0)
                        .map(|naive| naive.and_utc())
                        .unwrap_or_else(|| *from);
                    date >= *from && date <= *to
                })
                .unwrap_or(false),
        }
    }
}
