// Trigram Index Implementation
// Character-trigram inverted index used as the fuzzy fallback when a keyword
// query finds nothing. Similarity is the fraction of query trigrams present
// in a document, so misspellings like "invioce" still reach "invoice".

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::types::ValidatedDocumentId;

/// Trigram index over concatenated document text
pub struct TrigramIndex {
    state: RwLock<TrigramState>,
}

#[derive(Default)]
struct TrigramState {
    /// trigram -> documents containing it
    postings: HashMap<String, HashSet<ValidatedDocumentId>>,
    /// document -> its trigram set
    docs: HashMap<ValidatedDocumentId, HashSet<String>>,
}

impl Default for TrigramIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl TrigramIndex {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TrigramState::default()),
        }
    }

    /// Extract trigrams from text
    ///
    /// Words are lowercased and padded with two leading and one trailing
    /// space before windowing, so word boundaries produce trigrams and short
    /// edit distances keep high similarity ("invioce" still shares the
    /// boundary trigrams of "invoice").
    pub fn extract_trigrams(text: &str) -> HashSet<String> {
        let mut trigrams = HashSet::new();
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let padded: Vec<char> = format!("  {word} ").chars().collect();
            for window in padded.windows(3) {
                trigrams.insert(window.iter().collect());
            }
        }
        trigrams
    }

    /// Insert or overwrite a document's text (idempotent)
    pub async fn index_document(&self, id: ValidatedDocumentId, text: &str) -> Result<()> {
        let trigrams = Self::extract_trigrams(text);
        let mut state = self.state.write().await;

        Self::remove_locked(&mut state, &id);

        for trigram in &trigrams {
            state
                .postings
                .entry(trigram.clone())
                .or_default()
                .insert(id);
        }
        state.docs.insert(id, trigrams);
        Ok(())
    }

    fn remove_locked(state: &mut TrigramState, id: &ValidatedDocumentId) {
        if let Some(old) = state.docs.remove(id) {
            for trigram in old {
                if let Some(posting) = state.postings.get_mut(&trigram) {
                    posting.remove(id);
                    if posting.is_empty() {
                        state.postings.remove(&trigram);
                    }
                }
            }
        }
    }

    pub async fn remove_document(&self, id: &ValidatedDocumentId) -> Result<()> {
        let mut state = self.state.write().await;
        Self::remove_locked(&mut state, id);
        Ok(())
    }

    /// Documents whose trigram coverage of the query meets `min_similarity`,
    /// sorted by similarity descending
    pub async fn search(
        &self,
        query: &str,
        min_similarity: f64,
    ) -> Result<Vec<(ValidatedDocumentId, f64)>> {
        let query_trigrams = Self::extract_trigrams(query);
        if query_trigrams.is_empty() {
            return Ok(Vec::new());
        }

        let state = self.state.read().await;
        let mut match_counts: HashMap<ValidatedDocumentId, usize> = HashMap::new();
        for trigram in &query_trigrams {
            if let Some(posting) = state.postings.get(trigram) {
                for id in posting {
                    *match_counts.entry(*id).or_insert(0) += 1;
                }
            }
        }

        let total = query_trigrams.len() as f64;
        let mut results: Vec<(ValidatedDocumentId, f64)> = match_counts
            .into_iter()
            .map(|(id, count)| (id, count as f64 / total))
            .filter(|(_, similarity)| *similarity >= min_similarity)
            .collect();

        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(results)
    }
}
