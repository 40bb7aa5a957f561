// Hybrid Search Index
// Facade composing the keyword, trigram, signature, and vector indices behind
// the SearchIndex contract. Also owns the deterministic SearchDoc builder:
// identical store state always produces an identical SearchDoc, which is what
// makes index writes idempotent and safely retryable.

use anyhow::{Context, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::{debug, info};

use crate::canonical::CanonicalRegistry;
use crate::config::{IndexSettings, Settings};
use crate::contracts::{
    Document, ExtractedField, IndexQuery, SearchDoc, SearchHit, SearchIndex, SearchOutcome, Store,
    Template, TemplateSignature, TemplateSimilarity,
};
use crate::keyword_index::KeywordIndex;
use crate::signature_index::SignatureIndex;
use crate::trigram_index::TrigramIndex;
use crate::types::{DocumentStatus, ValidatedDocumentId};
use crate::vector_index::VectorIndex;

/// Build the index representation of a document from authoritative state
///
/// Field values above the keyword-length cap stay in `fields` (stored) but are
/// excluded from every band, so they are retrievable yet never keyword-match.
/// Canonical names are resolved against the document's template here, at index
/// time, so query-time expansion is a map lookup per document.
pub fn build_search_doc(
    document: &Document,
    template: Option<&Template>,
    fields: &[ExtractedField],
    registry: &CanonicalRegistry,
    settings: &IndexSettings,
    embedding: Option<Vec<f32>>,
) -> SearchDoc {
    let template_field_names: Vec<String> = template
        .map(|t| t.field_names())
        .unwrap_or_else(|| fields.iter().map(|f| f.field_name.as_str().to_string()).collect());
    let primary_names: Vec<String> = template
        .map(|t| t.primary_field_names())
        .unwrap_or_default();

    // Canonical name -> concrete field, resolved under this template only
    let mut canonical_fields = IndexMap::new();
    if let Some(template) = template {
        for canonical in registry.canonical_names() {
            if let Some(concrete) = registry.resolve_for_template(
                &canonical,
                template.name.as_str(),
                &template_field_names,
            ) {
                if fields.iter().any(|f| f.field_name.as_str() == concrete) {
                    canonical_fields.insert(canonical, concrete);
                }
            }
        }
    }
    let identifier_fields: Vec<&str> = canonical_fields
        .iter()
        .filter(|(canonical, _)| canonical.as_str() == "identifier")
        .map(|(_, concrete)| concrete.as_str())
        .collect();

    let mut field_map = IndexMap::new();
    let mut identifier_text = document.filename.as_str().to_string();
    let mut primary_text = String::new();
    let mut body_text = String::new();
    let mut verified_fields = Vec::new();

    for field in fields {
        let value = match field.current_value() {
            Some(value) => value,
            None => continue,
        };
        field_map.insert(field.field_name.as_str().to_string(), value.clone());
        if field.verified {
            verified_fields.push(field.field_name.as_str().to_string());
        }

        // Over-cap values are stored but not keyword-indexed
        if value.len() > settings.max_keyword_length {
            continue;
        }

        let name = field.field_name.as_str();
        if identifier_fields.contains(&name) {
            identifier_text.push(' ');
            identifier_text.push_str(&value);
        } else if primary_names.iter().any(|p| p == name) {
            primary_text.push(' ');
            primary_text.push_str(&value);
        } else {
            body_text.push(' ');
            body_text.push_str(&value);
        }
    }

    let full_text = document
        .cached_parse
        .as_ref()
        .map(|p| p.full_text.clone())
        .unwrap_or_default();
    body_text.push(' ');
    body_text.push_str(&full_text);

    SearchDoc {
        document_id: document.id,
        filename: document.filename.as_str().to_string(),
        template_id: document.template_id,
        template_name: template.map(|t| t.name.as_str().to_string()),
        full_text,
        fields: field_map,
        identifier_text,
        primary_text,
        body_text,
        canonical_fields,
        verified_fields,
        embedding,
        created_at: document.created_at,
    }
}

/// The hybrid index behind the SearchIndex contract
pub struct HybridSearchIndex {
    keyword: KeywordIndex,
    trigram: TrigramIndex,
    signature: SignatureIndex,
    vector: VectorIndex,
    fuzzy_similarity_threshold: f64,
}

impl HybridSearchIndex {
    pub fn new(settings: &Settings) -> Self {
        Self {
            keyword: KeywordIndex::new(settings.index.clone()),
            trigram: TrigramIndex::new(),
            signature: SignatureIndex::new(),
            vector: VectorIndex::new(settings.embedder.dimension),
            fuzzy_similarity_threshold: settings.query.fuzzy_similarity_threshold,
        }
    }

    /// The stored search representation, if the document is indexed
    pub async fn get_doc(&self, id: &ValidatedDocumentId) -> Option<SearchDoc> {
        self.keyword.get_doc(id).await
    }

    pub async fn doc_count(&self) -> usize {
        self.keyword.doc_count().await
    }

    pub async fn semantic_doc_count(&self) -> usize {
        self.vector.len().await
    }

    /// Reconcile the projection from authoritative state: re-index every
    /// completed document and every template signature
    pub async fn rebuild_from_store(
        &self,
        store: &dyn Store,
        registry: &CanonicalRegistry,
        settings: &IndexSettings,
    ) -> Result<usize> {
        for template in store.list_templates().await? {
            self.index_template_signature(&template.signature()).await?;
        }

        let mut indexed = 0;
        for document in store
            .list_documents(Some(DocumentStatus::Completed))
            .await?
        {
            let template = match document.template_id {
                Some(tid) => store.get_template(&tid).await?,
                None => None,
            };
            let fields = store.fields_for_document(&document.id).await?;
            let doc = build_search_doc(
                &document,
                template.as_ref(),
                &fields,
                registry,
                settings,
                None,
            );
            self.index_document(&doc).await?;
            indexed += 1;
        }
        info!(indexed, "Search index rebuilt from store");
        Ok(indexed)
    }

    /// Built from the weighted bands, which already exclude over-cap values,
    /// so the trigram fallback honors the same keyword caps
    fn fuzzy_text(doc: &SearchDoc) -> String {
        format!(
            "{} {} {}",
            doc.identifier_text, doc.primary_text, doc.body_text
        )
    }
}

#[async_trait]
impl SearchIndex for HybridSearchIndex {
    async fn index_document(&self, doc: &SearchDoc) -> Result<()> {
        // Keyword index goes first: it enforces the dynamic-field cap, and a
        // refusal must leave every sub-index untouched.
        self.keyword
            .index_document(doc)
            .await
            .context("Keyword index write failed")?;
        self.trigram
            .index_document(doc.document_id, &Self::fuzzy_text(doc))
            .await?;
        if let Some(embedding) = &doc.embedding {
            self.vector
                .insert_vector(doc.document_id, embedding.clone())
                .await?;
        }
        Ok(())
    }

    async fn remove_document(&self, id: &ValidatedDocumentId) -> Result<()> {
        self.keyword.remove_document(id).await?;
        self.trigram.remove_document(id).await?;
        self.vector.remove_vector(id).await?;
        Ok(())
    }

    async fn indexed_document(&self, id: &ValidatedDocumentId) -> Result<Option<SearchDoc>> {
        Ok(self.keyword.get_doc(id).await)
    }

    async fn index_template_signature(&self, signature: &TemplateSignature) -> Result<()> {
        self.signature.index_signature(signature).await
    }

    async fn search(&self, query: &IndexQuery) -> Result<SearchOutcome> {
        let hits = self.keyword.search(query).await?;

        if !hits.is_empty() || !query.allow_fuzzy {
            let total = hits.len();
            return Ok(SearchOutcome {
                hits,
                fuzzy_fallback_used: false,
                total_candidates: total,
            });
        }

        // Zero keyword hits: retry with trigram similarity over the
        // concatenated text, sorted by similarity.
        let text = match &query.text {
            Some(text) if !text.trim().is_empty() => text,
            _ => {
                return Ok(SearchOutcome {
                    hits,
                    fuzzy_fallback_used: false,
                    total_candidates: 0,
                })
            }
        };

        let fuzzy = self
            .trigram
            .search(text, self.fuzzy_similarity_threshold)
            .await?;
        debug!(candidates = fuzzy.len(), "Fuzzy fallback engaged");

        // Fuzzy hits still honor the query's filters: one filter-only pass
        // yields the allowed document set
        let allowed: Option<std::collections::HashSet<ValidatedDocumentId>> =
            if query.filters.is_empty() && query.template_id.is_none() {
                None
            } else {
                let probe = IndexQuery {
                    text: None,
                    template_id: query.template_id,
                    filters: query.filters.clone(),
                    limit: usize::MAX,
                    allow_fuzzy: false,
                };
                Some(
                    self.keyword
                        .search(&probe)
                        .await?
                        .into_iter()
                        .map(|h| h.document_id)
                        .collect(),
                )
            };

        let mut fuzzy_hits = Vec::new();
        for (doc_id, similarity) in fuzzy {
            if let Some(allowed) = &allowed {
                if !allowed.contains(&doc_id) {
                    continue;
                }
            }
            let doc = match self.keyword.get_doc(&doc_id).await {
                Some(doc) => doc,
                None => continue,
            };
            fuzzy_hits.push(SearchHit {
                document_id: doc_id,
                score: similarity.clamp(0.0, 1.0),
                matched_fields: Vec::new(),
                snippet: None,
                created_at: doc.created_at,
                has_verified_fields: !doc.verified_fields.is_empty(),
            });
        }
        fuzzy_hits.truncate(query.limit);

        let total = fuzzy_hits.len();
        Ok(SearchOutcome {
            hits: fuzzy_hits,
            fuzzy_fallback_used: true,
            total_candidates: total,
        })
    }

    async fn find_similar_templates(
        &self,
        field_names: &[String],
        sample_text: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<TemplateSimilarity>> {
        self.signature.find_similar(field_names, sample_text, top_k).await
    }

    async fn semantic_search(
        &self,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<(ValidatedDocumentId, f64)>> {
        self.vector.search_knn(embedding, k).await
    }

    async fn flush(&self) -> Result<()> {
        // The index is an in-memory projection rebuilt from the store; there
        // is nothing durable to flush.
        Ok(())
    }
}
