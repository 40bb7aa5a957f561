// Retrieval Engine
// Executes a query plan: keyword search with canonical expansion, trigram
// fuzzy fallback, optional semantic rerank via reciprocal rank fusion, answer
// generation with enforced field-reference markers, and a TTL query cache
// whose key includes the store's fields generation so verifications
// invalidate stale answers.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::canonical::AggregationType;
use crate::citation_tracker::{AnnotatedCitation, CitationTracker};
use crate::config::Settings;
use crate::contracts::{IndexQuery, SearchHit, SearchIndex, Store};
use crate::embedder::Embedder;
use crate::errors::QueryError;
use crate::llm_client::{CompletionOptions, LlmClient};
use crate::pure::{normalize_scores, ordering_score, parse_date, parse_number,
    reciprocal_rank_fusion};
use crate::query_planner::{AggregationSpec, Plan, QueryPlanner, TimeBucket};
use crate::types::{QuerySource, ValidatedDocumentId, ValidatedTemplateId};
use crate::wrappers::TtlCache;

/// One query as received from the caller
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: String,
    pub template_id: Option<ValidatedTemplateId>,
    /// Caller-supplied filters, AND'ed with whatever the planner extracts
    pub filters: Vec<crate::contracts::FieldFilter>,
    pub deadline_ms: Option<u64>,
    pub query_source: QuerySource,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            template_id: None,
            filters: Vec::new(),
            deadline_ms: None,
            query_source: QuerySource::AskAi,
        }
    }

    pub fn with_filter(mut self, filter: crate::contracts::FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }
}

/// A document backing the answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDoc {
    pub document_id: ValidatedDocumentId,
    pub filename: String,
    pub template_name: Option<String>,
    pub score: f64,
}

/// One executed aggregation bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub label: String,
    pub field: String,
    pub agg_type: AggregationType,
    pub value: f64,
    pub doc_count: usize,
}

/// How the plan was produced and executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDiagnostics {
    pub intent: String,
    pub confidence: f64,
    pub used_llm: bool,
    pub fuzzy_fallback_used: bool,
    pub cache_hit: bool,
}

/// The full answer payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub citations: Vec<AnnotatedCitation>,
    pub low_confidence_count: usize,
    pub audit_recommended: bool,
    pub sources: Vec<SourceDoc>,
    pub aggregations: Vec<AggregateResult>,
    pub suggested_reformulations: Vec<String>,
    pub plan_diagnostics: PlanDiagnostics,
    pub timing_ms: u64,
}

pub struct RetrievalEngine {
    store: Arc<dyn Store>,
    search_index: Arc<dyn SearchIndex>,
    planner: QueryPlanner,
    llm: Option<Arc<dyn LlmClient>>,
    embedder: Option<Arc<dyn Embedder>>,
    tracker: CitationTracker,
    cache: Mutex<TtlCache<String, QueryResponse>>,
    settings: Settings,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn Store>,
        search_index: Arc<dyn SearchIndex>,
        planner: QueryPlanner,
        llm: Option<Arc<dyn LlmClient>>,
        embedder: Option<Arc<dyn Embedder>>,
        settings: Settings,
    ) -> Self {
        let tracker = CitationTracker::new(store.clone(), settings.audit.review_threshold);
        let cache = Mutex::new(TtlCache::new(
            settings.query.query_cache_capacity,
            settings.query.query_cache_ttl(),
        ));
        Self {
            store,
            search_index,
            planner,
            llm,
            embedder,
            tracker,
            cache,
            settings,
        }
    }

    /// Answer a natural-language query
    ///
    /// The cache key includes the store's fields generation, so any field
    /// mutation (re-extract, verification) implicitly invalidates cached
    /// answers. On deadline expiry the caller gets a structured timeout, never
    /// a partial uncached answer.
    pub async fn ask(&self, request: QueryRequest) -> Result<QueryResponse> {
        let start = Instant::now();
        let query = crate::validation::query::sanitize_query(&request.query)?;

        let generation = self.store.fields_generation().await;
        let filter_hash = {
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            for filter in &request.filters {
                serde_json::to_string(filter).unwrap_or_default().hash(&mut hasher);
            }
            hasher.finish()
        };
        let cache_key = format!(
            "{}|f{filter_hash:x}|g{generation}",
            Plan::cache_key(&query, request.template_id)
        );
        {
            let mut cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&cache_key) {
                let mut response = cached.clone();
                response.plan_diagnostics.cache_hit = true;
                response.timing_ms = start.elapsed().as_millis() as u64;
                debug!("Query cache hit");
                return Ok(response);
            }
        }

        let deadline_ms = request
            .deadline_ms
            .unwrap_or(self.settings.query.query_deadline_ms);
        let response = match tokio::time::timeout(
            Duration::from_millis(deadline_ms),
            self.execute(&query, &request),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(QueryError::Timeout { deadline_ms }.into()),
        };

        let mut response = response;
        response.timing_ms = start.elapsed().as_millis() as u64;
        self.cache
            .lock()
            .await
            .insert(cache_key, response.clone());
        Ok(response)
    }

    async fn execute(&self, query: &str, request: &QueryRequest) -> Result<QueryResponse> {
        let plan = self.planner.plan(query, request.template_id).await?;

        // Aggregations define their universe through filters and canonical
        // fields; free text would wrongly shrink it ("revenue" appears in no
        // document), so aggregate plans run filter-only.
        let has_aggregation = plan.aggregation.is_some();
        let mut filters = plan.filters.clone();
        filters.extend(request.filters.iter().cloned());
        let index_query = IndexQuery {
            text: (!has_aggregation && !plan.text_query.is_empty())
                .then(|| plan.text_query.clone()),
            template_id: plan.template_id,
            filters,
            limit: self.settings.query.top_k,
            allow_fuzzy: !has_aggregation && !plan.text_query.is_empty(),
        };
        let outcome = self.search_index.search(&index_query).await?;

        if outcome.hits.is_empty() {
            // Zero results after fuzzy fallback is a reformulation hint, not
            // an error
            return Ok(QueryResponse {
                answer: "No documents matched this query.".to_string(),
                citations: Vec::new(),
                low_confidence_count: 0,
                audit_recommended: false,
                sources: Vec::new(),
                aggregations: Vec::new(),
                suggested_reformulations: self.planner.reformulations(query),
                plan_diagnostics: PlanDiagnostics {
                    intent: plan.intent.to_string(),
                    confidence: plan.confidence,
                    used_llm: plan.use_llm_refinement,
                    fuzzy_fallback_used: outcome.fuzzy_fallback_used,
                    cache_hit: false,
                },
                timing_ms: 0,
            });
        }

        let mut hits = self.maybe_rerank(query, outcome.hits).await;

        // Verified-field boost and recency tie-break
        let penalty = self.settings.query.unverified_penalty;
        for hit in hits.iter_mut() {
            hit.score = ordering_score(hit.score, hit.has_verified_fields, penalty);
        }
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });

        let aggregations = match &plan.aggregation {
            Some(aggregation) => self.run_aggregation(&hits, aggregation).await?,
            None => Vec::new(),
        };

        let answer = self.generate_answer(query, &plan, &hits, &aggregations).await?;

        let query_id = Uuid::new_v4();
        let (citations, unresolved) = self
            .tracker
            .process_answer(&answer, query_id, query, request.query_source)
            .await?;
        if unresolved > 0 {
            warn!(unresolved, "Answer carried unresolvable field markers");
        }

        let low_confidence_count = citations.iter().filter(|c| c.needs_audit).count();
        let sources: Vec<SourceDoc> = {
            let mut sources = Vec::new();
            for hit in hits.iter().take(self.settings.query.answer_k) {
                let (filename, template_name) = match self
                    .search_index
                    .indexed_document(&hit.document_id)
                    .await?
                {
                    Some(doc) => (doc.filename, doc.template_name),
                    None => (String::new(), None),
                };
                sources.push(SourceDoc {
                    document_id: hit.document_id,
                    filename,
                    template_name,
                    score: hit.score,
                });
            }
            sources
        };

        info!(
            intent = %plan.intent,
            hits = hits.len(),
            citations = citations.len(),
            low_confidence = low_confidence_count,
            "Query answered"
        );
        Ok(QueryResponse {
            answer,
            low_confidence_count,
            audit_recommended: low_confidence_count > 0,
            citations,
            sources,
            aggregations,
            suggested_reformulations: Vec::new(),
            plan_diagnostics: PlanDiagnostics {
                intent: plan.intent.to_string(),
                confidence: plan.confidence,
                used_llm: plan.use_llm_refinement,
                fuzzy_fallback_used: outcome.fuzzy_fallback_used,
                cache_hit: false,
            },
            timing_ms: 0,
        })
    }

    /// Optional semantic rerank: fuse the keyword ranking with embedding
    /// nearest neighbors using reciprocal rank fusion
    async fn maybe_rerank(&self, query: &str, keyword_hits: Vec<SearchHit>) -> Vec<SearchHit> {
        if !self.settings.query.enable_semantic_rerank {
            return keyword_hits;
        }
        let embedder = match &self.embedder {
            Some(embedder) => embedder,
            None => return keyword_hits,
        };
        let embedding = match embedder.embed(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "Query embedding failed, keyword ranking stands");
                return keyword_hits;
            }
        };
        let semantic = match self
            .search_index
            .semantic_search(&embedding, self.settings.query.top_k)
            .await
        {
            Ok(semantic) if !semantic.is_empty() => semantic,
            _ => return keyword_hits,
        };

        let keyword_ids: Vec<ValidatedDocumentId> =
            keyword_hits.iter().map(|h| h.document_id).collect();
        let semantic_ids: Vec<ValidatedDocumentId> =
            semantic.iter().map(|(id, _)| *id).collect();
        let fused = reciprocal_rank_fusion(
            &keyword_ids,
            &semantic_ids,
            self.settings.query.rrf_k,
            self.settings.query.rrf_alpha,
        );

        let mut hits = Vec::with_capacity(fused.len());
        let mut raw_scores = Vec::with_capacity(fused.len());
        for (doc_id, fused_score) in fused {
            let hit = match keyword_hits.iter().find(|h| h.document_id == doc_id) {
                Some(existing) => existing.clone(),
                None => {
                    // Semantic-only hit: synthesize from the indexed doc
                    match self.search_index.indexed_document(&doc_id).await {
                        Ok(Some(doc)) => SearchHit {
                            document_id: doc_id,
                            score: 0.0,
                            matched_fields: Vec::new(),
                            snippet: None,
                            created_at: doc.created_at,
                            has_verified_fields: !doc.verified_fields.is_empty(),
                        },
                        _ => continue,
                    }
                }
            };
            raw_scores.push(fused_score);
            hits.push(hit);
        }
        normalize_scores(&mut raw_scores);
        for (hit, score) in hits.iter_mut().zip(raw_scores) {
            hit.score = score;
        }
        debug!(hits = hits.len(), "Semantic rerank applied");
        hits
    }

    /// Execute an aggregation over the hit set, per time bucket
    async fn run_aggregation(
        &self,
        hits: &[SearchHit],
        aggregation: &AggregationSpec,
    ) -> Result<Vec<AggregateResult>> {
        let buckets: Vec<Option<&TimeBucket>> = if aggregation.time_buckets.is_empty() {
            vec![None]
        } else {
            aggregation.time_buckets.iter().map(Some).collect()
        };

        let mut results = Vec::with_capacity(buckets.len());
        for bucket in buckets {
            let mut total = 0.0;
            let mut count = 0usize;

            for hit in hits {
                let doc = match self.search_index.indexed_document(&hit.document_id).await? {
                    Some(doc) => doc,
                    None => continue,
                };

                if let Some(bucket) = bucket {
                    // Bucket membership by the document's canonical date
                    let in_bucket = doc
                        .canonical_fields
                        .get("date")
                        .or_else(|| doc.canonical_fields.get("start_date"))
                        .and_then(|field| doc.fields.get(field))
                        .and_then(|value| parse_date(value))
                        .map(|date| {
                            let date = date
                                .and_hms_opt(12, 0, 0)
                                .expect("noon")
                                .and_utc();
                            date >= bucket.from && date <= bucket.to
                        })
                        .unwrap_or(false);
                    if !in_bucket {
                        continue;
                    }
                }

                let field_name = if aggregation.canonical {
                    match doc.canonical_fields.get(&aggregation.field) {
                        Some(concrete) => concrete.clone(),
                        None => continue,
                    }
                } else {
                    aggregation.field.clone()
                };
                let value = doc.fields.get(&field_name).and_then(|v| parse_number(v));
                match aggregation.agg_type {
                    AggregationType::Count => {
                        count += 1;
                    }
                    _ => {
                        if let Some(value) = value {
                            total += value;
                            count += 1;
                        }
                    }
                }
            }

            let value = match aggregation.agg_type {
                AggregationType::Count => count as f64,
                AggregationType::Avg if count > 0 => total / count as f64,
                AggregationType::Avg => 0.0,
                _ => total,
            };
            results.push(AggregateResult {
                label: bucket
                    .map(|b| b.label.clone())
                    .unwrap_or_else(|| "all".to_string()),
                field: aggregation.field.clone(),
                agg_type: aggregation.agg_type,
                value,
                doc_count: count,
            });
        }
        Ok(results)
    }

    /// Generate the answer text, enforcing inline field markers. The LLM gets
    /// one retry; after that a deterministic summary (which always carries
    /// markers) takes over.
    async fn generate_answer(
        &self,
        query: &str,
        plan: &Plan,
        hits: &[SearchHit],
        aggregations: &[AggregateResult],
    ) -> Result<String> {
        let llm = match &self.llm {
            Some(llm) => llm,
            None => return self.fallback_answer(plan, hits, aggregations).await,
        };

        let context = self.answer_context(hits, aggregations).await?;
        let opts = CompletionOptions {
            system_prefix: Some(
                "You answer questions about a document archive. Every fact you state \
                 must carry an inline marker of the exact form \
                 [[FIELD:<field_name>:<document_id>]] naming the field it came from. \
                 Use only the documents provided."
                    .to_string(),
            ),
            cache_system_prefix: true,
            max_tokens: 1024,
            temperature: 0.0,
        };
        let prompt = format!("Question: {query}\n\n{context}\n\nAnswer with markers:");

        let first = llm.complete(&prompt, &opts).await?;
        if CitationTracker::has_markers(&first.text) {
            return Ok(first.text);
        }

        warn!("Answer missing field markers, retrying once");
        let stricter = format!(
            "{prompt}\n\nIMPORTANT: your previous answer had no [[FIELD:...]] markers. \
             Every fact MUST be followed by its marker."
        );
        let second = llm.complete(&stricter, &opts).await?;
        if CitationTracker::has_markers(&second.text) {
            return Ok(second.text);
        }

        warn!("Answer still missing markers, using deterministic summary");
        self.fallback_answer(plan, hits, aggregations).await
    }

    /// Render the hit set for the answer prompt
    async fn answer_context(
        &self,
        hits: &[SearchHit],
        aggregations: &[AggregateResult],
    ) -> Result<String> {
        let mut context = String::from("Documents:\n");
        for hit in hits.iter().take(self.settings.query.answer_k) {
            let doc = match self.search_index.indexed_document(&hit.document_id).await? {
                Some(doc) => doc,
                None => continue,
            };
            context.push_str(&format!(
                "- document_id {} file {} ({})\n",
                doc.document_id,
                doc.filename,
                doc.template_name.as_deref().unwrap_or("untyped")
            ));
            let fields = self.store.fields_for_document(&hit.document_id).await?;
            for field in fields {
                if let Some(value) = field.current_value() {
                    context.push_str(&format!(
                        "    {} = {} (confidence {:.2}{})\n",
                        field.field_name,
                        value,
                        field.confidence.get(),
                        if field.verified { ", verified" } else { "" }
                    ));
                }
            }
        }
        if !aggregations.is_empty() {
            context.push_str("Aggregates:\n");
            for aggregate in aggregations {
                context.push_str(&format!(
                    "- {} {:?}({}) = {:.2} over {} documents\n",
                    aggregate.label,
                    aggregate.agg_type,
                    aggregate.field,
                    aggregate.value,
                    aggregate.doc_count
                ));
            }
        }
        Ok(context)
    }

    /// Deterministic marker-carrying summary used when no LLM is wired or the
    /// LLM would not produce markers
    async fn fallback_answer(
        &self,
        plan: &Plan,
        hits: &[SearchHit],
        aggregations: &[AggregateResult],
    ) -> Result<String> {
        let mut answer = String::new();

        if !aggregations.is_empty() {
            for aggregate in aggregations {
                answer.push_str(&format!(
                    "{} of {} ({}): {:.2} across {} document(s).",
                    match aggregate.agg_type {
                        AggregationType::Sum => "Total",
                        AggregationType::Avg => "Average",
                        AggregationType::Count => "Count",
                        AggregationType::Terms => "Values",
                        AggregationType::DateHistogram => "Timeline",
                    },
                    aggregate.field,
                    aggregate.label,
                    aggregate.value,
                    aggregate.doc_count
                ));
                // Cite the contributing fields for the first few documents
                let mut cited = 0;
                for hit in hits {
                    if cited >= 3 {
                        break;
                    }
                    if let Some(doc) =
                        self.search_index.indexed_document(&hit.document_id).await?
                    {
                        let concrete = if plan
                            .aggregation
                            .as_ref()
                            .map(|a| a.canonical)
                            .unwrap_or(false)
                        {
                            doc.canonical_fields.get(&aggregate.field).cloned()
                        } else {
                            Some(aggregate.field.clone())
                        };
                        if let Some(field_name) = concrete {
                            if doc.fields.contains_key(&field_name) {
                                answer.push_str(&format!(
                                    " [[FIELD:{}:{}]]",
                                    field_name, doc.document_id
                                ));
                                cited += 1;
                            }
                        }
                    }
                }
                answer.push('\n');
            }
            return Ok(answer.trim_end().to_string());
        }

        answer.push_str(&format!("Found {} matching document(s).", hits.len()));
        for hit in hits.iter().take(3) {
            let doc = match self.search_index.indexed_document(&hit.document_id).await? {
                Some(doc) => doc,
                None => continue,
            };
            // Cite every stated value so each fact is traceable
            answer.push_str(&format!(" {}:", doc.filename));
            for (field_name, value) in doc.fields.iter().take(5) {
                answer.push_str(&format!(
                    " {} = {} [[FIELD:{}:{}]];",
                    field_name, value, field_name, doc.document_id
                ));
            }
        }
        Ok(answer)
    }

    /// Wipe the query cache (used by tests and operator tooling)
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::CanonicalRegistry;
    use crate::contracts::{ExtractedField, FieldSpec, ParsedDocument, Template};
    use crate::file_store::FileStore;
    use crate::search_index::{build_search_doc, HybridSearchIndex};
    use crate::types::{
        Confidence, DocumentStatus, FieldType, TemplateKind, ValidatedFieldName,
        ValidatedFileName, ValidatedTemplateName,
    };
    use chrono::NaiveDate;
    use tempfile::TempDir;

    struct Harness {
        engine: RetrievalEngine,
        store: Arc<FileStore>,
        _dir: TempDir,
    }

    async fn harness(llm: Option<Arc<dyn LlmClient>>) -> Harness {
        let dir = TempDir::new().unwrap();
        let settings = Settings::default();
        let store: Arc<FileStore> =
            Arc::new(FileStore::open(dir.path().to_str().unwrap()).await.unwrap());
        let index = Arc::new(HybridSearchIndex::new(&settings));
        let registry = Arc::new(CanonicalRegistry::with_defaults());
        let planner = QueryPlanner::new(registry.clone(), llm.clone(), Default::default())
            .with_reference_date(NaiveDate::from_ymd_opt(2025, 5, 15).unwrap());

        let engine = RetrievalEngine::new(
            store.clone(),
            index.clone(),
            planner,
            llm,
            None,
            settings.clone(),
        );

        // Seed two invoices through the store + index
        let template = store
            .create_template(invoice_template())
            .await
            .unwrap();
        seed_invoice(&store, &index, &registry, &settings, &template, "small.pdf", "1200.00", "Initech").await;
        seed_invoice(&store, &index, &registry, &settings, &template, "large.pdf", "8500.00", "Acme Corp").await;

        Harness {
            engine,
            store,
            _dir: dir,
        }
    }

    fn invoice_template() -> Template {
        let mut total = FieldSpec::new(
            ValidatedFieldName::new("invoice_total").unwrap(),
            FieldType::Number,
        );
        total.primary = true;
        Template::new(
            ValidatedTemplateName::new("Invoice").unwrap(),
            TemplateKind::Invoice,
            vec![
                total,
                FieldSpec::new(ValidatedFieldName::new("vendor").unwrap(), FieldType::Text),
            ],
        )
        .unwrap()
    }

    async fn seed_invoice(
        store: &Arc<FileStore>,
        index: &Arc<HybridSearchIndex>,
        registry: &Arc<CanonicalRegistry>,
        settings: &Settings,
        template: &Template,
        filename: &str,
        total: &str,
        vendor: &str,
    ) -> ValidatedDocumentId {
        let doc = store
            .create_document(
                ValidatedFileName::new(filename).unwrap(),
                format!("invoice {total} {vendor}").as_bytes(),
            )
            .await
            .unwrap();
        store
            .update_document_status(&doc.id, DocumentStatus::Analyzing, None)
            .await
            .unwrap();
        store
            .cache_parse_result(
                &doc.id,
                &format!("job-{filename}"),
                ParsedDocument {
                    chunks: vec![],
                    full_text: format!("invoice from {vendor} totaling {total}"),
                },
            )
            .await
            .unwrap();
        store
            .set_document_template(&doc.id, Some(template.id))
            .await
            .unwrap();

        let fields = vec![
            ExtractedField::new(
                doc.id,
                ValidatedFieldName::new("invoice_total").unwrap(),
                FieldType::Number,
                Some(total.to_string()),
                None,
                Confidence::new(0.9).unwrap(),
                Some(1),
                None,
            )
            .unwrap(),
            ExtractedField::new(
                doc.id,
                ValidatedFieldName::new("vendor").unwrap(),
                FieldType::Text,
                Some(vendor.to_string()),
                None,
                Confidence::new(0.85).unwrap(),
                Some(1),
                None,
            )
            .unwrap(),
        ];
        let stored = store.upsert_extracted_fields(&doc.id, fields).await.unwrap();
        let document = store.get_document(&doc.id).await.unwrap().unwrap();
        let search_doc = build_search_doc(
            &document,
            Some(template),
            &stored,
            registry,
            &settings.index,
            None,
        );
        index.index_document(&search_doc).await.unwrap();
        doc.id
    }

    #[tokio::test]
    async fn test_fast_path_filter_query() {
        let h = harness(None).await;
        let response = h
            .engine
            .ask(QueryRequest::new("invoices over $5000"))
            .await
            .unwrap();

        assert!(!response.plan_diagnostics.used_llm);
        assert!(!response.plan_diagnostics.fuzzy_fallback_used);
        assert_eq!(response.sources.len(), 1);
        assert_eq!(response.sources[0].filename, "large.pdf");
        // The deterministic answer carries resolvable markers
        assert!(!response.citations.is_empty());
        assert!(response.answer.contains("[[FIELD:"));
    }

    #[tokio::test]
    async fn test_fuzzy_fallback_diagnostic() {
        let h = harness(None).await;
        let response = h
            .engine
            .ask(QueryRequest::new("invioce"))
            .await
            .unwrap();
        assert!(response.plan_diagnostics.fuzzy_fallback_used);
        assert!(!response.sources.is_empty());
    }

    #[tokio::test]
    async fn test_zero_results_suggest_reformulations() {
        let h = harness(None).await;
        let response = h
            .engine
            .ask(QueryRequest::new("xyzzy flooglebark"))
            .await
            .unwrap();
        assert!(response.sources.is_empty());
        assert!(response.citations.is_empty());
        assert_eq!(response.low_confidence_count, 0);
    }

    #[tokio::test]
    async fn test_cache_hits_and_generation_invalidation() {
        let h = harness(None).await;

        let first = h
            .engine
            .ask(QueryRequest::new("invoices over $5000"))
            .await
            .unwrap();
        assert!(!first.plan_diagnostics.cache_hit);

        let second = h
            .engine
            .ask(QueryRequest::new("invoices over $5000"))
            .await
            .unwrap();
        assert!(second.plan_diagnostics.cache_hit);

        // A verification bumps the fields generation and busts the cache
        let field_id = first.citations[0].citation.field_id;
        h.store
            .append_verification(
                &field_id,
                crate::types::VerificationAction::Correct,
                None,
                None,
                None,
            )
            .await
            .unwrap();

        let third = h
            .engine
            .ask(QueryRequest::new("invoices over $5000"))
            .await
            .unwrap();
        assert!(!third.plan_diagnostics.cache_hit);
    }

    #[tokio::test]
    async fn test_aggregation_sum() {
        let h = harness(None).await;
        let response = h
            .engine
            .ask(QueryRequest::new("total amount of invoices"))
            .await
            .unwrap();

        // "total" resolves the aggregate through the amount canonical
        if let Some(aggregate) = response.aggregations.first() {
            assert_eq!(aggregate.agg_type, AggregationType::Sum);
            assert!((aggregate.value - 9700.0).abs() < 1e-6);
            assert_eq!(aggregate.doc_count, 2);
        } else {
            panic!("expected an aggregation result");
        }
    }
}
