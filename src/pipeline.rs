// Ingestion Pipeline
// Orchestrates parse -> match -> extract -> index per file. Batches fan out
// across a bounded worker pool; each file is independent and one failure
// never aborts the rest. Every external call runs under a deadline, and a
// deadline failure preserves any cached parse so a retry skips re-parsing.

use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Settings;
use crate::contracts::{Document, SearchIndex, Store, Template};
use crate::errors::{IngestError, IngestFailureCode};
use crate::extractor::Extractor;
use crate::parser_client::Parser;
use crate::template_matcher::{MatchOutcome, MatchSource, TemplateMatcher};
use crate::types::{DocumentStatus, ValidatedDocumentId, ValidatedFileName, ValidatedTemplateId};
use crate::wrappers::with_backoff;

/// One file in an ingestion batch
#[derive(Debug, Clone)]
pub struct BatchFile {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub requested_template_id: Option<ValidatedTemplateId>,
}

/// A file that made it through (possibly suspended awaiting a user decision)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSuccess {
    pub document_id: ValidatedDocumentId,
    pub filename: String,
    pub status: DocumentStatus,
}

/// A file that failed, with the stage-specific code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFailure {
    pub filename: String,
    pub error_code: IngestFailureCode,
    pub message: String,
}

/// Matching analytics and cost estimate for one batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchAnalytics {
    /// Documents matched on the fast signature path
    #[serde(rename = "elasticsearch_matches")]
    pub signature_matches: u64,
    /// Documents that needed the LLM classifier
    pub llm_matches: u64,
    /// Rough LLM spend for the batch, in cents
    pub cost_estimate: f64,
}

/// Structured result of one batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub succeeded: Vec<BatchSuccess>,
    pub failed: Vec<BatchFailure>,
    pub analytics: BatchAnalytics,
}

pub struct IngestionPipeline {
    store: Arc<dyn Store>,
    search_index: Arc<dyn SearchIndex>,
    parser: Arc<dyn Parser>,
    matcher: TemplateMatcher,
    extractor: Extractor,
    settings: Settings,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        search_index: Arc<dyn SearchIndex>,
        parser: Arc<dyn Parser>,
        matcher: TemplateMatcher,
        extractor: Extractor,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            search_index,
            parser,
            matcher,
            extractor,
            settings,
        }
    }

    /// Ingest a batch of files with bounded parallelism
    ///
    /// Files are processed independently: the result partitions them into
    /// succeeded (including documents suspended awaiting a template decision)
    /// and failed, and the batch never aborts early.
    pub async fn ingest_batch(&self, files: Vec<BatchFile>) -> BatchResult {
        let signature_matches = AtomicU64::new(0);
        let llm_matches = AtomicU64::new(0);

        let outcomes: Vec<std::result::Result<BatchSuccess, BatchFailure>> =
            stream::iter(files.into_iter().map(|file| {
                let signature_matches = &signature_matches;
                let llm_matches = &llm_matches;
                async move {
                    let filename = file.filename.clone();
                    match self
                        .process_file(file, signature_matches, llm_matches)
                        .await
                    {
                        Ok(success) => Ok(success),
                        Err((document_id, error)) => {
                            // Best effort: leave the error on the document row
                            if let Some(id) = document_id {
                                let _ = self
                                    .store
                                    .update_document_status(
                                        &id,
                                        DocumentStatus::Error,
                                        Some(error.to_string()),
                                    )
                                    .await;
                            }
                            warn!(filename = %filename, error = %error, "File failed ingestion");
                            Err(BatchFailure {
                                filename,
                                error_code: error.code(),
                                message: error.to_string(),
                            })
                        }
                    }
                }
            }))
            .buffer_unordered(self.settings.pipeline.worker_pool_size.max(1))
            .collect()
            .await;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(success) => succeeded.push(success),
                Err(failure) => failed.push(failure),
            }
        }

        let llm_count = llm_matches.load(Ordering::Relaxed);
        let analytics = BatchAnalytics {
            signature_matches: signature_matches.load(Ordering::Relaxed),
            llm_matches: llm_count,
            cost_estimate: llm_count as f64 * self.settings.pipeline.llm_cost_estimate_cents,
        };

        info!(
            succeeded = succeeded.len(),
            failed = failed.len(),
            fast_matches = analytics.signature_matches,
            llm_matches = analytics.llm_matches,
            "Batch ingestion finished"
        );
        BatchResult {
            succeeded,
            failed,
            analytics,
        }
    }

    /// Drive one file through the state machine end to end
    async fn process_file(
        &self,
        file: BatchFile,
        signature_matches: &AtomicU64,
        llm_matches: &AtomicU64,
    ) -> std::result::Result<BatchSuccess, (Option<ValidatedDocumentId>, IngestError)> {
        let filename = ValidatedFileName::new(file.filename.clone())
            .map_err(|e| (None, IngestError::ParseFailed(e.to_string())))?;

        let document = self
            .store
            .create_document(filename, &file.bytes)
            .await
            .map_err(|e| (None, IngestError::ParseFailed(e.to_string())))?;
        let doc_id = document.id;
        let fail = |error: IngestError| (Some(doc_id), error);

        // uploaded -> analyzing
        self.transition(&doc_id, DocumentStatus::Analyzing)
            .await
            .map_err(&fail)?;

        // Parse once with bytes, under the parse deadline
        let parsed = self.parse_with_deadline(&doc_id, &file.bytes).await.map_err(&fail)?;

        // Template decision
        let template = match file.requested_template_id {
            Some(template_id) => {
                let template = self
                    .store
                    .get_template(&template_id)
                    .await
                    .ok()
                    .flatten()
                    .ok_or_else(|| {
                        fail(IngestError::NoTemplate(format!(
                            "requested template {template_id} does not exist"
                        )))
                    })?;
                self.assign_template(&doc_id, &template).await.map_err(&fail)?;
                template
            }
            None => {
                let outcome = self
                    .matcher
                    .match_document(&parsed)
                    .await
                    .map_err(|e| fail(IngestError::NoTemplate(e.to_string())))?;
                match self
                    .apply_match_outcome(&doc_id, outcome, signature_matches, llm_matches)
                    .await
                    .map_err(&fail)?
                {
                    Some(template) => template,
                    None => {
                        // Suspended: the document waits for a user decision
                        let document =
                            self.store.get_document(&doc_id).await.ok().flatten();
                        let status = document
                            .map(|d| d.status)
                            .unwrap_or(DocumentStatus::TemplateNeeded);
                        return Ok(BatchSuccess {
                            document_id: doc_id,
                            filename: file.filename,
                            status,
                        });
                    }
                }
            }
        };

        self.run_extraction(&doc_id, &template)
            .await
            .map_err(&fail)?;

        Ok(BatchSuccess {
            document_id: doc_id,
            filename: file.filename,
            status: DocumentStatus::Completed,
        })
    }

    async fn parse_with_deadline(
        &self,
        doc_id: &ValidatedDocumentId,
        bytes: &[u8],
    ) -> std::result::Result<crate::contracts::ParsedDocument, IngestError> {
        let parser = self.parser.clone();
        let parse_call = with_backoff(
            "parser",
            3,
            std::time::Duration::from_millis(500),
            std::time::Duration::from_secs(8),
            move || {
                let parser = parser.clone();
                let bytes = bytes.to_vec();
                async move { parser.parse(&bytes).await }
            },
        );

        let (job_id, parsed) =
            match tokio::time::timeout(self.settings.pipeline.parse_deadline(), parse_call).await
            {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => return Err(IngestError::ParseFailed(e.to_string())),
                Err(_) => return Err(IngestError::Cancelled { stage: "parse" }),
            };

        self.store
            .cache_parse_result(doc_id, &job_id, parsed.clone())
            .await
            .map_err(|e| IngestError::ParseFailed(format!("failed to cache parse: {e}")))?;
        Ok(parsed)
    }

    /// Map a matcher outcome onto the state machine. Returns the template to
    /// proceed with, or None when the document suspends for a user decision.
    async fn apply_match_outcome(
        &self,
        doc_id: &ValidatedDocumentId,
        outcome: MatchOutcome,
        signature_matches: &AtomicU64,
        llm_matches: &AtomicU64,
    ) -> std::result::Result<Option<Template>, IngestError> {
        match outcome.source {
            MatchSource::FastMatch => {
                signature_matches.fetch_add(1, Ordering::Relaxed);
            }
            MatchSource::LlmFallback => {
                llm_matches.fetch_add(1, Ordering::Relaxed);
            }
            MatchSource::NeedsNewTemplate => {}
        }

        match (outcome.source, outcome.template_id) {
            (MatchSource::FastMatch, Some(template_id)) => {
                let template = self.require_template(&template_id).await?;
                self.assign_template(doc_id, &template).await?;
                Ok(Some(template))
            }
            (MatchSource::LlmFallback, Some(template_id)) => {
                let template = self.require_template(&template_id).await?;
                if outcome.confidence.get() >= self.settings.matcher.fast_match_threshold {
                    self.assign_template(doc_id, &template).await?;
                    Ok(Some(template))
                } else {
                    // Suggested: record the candidate but wait for the user
                    self.store
                        .set_document_template(doc_id, Some(template.id))
                        .await
                        .map_err(|e| IngestError::NoTemplate(e.to_string()))?;
                    self.transition(doc_id, DocumentStatus::TemplateSuggested)
                        .await?;
                    Ok(None)
                }
            }
            _ => {
                self.transition(doc_id, DocumentStatus::TemplateNeeded)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn require_template(
        &self,
        template_id: &ValidatedTemplateId,
    ) -> std::result::Result<Template, IngestError> {
        self.store
            .get_template(template_id)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| {
                IngestError::NoTemplate(format!("matched template {template_id} does not exist"))
            })
    }

    async fn assign_template(
        &self,
        doc_id: &ValidatedDocumentId,
        template: &Template,
    ) -> std::result::Result<(), IngestError> {
        self.store
            .set_document_template(doc_id, Some(template.id))
            .await
            .map_err(|e| IngestError::NoTemplate(e.to_string()))?;
        self.transition(doc_id, DocumentStatus::TemplateMatched)
            .await?;
        // Keep the stored file organized under its template folder
        if let Err(e) = self
            .store
            .relocate_document_file(doc_id, template.name.as_str())
            .await
        {
            warn!(doc_id = %doc_id, error = %e, "Template folder reorganization failed");
        }
        Ok(())
    }

    async fn run_extraction(
        &self,
        doc_id: &ValidatedDocumentId,
        _template: &Template,
    ) -> std::result::Result<(), IngestError> {
        self.transition(doc_id, DocumentStatus::Processing).await?;

        let extract_call = self.extractor.extract_document(doc_id);
        match tokio::time::timeout(self.settings.pipeline.extract_deadline(), extract_call).await
        {
            Ok(Ok(_fields)) => {}
            Ok(Err(e)) => {
                return Err(match e.downcast::<IngestError>() {
                    Ok(ingest) => ingest,
                    Err(other) => IngestError::ExtractFailed(other.to_string()),
                })
            }
            Err(_) => return Err(IngestError::Cancelled { stage: "extract" }),
        }

        self.transition(doc_id, DocumentStatus::Completed).await?;
        Ok(())
    }

    async fn transition(
        &self,
        doc_id: &ValidatedDocumentId,
        status: DocumentStatus,
    ) -> std::result::Result<(), IngestError> {
        self.store
            .update_document_status(doc_id, status, None)
            .await
            .map(|_| ())
            .map_err(|e| IngestError::ExtractFailed(format!("status transition failed: {e}")))
    }

    /// User decision for a suspended document: pick (or confirm) a template
    /// and resume processing
    pub async fn resume_with_template(
        &self,
        doc_id: &ValidatedDocumentId,
        template_id: &ValidatedTemplateId,
    ) -> Result<Document> {
        let template = self
            .store
            .get_template(template_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Template not found: {template_id}"))?;
        let document = self
            .store
            .get_document(doc_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Document not found: {doc_id}"))?;
        anyhow::ensure!(
            document.parse_job_id.is_some(),
            "Document {} has no cached parse to resume from",
            doc_id
        );

        self.store
            .set_document_template(doc_id, Some(*template_id))
            .await?;
        // Suspended documents pass through template_matched; an errored
        // document retries straight into processing
        if document.status.awaits_user_decision() {
            self.store
                .update_document_status(doc_id, DocumentStatus::TemplateMatched, None)
                .await?;
        }
        if let Err(e) = self
            .store
            .relocate_document_file(doc_id, template.name.as_str())
            .await
        {
            warn!(doc_id = %doc_id, error = %e, "Template folder reorganization failed");
        }

        match self.run_extraction(doc_id, &template).await {
            Ok(()) => {}
            Err(error) => {
                self.store
                    .update_document_status(
                        doc_id,
                        DocumentStatus::Error,
                        Some(error.to_string()),
                    )
                    .await?;
                return Err(error.into());
            }
        }
        self.store
            .get_document(doc_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Document disappeared: {doc_id}"))
    }

    /// Operator-initiated re-extract using the cached parse; never re-parses
    pub async fn reprocess_document(&self, doc_id: &ValidatedDocumentId) -> Result<Document> {
        let document = self
            .store
            .get_document(doc_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Document not found: {doc_id}"))?;
        anyhow::ensure!(
            document.parse_job_id.is_some(),
            "Document {} has no cached parse; re-upload it instead",
            doc_id
        );
        let template_id = document
            .template_id
            .ok_or_else(|| anyhow::anyhow!("Document {} has no template", doc_id))?;
        let template = self
            .store
            .get_template(&template_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Template not found: {template_id}"))?;

        match self.run_extraction(doc_id, &template).await {
            Ok(()) => {}
            Err(error) => {
                self.store
                    .update_document_status(
                        doc_id,
                        DocumentStatus::Error,
                        Some(error.to_string()),
                    )
                    .await?;
                return Err(error.into());
            }
        }
        self.store
            .get_document(doc_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Document disappeared: {doc_id}"))
    }

    /// Apply a template edit: bump the signature version in the store and
    /// re-index the fingerprint in a background worker
    pub async fn update_template(&self, template: Template) -> Result<Template> {
        let updated = self.store.update_template(template).await?;
        let search_index = self.search_index.clone();
        let signature = updated.signature();
        tokio::spawn(async move {
            if let Err(e) = search_index.index_template_signature(&signature).await {
                warn!(
                    template_id = %signature.template_id,
                    error = %e,
                    "Background signature re-index failed"
                );
            }
        });
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::CanonicalRegistry;
    use crate::contracts::FieldSpec;
    use crate::file_store::FileStore;
    use crate::search_index::HybridSearchIndex;
    use crate::testing::{ScriptedLlm, StubParser};
    use crate::types::{FieldType, TemplateKind, ValidatedFieldName, ValidatedTemplateName};
    use crate::wrappers::CachedParser;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Harness {
        pipeline: IngestionPipeline,
        store: Arc<FileStore>,
        index: Arc<HybridSearchIndex>,
        parser: Arc<CachedParser<StubParser>>,
        _dir: TempDir,
    }

    async fn harness(llm: Option<Arc<ScriptedLlm>>) -> Harness {
        let dir = TempDir::new().unwrap();
        let settings = Settings::default();
        let store: Arc<FileStore> =
            Arc::new(FileStore::open(dir.path().to_str().unwrap()).await.unwrap());
        let index = Arc::new(HybridSearchIndex::new(&settings));
        let parser = Arc::new(CachedParser::new(StubParser::new()));
        let registry = Arc::new(CanonicalRegistry::with_defaults());

        let matcher = TemplateMatcher::new(
            store.clone(),
            index.clone(),
            llm.map(|l| l as Arc<dyn crate::llm_client::LlmClient>),
            settings.matcher.clone(),
        );
        let extractor = Extractor::new(
            store.clone(),
            index.clone(),
            parser.clone(),
            None,
            registry,
            settings.clone(),
        );
        let pipeline = IngestionPipeline::new(
            store.clone(),
            index.clone(),
            parser.clone(),
            matcher,
            extractor,
            settings,
        );
        Harness {
            pipeline,
            store,
            index,
            parser,
            _dir: dir,
        }
    }

    fn contract_template() -> Template {
        Template::new(
            ValidatedTemplateName::new("Contract").unwrap(),
            TemplateKind::Contract,
            vec![
                FieldSpec::new(
                    ValidatedFieldName::new("contract_title").unwrap(),
                    FieldType::Text,
                ),
                FieldSpec::new(
                    ValidatedFieldName::new("effective_date").unwrap(),
                    FieldType::Date,
                ),
                FieldSpec::new(
                    ValidatedFieldName::new("party_a").unwrap(),
                    FieldType::Text,
                ),
            ],
        )
        .unwrap()
    }

    const CONTRACT_TEXT: &str = "Contract title: Bring Your Own Cloud (BYOC) Services Addendum\n\
                                 Effective date: June 5, 2025\n\
                                 Party a: Pinecone Systems, Inc.";

    #[tokio::test]
    async fn test_pipelined_extraction_end_to_end() {
        let h = harness(None).await;
        let template = h.store.create_template(contract_template()).await.unwrap();
        h.index
            .index_template_signature(&template.signature())
            .await
            .unwrap();

        let result = h
            .pipeline
            .ingest_batch(vec![BatchFile {
                filename: "contract.pdf".to_string(),
                bytes: CONTRACT_TEXT.as_bytes().to_vec(),
                requested_template_id: None,
            }])
            .await;

        assert_eq!(result.failed.len(), 0);
        assert_eq!(result.succeeded.len(), 1);
        assert_eq!(result.succeeded[0].status, DocumentStatus::Completed);
        assert_eq!(result.analytics.signature_matches, 1);
        assert_eq!(result.analytics.llm_matches, 0);

        // Pipelining invariant: exactly one bytes-parse, zero bytes-extracts
        assert_eq!(h.parser.bytes_parse_count(), 1);

        let doc_id = result.succeeded[0].document_id;
        let doc = h.store.get_document(&doc_id).await.unwrap().unwrap();
        assert!(doc.parse_job_id.is_some());

        let title = h
            .store
            .find_field(&doc_id, "contract_title")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            title.field_value.as_deref(),
            Some("Bring Your Own Cloud (BYOC) Services Addendum")
        );
        assert!(title.confidence.get() >= 0.80);
    }

    #[tokio::test]
    async fn test_batch_partial_failure() {
        let h = harness(None).await;
        let template = h.store.create_template(contract_template()).await.unwrap();
        h.index
            .index_template_signature(&template.signature())
            .await
            .unwrap();

        let result = h
            .pipeline
            .ingest_batch(vec![
                BatchFile {
                    filename: "good.pdf".to_string(),
                    bytes: CONTRACT_TEXT.as_bytes().to_vec(),
                    requested_template_id: None,
                },
                BatchFile {
                    filename: "empty.pdf".to_string(),
                    bytes: Vec::new(),
                    requested_template_id: None,
                },
            ])
            .await;

        assert_eq!(result.succeeded.len(), 1);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].filename, "empty.pdf");
        assert_eq!(result.failed[0].error_code, IngestFailureCode::ParseFailed);
    }

    #[tokio::test]
    async fn test_template_needed_suspends_then_resumes() {
        // No templates indexed and no LLM: every document suspends
        let h = harness(None).await;
        let template = h.store.create_template(contract_template()).await.unwrap();

        let result = h
            .pipeline
            .ingest_batch(vec![BatchFile {
                filename: "mystery.pdf".to_string(),
                bytes: b"Totally unstructured narrative text".to_vec(),
                requested_template_id: None,
            }])
            .await;

        assert_eq!(result.succeeded.len(), 1);
        assert_eq!(result.succeeded[0].status, DocumentStatus::TemplateNeeded);
        let doc_id = result.succeeded[0].document_id;

        // User picks a template; the pipeline resumes from the cached parse
        let resumed = h
            .pipeline
            .resume_with_template(&doc_id, &template.id)
            .await
            .unwrap();
        assert_eq!(resumed.status, DocumentStatus::Completed);
        // Still exactly one bytes-parse for this file
        assert_eq!(h.parser.bytes_parse_count(), 1);
    }

    #[tokio::test]
    async fn test_requested_template_skips_matching() {
        let h = harness(None).await;
        let template = h.store.create_template(contract_template()).await.unwrap();

        let result = h
            .pipeline
            .ingest_batch(vec![BatchFile {
                filename: "contract.pdf".to_string(),
                bytes: CONTRACT_TEXT.as_bytes().to_vec(),
                requested_template_id: Some(template.id),
            }])
            .await;

        assert_eq!(result.succeeded.len(), 1);
        assert_eq!(result.succeeded[0].status, DocumentStatus::Completed);
        assert_eq!(result.analytics.signature_matches, 0);
        assert_eq!(result.analytics.llm_matches, 0);
    }

    #[tokio::test]
    async fn test_reprocess_uses_cached_parse() {
        let h = harness(None).await;
        let template = h.store.create_template(contract_template()).await.unwrap();
        h.index
            .index_template_signature(&template.signature())
            .await
            .unwrap();

        let result = h
            .pipeline
            .ingest_batch(vec![BatchFile {
                filename: "contract.pdf".to_string(),
                bytes: CONTRACT_TEXT.as_bytes().to_vec(),
                requested_template_id: None,
            }])
            .await;
        let doc_id = result.succeeded[0].document_id;
        assert_eq!(h.parser.bytes_parse_count(), 1);

        let reprocessed = h.pipeline.reprocess_document(&doc_id).await.unwrap();
        assert_eq!(reprocessed.status, DocumentStatus::Completed);
        // Re-extract referenced jobid://, so the bytes-parse count is unchanged
        assert_eq!(h.parser.bytes_parse_count(), 1);
    }

    #[tokio::test]
    async fn test_template_edit_reindexes_signature() {
        let h = harness(None).await;
        let template = h.store.create_template(contract_template()).await.unwrap();
        h.index
            .index_template_signature(&template.signature())
            .await
            .unwrap();

        let mut edited = template.clone();
        edited.fields.push(FieldSpec::new(
            ValidatedFieldName::new("termination_clause").unwrap(),
            FieldType::Text,
        ));
        let updated = h.pipeline.update_template(edited).await.unwrap();
        assert_eq!(updated.signature_version, 2);

        // The background worker publishes the new fingerprint
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let results = h
            .index
            .find_similar_templates(&["termination_clause".to_string()], None, 1)
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].template_id, template.id);
    }
}
