// PaperDb - Top-Level Facade
// Wires the store, indices, clients, and engines into one handle exposing the
// product surface: batch ingestion, natural-language queries, and the audit
// queue. Interface layers (CLI, embedders' hosts, tests) all go through this.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::audit_queue::{AuditPage, AuditQueue, VerifyOutcome};
use crate::canonical::{CanonicalMapping, CanonicalRegistry};
use crate::config::Settings;
use crate::contracts::{AuditFilter, Document, SearchIndex, Store, Template};
use crate::embedder::Embedder;
use crate::extractor::Extractor;
use crate::file_store::FileStore;
use crate::llm_client::LlmClient;
use crate::parser_client::Parser;
use crate::pipeline::{BatchFile, BatchResult, IngestionPipeline};
use crate::query_planner::QueryPlanner;
use crate::retrieval::{QueryRequest, QueryResponse, RetrievalEngine};
use crate::search_index::HybridSearchIndex;
use crate::template_matcher::TemplateMatcher;
use crate::types::{
    DocumentStatus, ValidatedDocumentId, ValidatedFieldId, ValidatedTemplateId,
    VerificationAction,
};
use crate::wrappers::{CachedParser, TracedStore};

/// External collaborators injected at startup
pub struct Clients {
    pub parser: Arc<dyn Parser>,
    pub llm: Option<Arc<dyn LlmClient>>,
    pub embedder: Option<Arc<dyn Embedder>>,
}

/// The assembled database
pub struct PaperDb {
    store: Arc<dyn Store>,
    search_index: Arc<HybridSearchIndex>,
    registry: Arc<CanonicalRegistry>,
    pipeline: IngestionPipeline,
    engine: RetrievalEngine,
    audit_queue: AuditQueue,
    settings: Settings,
    canonical_path: PathBuf,
}

impl PaperDb {
    /// Open (or initialize) a database at `path` with the given collaborators
    ///
    /// Loads persisted settings and canonical mappings, then rebuilds the
    /// search projection from the store so queries see every completed
    /// document.
    pub async fn open(path: &str, clients: Clients) -> Result<Self> {
        let root = PathBuf::from(path);
        let settings_path = root.join("settings.json");
        let settings = Settings::load_or_default(&settings_path)
            .context("Failed to load settings")?;
        Self::open_with_settings(path, clients, settings).await
    }

    pub async fn open_with_settings(
        path: &str,
        clients: Clients,
        settings: Settings,
    ) -> Result<Self> {
        settings.validate()?;
        let root = PathBuf::from(path);
        let canonical_path = root.join("canonical.json");

        let store: Arc<dyn Store> =
            Arc::new(TracedStore::new(FileStore::open(path).await?));
        let registry = Arc::new(CanonicalRegistry::load(&canonical_path)?);
        let search_index = Arc::new(HybridSearchIndex::new(&settings));

        // The index is a projection; reconcile it from authoritative state
        search_index
            .rebuild_from_store(store.as_ref(), &registry, &settings.index)
            .await?;

        let parser: Arc<dyn Parser> = Arc::new(CachedParser::new(ArcParser(clients.parser)));
        let search_index_dyn: Arc<dyn SearchIndex> = search_index.clone();

        let matcher = TemplateMatcher::new(
            store.clone(),
            search_index_dyn.clone(),
            clients.llm.clone(),
            settings.matcher.clone(),
        );
        let extractor = Extractor::new(
            store.clone(),
            search_index_dyn.clone(),
            parser.clone(),
            clients.embedder.clone(),
            registry.clone(),
            settings.clone(),
        );
        let pipeline = IngestionPipeline::new(
            store.clone(),
            search_index_dyn.clone(),
            parser.clone(),
            matcher,
            extractor,
            settings.clone(),
        );

        let planner = QueryPlanner::new(
            registry.clone(),
            clients.llm.clone(),
            settings.planner.clone(),
        );
        let engine = RetrievalEngine::new(
            store.clone(),
            search_index_dyn,
            planner,
            clients.llm,
            clients.embedder,
            settings.clone(),
        );
        let audit_queue = AuditQueue::new(store.clone());

        info!(path, "PaperDb opened");
        Ok(Self {
            store,
            search_index,
            registry,
            pipeline,
            engine,
            audit_queue,
            settings,
            canonical_path,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn search_index(&self) -> &dyn SearchIndex {
        self.search_index.as_ref()
    }

    /// Ingest a batch of files
    pub async fn ingest_batch(&self, files: Vec<BatchFile>) -> BatchResult {
        self.pipeline.ingest_batch(files).await
    }

    /// Resume a suspended document with a user-chosen template
    pub async fn resume_with_template(
        &self,
        document_id: &ValidatedDocumentId,
        template_id: &ValidatedTemplateId,
    ) -> Result<Document> {
        self.pipeline
            .resume_with_template(document_id, template_id)
            .await
    }

    /// Operator-initiated re-extract from the cached parse
    pub async fn reprocess_document(&self, document_id: &ValidatedDocumentId) -> Result<Document> {
        self.pipeline.reprocess_document(document_id).await
    }

    /// Answer a natural-language question
    pub async fn ask(&self, request: QueryRequest) -> Result<QueryResponse> {
        self.engine.ask(request).await
    }

    /// List the audit queue
    pub async fn audit_list(
        &self,
        filter: &AuditFilter,
        page: usize,
        size: usize,
    ) -> Result<AuditPage> {
        self.audit_queue.list(filter, page, size).await
    }

    /// Record a verification outcome
    ///
    /// The verified document is re-indexed from the store afterwards, so the
    /// corrected value is what queries see from now on.
    pub async fn verify(
        &self,
        field_id: &ValidatedFieldId,
        action: VerificationAction,
        corrected_value: Option<String>,
        notes: Option<String>,
        reviewer_id: Option<String>,
        citation_id: Option<Uuid>,
    ) -> Result<VerifyOutcome> {
        let outcome = self
            .audit_queue
            .verify(field_id, action, corrected_value, notes, reviewer_id, citation_id)
            .await?;
        self.reindex_document(&outcome.field.document_id).await?;
        Ok(outcome)
    }

    /// Idempotently rewrite one document's search entry from store state
    pub async fn reindex_document(&self, document_id: &ValidatedDocumentId) -> Result<()> {
        let document = match self.store.get_document(document_id).await? {
            Some(document) => document,
            None => return Ok(()),
        };
        let template = match document.template_id {
            Some(template_id) => self.store.get_template(&template_id).await?,
            None => None,
        };
        let fields = self.store.fields_for_document(document_id).await?;
        let search_doc = crate::search_index::build_search_doc(
            &document,
            template.as_ref(),
            &fields,
            &self.registry,
            &self.settings.index,
            None,
        );
        self.search_index.index_document(&search_doc).await
    }

    /// Create a template and index its fingerprint
    pub async fn create_template(&self, template: Template) -> Result<Template> {
        let created = self.store.create_template(template).await?;
        self.search_index
            .index_template_signature(&created.signature())
            .await?;
        Ok(created)
    }

    /// Edit a template: bumps the signature version and re-indexes the
    /// fingerprint in the background
    pub async fn update_template(&self, template: Template) -> Result<Template> {
        self.pipeline.update_template(template).await
    }

    pub async fn list_templates(&self) -> Result<Vec<Template>> {
        self.store.list_templates().await
    }

    pub async fn list_documents(
        &self,
        status: Option<DocumentStatus>,
    ) -> Result<Vec<Document>> {
        self.store.list_documents(status).await
    }

    /// Add or replace a user-defined canonical mapping and persist the set
    pub fn upsert_canonical_mapping(&self, mapping: CanonicalMapping) -> Result<()> {
        self.registry.upsert(mapping)?;
        self.registry.save(&self.canonical_path)
    }

    /// Snapshot of document counts by status plus queue shape
    pub async fn stats(&self) -> Result<serde_json::Value> {
        let documents = self.store.list_documents(None).await?;
        let mut by_status: std::collections::BTreeMap<String, usize> = Default::default();
        for doc in &documents {
            *by_status.entry(doc.status.to_string()).or_insert(0) += 1;
        }
        let queue = self
            .audit_queue
            .list(&AuditFilter::default(), 0, 1)
            .await?;

        Ok(serde_json::json!({
            "documents": by_status,
            "documents_total": documents.len(),
            "indexed_documents": self.search_index.doc_count().await,
            "semantic_documents": self.search_index.semantic_doc_count().await,
            "audit_queue": {
                "total": queue.priority_counts.total(),
                "critical": queue.priority_counts.critical,
                "high": queue.priority_counts.high,
                "medium": queue.priority_counts.medium,
            },
            "process": crate::observability::get_metrics(),
        }))
    }
}

/// Adapter so an injected `Arc<dyn Parser>` can sit behind `CachedParser`'s
/// generic parameter
struct ArcParser(Arc<dyn Parser>);

#[async_trait::async_trait]
impl Parser for ArcParser {
    async fn parse(&self, bytes: &[u8]) -> Result<(String, crate::contracts::ParsedDocument)> {
        self.0.parse(bytes).await
    }

    async fn extract_structured(
        &self,
        source: crate::parser_client::SourceRef<'_>,
        fields: &[crate::contracts::FieldSpec],
    ) -> Result<std::collections::HashMap<String, crate::parser_client::RawExtraction>> {
        self.0.extract_structured(source, fields).await
    }
}
