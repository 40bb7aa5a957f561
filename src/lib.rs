// PaperDB - A Document Intelligence Database
// Root library module

pub mod audit_queue;
pub mod builders;
pub mod canonical;
pub mod citation_tracker;
pub mod config;
pub mod contracts;
pub mod database;
pub mod embedder;
pub mod errors;
pub mod extractor;
pub mod file_store;
pub mod keyword_index;
pub mod llm_client;
pub mod observability;
pub mod parser_client;
pub mod pipeline;
pub mod pure;
pub mod query_planner;
pub mod retrieval;
pub mod search_index;
pub mod signature_index;
pub mod template_matcher;
pub mod testing;
pub mod trigram_index;
pub mod types;
pub mod validation;
pub mod validator;
pub mod vector_index;
pub mod wrappers;

// Re-export observability helpers
pub use observability::{
    get_metrics, init_logging, init_logging_with_level, log_operation, record_llm_usage,
    record_metric, with_trace_id, MetricType, Operation, PerfTimer,
};

// Re-export the core contracts and entities
pub use contracts::{
    AuditFilter, AuditLink, Citation, Document, ExtractedField, FieldFilter, FieldSpec, FilterOp,
    IndexQuery, ParseChunk, ParsedDocument, PhysicalFile, SearchDoc, SearchHit, SearchIndex,
    SearchOutcome, Store, Template, TemplateSignature, TemplateSimilarity, Verification,
};

// Re-export validated types
pub use types::{
    AuditPriority, BoundingBox, Confidence, ContentHash, DocumentStatus, FieldType, FieldValue,
    QuerySource, TemplateKind, ValidatedDocumentId, ValidatedFieldId, ValidatedFieldName,
    ValidatedFileName, ValidatedTemplateId, ValidatedTemplateName, ValidationStatus,
    VerificationAction,
};

// Re-export configuration
pub use config::Settings;

// Re-export the error taxonomy
pub use errors::{
    ExternalError, ExternalErrorKind, IngestError, IngestFailureCode, QueryError,
    QueryFailureAdvice,
};

// Re-export the store implementation
pub use file_store::{create_file_store, FileStore};

// Re-export the index implementations
pub use keyword_index::KeywordIndex;
pub use search_index::{build_search_doc, HybridSearchIndex};
pub use signature_index::SignatureIndex;
pub use trigram_index::TrigramIndex;
pub use vector_index::VectorIndex;

// Re-export external-service clients
pub use embedder::{Embedder, HttpEmbedder};
pub use llm_client::{CompletionOptions, HttpLlmClient, LlmClient, LlmResponse};
pub use parser_client::{HttpParser, Parser, RawExtraction, SourceRef};

// Re-export the canonical registry
pub use canonical::{AggregationType, CanonicalMapping, CanonicalRegistry};

// Re-export pipeline components
pub use extractor::Extractor;
pub use pipeline::{
    BatchAnalytics, BatchFile, BatchFailure, BatchResult, BatchSuccess, IngestionPipeline,
};
pub use template_matcher::{MatchOutcome, MatchSource, TemplateMatcher};
pub use validator::{FieldValidation, Validator};

// Re-export the query path
pub use citation_tracker::{AnnotatedCitation, CitationTracker};
pub use query_planner::{AggregationSpec, Plan, QueryIntent, QueryPlanner, SortOrder, TimeBucket};
pub use retrieval::{
    AggregateResult, PlanDiagnostics, QueryRequest, QueryResponse, RetrievalEngine, SourceDoc,
};

// Re-export the audit queue
pub use audit_queue::{AuditPage, AuditQueue, FieldWithContext, PriorityCounts, VerifyOutcome};

// Re-export wrappers
pub use wrappers::{with_backoff, CachedParser, RetryingEmbedder, TracedStore, TtlCache};

// Re-export builders
pub use builders::{CanonicalMappingBuilder, TemplateBuilder};

// Re-export the pure kernels
pub use pure::{compute_audit_priority, reciprocal_rank_fusion};

// Re-export the top-level facade
pub use database::{Clients, PaperDb};
