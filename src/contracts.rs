// Contract-First Design
// This module defines the persistence and index contracts plus the entity
// structs they exchange. Preconditions and postconditions are documented on
// each operation and validated at runtime by the implementations.

use anyhow::{ensure, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    AuditPriority, BoundingBox, Confidence, ContentHash, DocumentStatus, FieldType, FieldValue,
    QuerySource, TemplateKind, ValidatedDocumentId, ValidatedFieldId, ValidatedFieldName,
    ValidatedFileName, ValidatedTemplateId, ValidatedTemplateName, ValidationStatus,
    VerificationAction,
};

/// The stored bytes behind one or more documents
///
/// The content hash uniquely identifies the bytes; the storage path may move
/// (template-folder reorganization) but lookups always go through the hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalFile {
    pub hash: ContentHash,
    pub storage_path: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// One ingestion of a physical file under a chosen template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: ValidatedDocumentId,
    pub filename: ValidatedFileName,
    pub content_hash: ContentHash,
    pub status: DocumentStatus,
    pub template_id: Option<ValidatedTemplateId>,
    pub parse_job_id: Option<String>,
    pub cached_parse: Option<ParsedDocument>,
    pub actual_file_path: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Document {
    /// Whether extraction may run: a template is chosen and a parse is cached
    pub fn ready_for_extraction(&self) -> bool {
        self.template_id.is_some() && self.parse_job_id.is_some()
    }
}

/// One field declared by a template schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: ValidatedFieldName,
    pub field_type: FieldType,
    pub required: bool,
    /// Primary fields (vendor, totals, dates) index in the middle weight band
    pub primary: bool,
    pub description: String,
    pub extraction_hints: Vec<String>,
    /// Per-field override of the review threshold
    pub confidence_threshold: Option<f64>,
}

impl FieldSpec {
    pub fn new(name: ValidatedFieldName, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            required: false,
            primary: false,
            description: String::new(),
            extraction_hints: Vec::new(),
            confidence_threshold: None,
        }
    }
}

/// A named schema: the unit a document is matched against and extracted under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: ValidatedTemplateId,
    pub name: ValidatedTemplateName,
    pub kind: TemplateKind,
    pub fields: Vec<FieldSpec>,
    /// Optional example text indexed into the template fingerprint
    pub sample_text: Option<String>,
    /// Bumped on every edit; triggers signature re-indexing
    pub signature_version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    /// Create a template, enforcing field-name uniqueness
    pub fn new(
        name: ValidatedTemplateName,
        kind: TemplateKind,
        fields: Vec<FieldSpec>,
    ) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for spec in &fields {
            ensure!(
                seen.insert(spec.name.as_str().to_string()),
                "Duplicate field name in template: {}",
                spec.name
            );
        }
        let now = Utc::now();
        Ok(Self {
            id: ValidatedTemplateId::new(),
            name,
            kind,
            fields,
            sample_text: None,
            signature_version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name.as_str() == name)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .map(|f| f.name.as_str().to_string())
            .collect()
    }

    pub fn primary_field_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.primary)
            .map(|f| f.name.as_str().to_string())
            .collect()
    }

    /// The fingerprint indexed for template matching
    pub fn signature(&self) -> TemplateSignature {
        TemplateSignature {
            template_id: self.id,
            template_name: self.name.as_str().to_string(),
            field_names: self.field_names(),
            sample_text: self.sample_text.clone(),
            signature_version: self.signature_version,
        }
    }
}

/// One value extracted from one document for one field spec
///
/// # Invariants
/// - Structured field types carry `field_value_json` and a null `field_value`;
///   scalar types carry `field_value` and a null `field_value_json`
/// - `audit_priority` is a pure function of (confidence, validation status,
///   thresholds); it is recomputed, never hand-set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField {
    pub id: ValidatedFieldId,
    pub document_id: ValidatedDocumentId,
    pub field_name: ValidatedFieldName,
    pub field_type: FieldType,
    pub field_value: Option<String>,
    pub field_value_json: Option<FieldValue>,
    pub confidence: Confidence,
    pub source_page: Option<u32>,
    pub source_bbox: Option<BoundingBox>,
    pub validation_status: ValidationStatus,
    pub validation_errors: Vec<String>,
    pub audit_priority: AuditPriority,
    pub verified: bool,
    pub verified_value: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub citation_count: u64,
    pub last_cited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ExtractedField {
    /// Create a field row, enforcing the value/value-json exclusivity invariant
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        document_id: ValidatedDocumentId,
        field_name: ValidatedFieldName,
        field_type: FieldType,
        field_value: Option<String>,
        field_value_json: Option<FieldValue>,
        confidence: Confidence,
        source_page: Option<u32>,
        source_bbox: Option<BoundingBox>,
    ) -> Result<Self> {
        if field_type.is_structured() {
            ensure!(
                field_value.is_none(),
                "Structured field {} must not carry a scalar value",
                field_name
            );
        } else {
            ensure!(
                field_value_json.is_none(),
                "Scalar field {} must not carry a JSON value",
                field_name
            );
        }
        Ok(Self {
            id: ValidatedFieldId::new(),
            document_id,
            field_name,
            field_type,
            field_value,
            field_value_json,
            confidence,
            source_page,
            source_bbox,
            validation_status: ValidationStatus::Unchecked,
            validation_errors: Vec::new(),
            audit_priority: AuditPriority::Low,
            verified: false,
            verified_value: None,
            verified_at: None,
            citation_count: 0,
            last_cited_at: None,
            created_at: Utc::now(),
        })
    }

    /// The value a reader should see: the verified correction wins
    pub fn current_value(&self) -> Option<String> {
        if self.verified {
            if let Some(corrected) = &self.verified_value {
                return Some(corrected.clone());
            }
        }
        if let Some(value) = &self.field_value {
            return Some(value.clone());
        }
        self.field_value_json.as_ref().map(|v| v.to_index_text())
    }

    /// Whether the extractor produced anything at all for this field
    pub fn is_missing(&self) -> bool {
        self.field_value.is_none() && self.field_value_json.is_none()
    }
}

/// Append-only record of one human review outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub id: Uuid,
    pub field_id: ValidatedFieldId,
    pub action: VerificationAction,
    pub corrected_value: Option<String>,
    pub notes: Option<String>,
    pub reviewer_id: Option<String>,
    pub verified_at: DateTime<Utc>,
}

/// Identifiers needed to build an audit link; the URL schema lives elsewhere
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLink {
    pub field_id: ValidatedFieldId,
    pub document_id: ValidatedDocumentId,
}

/// Append-only record of one field being used in one generated answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub id: Uuid,
    pub field_id: ValidatedFieldId,
    pub document_id: ValidatedDocumentId,
    pub query_id: Uuid,
    pub query_text: String,
    pub query_source: QuerySource,
    pub confidence_at_citation: Confidence,
    pub context_snippet: String,
    pub audit_link: Option<AuditLink>,
    pub audit_link_clicked: bool,
    pub correction_made: bool,
    pub created_at: DateTime<Utc>,
}

/// One positioned text chunk from the external parser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseChunk {
    pub page: u32,
    pub bbox: Option<BoundingBox>,
    pub text: String,
}

/// The structured result of parsing one physical file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub chunks: Vec<ParseChunk>,
    pub full_text: String,
}

/// Per-template fingerprint indexed for MoreLikeThis matching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSignature {
    pub template_id: ValidatedTemplateId,
    pub template_name: String,
    pub field_names: Vec<String>,
    pub sample_text: Option<String>,
    pub signature_version: u64,
}

impl TemplateSignature {
    /// The space-joined field names plus sample text used as fingerprint text
    pub fn fingerprint_text(&self) -> String {
        let mut text = self.field_names.join(" ");
        if let Some(sample) = &self.sample_text {
            text.push(' ');
            text.push_str(sample);
        }
        text
    }
}

/// Denormalized, index-ready representation of a completed document
///
/// Built deterministically from store state so re-indexing the same state is
/// byte-identical (idempotent indexing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDoc {
    pub document_id: ValidatedDocumentId,
    pub filename: String,
    pub template_id: Option<ValidatedTemplateId>,
    pub template_name: Option<String>,
    pub full_text: String,
    /// Field name -> current searchable value, in template field order
    pub fields: IndexMap<String, String>,
    /// Band A source text: filename and identifier-category fields
    pub identifier_text: String,
    /// Band B source text: primary fields declared by the template
    pub primary_text: String,
    /// Band C source text: body text and remaining fields
    pub body_text: String,
    /// Canonical name -> concrete field name under this document's template
    pub canonical_fields: IndexMap<String, String>,
    /// Field names with a confirmed human verification
    pub verified_fields: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

/// A filter against one concrete or canonical field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    /// Canonical names expand to concrete fields at search time
    pub canonical: bool,
    pub op: FilterOp,
}

/// Supported filter operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FilterOp {
    Gte { value: f64 },
    Lte { value: f64 },
    Between { low: f64, high: f64 },
    Equals { value: String },
    DateRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

/// A fully-resolved query executable by the search index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexQuery {
    pub text: Option<String>,
    /// Pinning a template disables cross-template canonical expansion
    pub template_id: Option<ValidatedTemplateId>,
    pub filters: Vec<FieldFilter>,
    pub limit: usize,
    pub allow_fuzzy: bool,
}

impl IndexQuery {
    pub fn text_only(text: impl Into<String>, limit: usize) -> Self {
        Self {
            text: Some(text.into()),
            template_id: None,
            filters: Vec::new(),
            limit,
            allow_fuzzy: true,
        }
    }
}

/// One scored hit from the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub document_id: ValidatedDocumentId,
    /// Normalized to [0, 1] across the returned set
    pub score: f64,
    pub matched_fields: Vec<String>,
    pub snippet: Option<String>,
    pub created_at: DateTime<Utc>,
    pub has_verified_fields: bool,
}

/// Index search result with diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    pub fuzzy_fallback_used: bool,
    pub total_candidates: usize,
}

/// Template similarity result from the signature index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSimilarity {
    pub template_id: ValidatedTemplateId,
    pub template_name: String,
    /// Normalized to [0, 1]
    pub score: f64,
    /// Overlapping candidate field names, used for tie-breaking
    pub overlap: usize,
}

/// Filter for audit-queue listings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub priority: Option<AuditPriority>,
    pub template_id: Option<ValidatedTemplateId>,
    pub document_id: Option<ValidatedDocumentId>,
}

/// Core trait for authoritative persistence
///
/// The store is the single mutator of authoritative state. Implementations
/// guarantee that each method is atomic: concurrent readers never observe a
/// partially-applied multi-row operation.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create a document for uploaded bytes
    ///
    /// # Preconditions
    /// - `bytes` non-empty
    ///
    /// # Postconditions
    /// - Bytes are persisted exactly once per content hash; a duplicate
    ///   upload reuses the existing physical file and gets a fresh document
    /// - The document starts in `uploaded`
    async fn create_document(
        &self,
        filename: ValidatedFileName,
        bytes: &[u8],
    ) -> Result<Document>;

    async fn get_document(&self, id: &ValidatedDocumentId) -> Result<Option<Document>>;

    /// List documents, optionally restricted to one status. Failed documents
    /// stay visible here with their error message.
    async fn list_documents(&self, status: Option<DocumentStatus>) -> Result<Vec<Document>>;

    /// Transition a document's status
    ///
    /// # Preconditions
    /// - The transition must be legal per the lifecycle state machine
    ///
    /// # Postconditions
    /// - `processed_at` is set when entering `completed`
    /// - `error_message` is recorded when entering `error` and preserved after
    async fn update_document_status(
        &self,
        id: &ValidatedDocumentId,
        status: DocumentStatus,
        error: Option<String>,
    ) -> Result<Document>;

    /// Assign or clear the chosen template
    async fn set_document_template(
        &self,
        id: &ValidatedDocumentId,
        template_id: Option<ValidatedTemplateId>,
    ) -> Result<()>;

    /// Atomically record the parse job id and the parse payload
    ///
    /// # Postconditions
    /// - Both fields are visible together or not at all; a retry after a
    ///   later failure can reuse the cached parse without re-parsing
    async fn cache_parse_result(
        &self,
        id: &ValidatedDocumentId,
        job_id: &str,
        parsed: ParsedDocument,
    ) -> Result<()>;

    /// Move the stored file under a template folder, updating the path while
    /// keeping hash-based lookups intact
    async fn relocate_document_file(
        &self,
        id: &ValidatedDocumentId,
        template_name: &str,
    ) -> Result<String>;

    async fn get_physical_file(&self, hash: &ContentHash) -> Result<Option<PhysicalFile>>;

    async fn create_template(&self, template: Template) -> Result<Template>;

    async fn get_template(&self, id: &ValidatedTemplateId) -> Result<Option<Template>>;

    async fn list_templates(&self) -> Result<Vec<Template>>;

    /// Replace a template's definition
    ///
    /// # Postconditions
    /// - `signature_version` is bumped; callers re-index the signature
    /// - Existing extracted fields are NOT retroactively re-extracted
    async fn update_template(&self, template: Template) -> Result<Template>;

    /// Replace the extracted-field set for a document
    ///
    /// # Postconditions
    /// - Atomic: readers see the old set or the new set, never a mix
    /// - Verification history survives on fields whose name matches an
    ///   existing verified field (verified flag, value, and timestamps carry
    ///   over onto the replacement row)
    async fn upsert_extracted_fields(
        &self,
        document_id: &ValidatedDocumentId,
        fields: Vec<ExtractedField>,
    ) -> Result<Vec<ExtractedField>>;

    async fn fields_for_document(
        &self,
        document_id: &ValidatedDocumentId,
    ) -> Result<Vec<ExtractedField>>;

    async fn get_field(&self, id: &ValidatedFieldId) -> Result<Option<ExtractedField>>;

    async fn find_field(
        &self,
        document_id: &ValidatedDocumentId,
        field_name: &str,
    ) -> Result<Option<ExtractedField>>;

    /// Unverified fields eligible for audit (priority critical..medium),
    /// optionally filtered
    async fn list_audit_fields(&self, filter: &AuditFilter) -> Result<Vec<ExtractedField>>;

    /// Append a verification and update the field in one atomic step
    ///
    /// # Postconditions
    /// - The verification row is appended (never edited)
    /// - `verified` / `verified_value` / `verified_at` are set on the field;
    ///   for `correct` the field row is otherwise unchanged
    /// - The fields generation counter is bumped (invalidates query cache)
    async fn append_verification(
        &self,
        field_id: &ValidatedFieldId,
        action: VerificationAction,
        corrected_value: Option<String>,
        notes: Option<String>,
        reviewer_id: Option<String>,
    ) -> Result<(ExtractedField, Verification)>;

    async fn verifications_for_field(
        &self,
        field_id: &ValidatedFieldId,
    ) -> Result<Vec<Verification>>;

    /// Append a citation and bump the cited field's counters
    async fn record_citation(&self, citation: Citation) -> Result<Citation>;

    /// Mark a citation as audited after its field was verified
    async fn mark_citation_audited(&self, citation_id: Uuid, correction_made: bool) -> Result<()>;

    async fn citations_for_field(&self, field_id: &ValidatedFieldId) -> Result<Vec<Citation>>;

    /// Monotonic counter bumped by every field mutation; query-cache keys
    /// include it so verifications invalidate cached answers
    async fn fields_generation(&self) -> u64;

    /// Force pending writes to durable storage
    async fn flush(&self) -> Result<()>;
}

/// Core trait for the search projection
///
/// The index is a projection of the store: it may lag briefly and is always
/// rebuildable by re-indexing from authoritative state.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Idempotent write of a document's search representation
    ///
    /// # Postconditions
    /// - Re-indexing an unchanged SearchDoc is byte-identical to the stored
    ///   entry (safe to re-run on retry)
    async fn index_document(&self, doc: &SearchDoc) -> Result<()>;

    async fn remove_document(&self, id: &ValidatedDocumentId) -> Result<()>;

    /// The stored search representation, if the document is indexed
    async fn indexed_document(&self, id: &ValidatedDocumentId) -> Result<Option<SearchDoc>>;

    /// Write or overwrite a template fingerprint
    async fn index_template_signature(&self, signature: &TemplateSignature) -> Result<()>;

    /// Execute a resolved query: filters AND'ed, text scored against the
    /// weighted bands, trigram fallback when keywords find nothing
    async fn search(&self, query: &IndexQuery) -> Result<SearchOutcome>;

    /// MoreLikeThis over template fingerprints
    async fn find_similar_templates(
        &self,
        field_names: &[String],
        sample_text: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<TemplateSimilarity>>;

    /// Nearest documents by embedding cosine similarity
    async fn semantic_search(
        &self,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<(ValidatedDocumentId, f64)>>;

    async fn flush(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, field_type: FieldType) -> FieldSpec {
        FieldSpec::new(ValidatedFieldName::new(name).unwrap(), field_type)
    }

    #[test]
    fn test_template_rejects_duplicate_field_names() {
        let name = ValidatedTemplateName::new("Invoice").unwrap();
        let fields = vec![
            spec("invoice_total", FieldType::Number),
            spec("invoice_total", FieldType::Text),
        ];
        assert!(Template::new(name, TemplateKind::Invoice, fields).is_err());
    }

    #[test]
    fn test_template_signature() {
        let name = ValidatedTemplateName::new("Invoice").unwrap();
        let mut template = Template::new(
            name,
            TemplateKind::Invoice,
            vec![
                spec("invoice_number", FieldType::Text),
                spec("invoice_total", FieldType::Number),
            ],
        )
        .unwrap();
        template.sample_text = Some("INVOICE #1234".to_string());

        let signature = template.signature();
        assert_eq!(
            signature.fingerprint_text(),
            "invoice_number invoice_total INVOICE #1234"
        );
        assert_eq!(signature.signature_version, 1);
    }

    #[test]
    fn test_extracted_field_value_exclusivity() {
        let doc_id = ValidatedDocumentId::new();
        let name = ValidatedFieldName::new("line_items").unwrap();

        // Structured type with a scalar value is rejected
        assert!(ExtractedField::new(
            doc_id,
            name.clone(),
            FieldType::Table,
            Some("oops".to_string()),
            None,
            Confidence::new(0.9).unwrap(),
            None,
            None,
        )
        .is_err());

        // Scalar type with a JSON value is rejected
        assert!(ExtractedField::new(
            doc_id,
            ValidatedFieldName::new("vendor").unwrap(),
            FieldType::Text,
            None,
            Some(FieldValue::Scalar {
                value: "Acme".to_string()
            }),
            Confidence::new(0.9).unwrap(),
            None,
            None,
        )
        .is_err());
    }

    #[test]
    fn test_current_value_prefers_verified_correction() {
        let mut field = ExtractedField::new(
            ValidatedDocumentId::new(),
            ValidatedFieldName::new("invoice_total").unwrap(),
            FieldType::Number,
            Some("1500.00".to_string()),
            None,
            Confidence::new(0.8).unwrap(),
            Some(1),
            None,
        )
        .unwrap();

        assert_eq!(field.current_value().as_deref(), Some("1500.00"));

        field.verified = true;
        field.verified_value = Some("2100.00".to_string());
        assert_eq!(field.current_value().as_deref(), Some("2100.00"));
    }
}
