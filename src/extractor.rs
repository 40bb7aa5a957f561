// Extractor
// Runs structured extraction for a document with a chosen template and a
// cached parse. Extraction always references the parse job id; a document
// without one fails rather than re-uploading bytes. Store and index writes
// are ordered: fields land in the store first, and an index failure marks the
// document errored without rolling the store write back.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::canonical::CanonicalRegistry;
use crate::config::Settings;
use crate::contracts::{ExtractedField, SearchIndex, Store, Template};
use crate::embedder::Embedder;
use crate::errors::IngestError;
use crate::parser_client::{Parser, RawExtraction, SourceRef};
use crate::pure::compute_audit_priority;
use crate::search_index::build_search_doc;
use crate::types::{
    BoundingBox, Confidence, FieldType, FieldValue, ValidatedDocumentId,
};
use crate::validator::Validator;
use crate::wrappers::with_backoff;

pub struct Extractor {
    store: Arc<dyn Store>,
    search_index: Arc<dyn SearchIndex>,
    parser: Arc<dyn Parser>,
    embedder: Option<Arc<dyn Embedder>>,
    registry: Arc<CanonicalRegistry>,
    settings: Settings,
}

impl Extractor {
    pub fn new(
        store: Arc<dyn Store>,
        search_index: Arc<dyn SearchIndex>,
        parser: Arc<dyn Parser>,
        embedder: Option<Arc<dyn Embedder>>,
        registry: Arc<CanonicalRegistry>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            search_index,
            parser,
            embedder,
            registry,
            settings,
        }
    }

    /// Extract, validate, prioritize, persist, and index one document
    ///
    /// # Preconditions
    /// - The document has a chosen template and a cached parse job id
    pub async fn extract_document(
        &self,
        document_id: &ValidatedDocumentId,
    ) -> Result<Vec<ExtractedField>> {
        let document = self
            .store
            .get_document(document_id)
            .await?
            .with_context(|| format!("Document not found: {document_id}"))?;

        let template_id = match document.template_id {
            Some(id) => id,
            None => bail!(IngestError::ExtractFailed(
                "document has no chosen template".to_string()
            )),
        };
        let job_id = match &document.parse_job_id {
            Some(id) => id.clone(),
            None => bail!(IngestError::ExtractFailed(
                "document has no cached parse job id".to_string()
            )),
        };
        let template = self
            .store
            .get_template(&template_id)
            .await?
            .with_context(|| format!("Template not found: {template_id}"))?;

        // Pipelined extraction: jobid:// only, never bytes. If the parser
        // cannot honor the job reference the document fails here.
        let parser = self.parser.clone();
        let fields_spec = template.fields.clone();
        let raw = with_backoff(
            "parser",
            3,
            Duration::from_millis(500),
            Duration::from_secs(8),
            move || {
                let parser = parser.clone();
                let fields_spec = fields_spec.clone();
                let job_id = job_id.clone();
                async move {
                    parser
                        .extract_structured(SourceRef::JobId(&job_id), &fields_spec)
                        .await
                }
            },
        )
        .await
        .map_err(|e| IngestError::ExtractFailed(e.to_string()))?;

        let mut fields = self.normalize(&document.id, &template, raw)?;

        // Validation and audit priority
        let validator = Validator::new(self.settings.audit.clone());
        let validations = validator.validate(&template, &fields);
        for field in &mut fields {
            if let Some(validation) = validations.get(field.field_name.as_str()) {
                field.validation_status = validation.status;
                field.validation_errors = validation.errors.clone();
            }
            let review_threshold = template
                .field(field.field_name.as_str())
                .and_then(|spec| spec.confidence_threshold)
                .unwrap_or(self.settings.audit.review_threshold);
            field.audit_priority = compute_audit_priority(
                field.confidence.get(),
                field.validation_status,
                review_threshold,
                self.settings.audit.high_confidence,
            );
        }

        // Ordered writes: store first, then index. The index is rebuildable,
        // so its failure must not roll back the authoritative fields.
        let stored = self
            .store
            .upsert_extracted_fields(&document.id, fields)
            .await
            .map_err(|e| IngestError::ExtractFailed(format!("store write failed: {e}")))?;

        let embedding = self.embed_full_text(&document).await;
        let search_doc = build_search_doc(
            &document,
            Some(&template),
            &stored,
            &self.registry,
            &self.settings.index,
            embedding,
        );
        self.search_index
            .index_document(&search_doc)
            .await
            .map_err(|e| IngestError::IndexFailed(e.to_string()))?;

        info!(
            doc_id = %document.id,
            template = template.name.as_str(),
            fields = stored.len(),
            "Document extracted and indexed"
        );
        Ok(stored)
    }

    /// Embed the full text for the semantic index; embedder failure skips
    /// the semantic entry and continues
    async fn embed_full_text(&self, document: &crate::contracts::Document) -> Option<Vec<f32>> {
        if !self.settings.query.enable_semantic_rerank {
            return None;
        }
        let embedder = self.embedder.as_ref()?;
        let full_text = document.cached_parse.as_ref()?.full_text.clone();
        match embedder.embed(&full_text).await {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                warn!(doc_id = %document.id, error = %e, "Embedding failed, skipping semantic index");
                None
            }
        }
    }

    /// Normalize the parser response: one row per template field, missing
    /// fields becoming null-value zero-confidence rows
    fn normalize(
        &self,
        document_id: &ValidatedDocumentId,
        template: &Template,
        mut raw: HashMap<String, RawExtraction>,
    ) -> Result<Vec<ExtractedField>> {
        let mut fields = Vec::with_capacity(template.fields.len());
        for spec in &template.fields {
            let extraction = raw.remove(spec.name.as_str());
            let (value, value_json, confidence, page, bbox) = match extraction {
                Some(extraction) => {
                    let bbox = extraction.bbox.and_then(BoundingBox::from_tuple);
                    let confidence = Confidence::clamped(extraction.confidence);
                    match extraction.value {
                        Some(json) => {
                            let (value, value_json) = convert_value(spec.field_type, json);
                            (value, value_json, confidence, extraction.page, bbox)
                        }
                        None => (None, None, Confidence::ZERO, extraction.page, bbox),
                    }
                }
                None => (None, None, Confidence::ZERO, None, None),
            };

            fields.push(ExtractedField::new(
                *document_id,
                spec.name.clone(),
                spec.field_type,
                value,
                value_json,
                confidence,
                page,
                bbox,
            )?);
        }
        Ok(fields)
    }
}

/// Convert a raw JSON value into the (scalar, structured) pair for a field
/// type, coercing mismatched shapes toward the declared type
fn convert_value(
    field_type: FieldType,
    json: serde_json::Value,
) -> (Option<String>, Option<FieldValue>) {
    use serde_json::Value;

    if field_type.is_structured() {
        let structured = match (field_type, json) {
            (FieldType::Table, Value::Object(map)) => {
                let headers = map
                    .get("headers")
                    .and_then(|h| h.as_array())
                    .map(|arr| {
                        arr.iter()
                            .map(|v| v.as_str().unwrap_or_default().to_string())
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                let rows = map
                    .get("rows")
                    .and_then(|r| r.as_array())
                    .map(|arr| {
                        arr.iter()
                            .map(|row| {
                                row.as_array()
                                    .map(|cells| {
                                        cells.iter().cloned().map(json_to_field_value).collect()
                                    })
                                    .unwrap_or_default()
                            })
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                Some(FieldValue::Table { headers, rows })
            }
            (FieldType::ArrayOfObjects, Value::Array(items)) => {
                let objects = items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::Object(map) => Some(map),
                        _ => None,
                    })
                    .collect();
                Some(FieldValue::ArrayOfObjects { items: objects })
            }
            (_, Value::Array(items)) => Some(FieldValue::Array {
                items: items.into_iter().map(json_to_field_value).collect(),
            }),
            (_, other) => Some(FieldValue::Array {
                items: vec![json_to_field_value(other)],
            }),
        };
        (None, structured)
    } else {
        let scalar = match json {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Null => None,
            other => Some(other.to_string()),
        };
        (scalar, None)
    }
}

fn json_to_field_value(json: serde_json::Value) -> FieldValue {
    use serde_json::Value;
    match json {
        Value::Number(n) => FieldValue::Number {
            value: n.as_f64().unwrap_or(0.0),
        },
        Value::String(s) => FieldValue::Scalar { value: s },
        other => FieldValue::Scalar {
            value: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::FieldSpec;
    use crate::file_store::FileStore;
    use crate::search_index::HybridSearchIndex;
    use crate::testing::StubParser;
    use crate::types::{
        AuditPriority, TemplateKind, ValidatedFieldName, ValidatedFileName, ValidatedTemplateName,
        ValidationStatus,
    };
    use crate::types::DocumentStatus;
    use tempfile::TempDir;

    async fn harness(
        parser: StubParser,
    ) -> (
        Extractor,
        Arc<StubParser>,
        Arc<FileStore>,
        Arc<HybridSearchIndex>,
        TempDir,
    ) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(dir.path().to_str().unwrap()).await.unwrap());
        let index = Arc::new(HybridSearchIndex::new(&Settings::default()));
        let stub = Arc::new(parser);
        let extractor = Extractor::new(
            store.clone(),
            index.clone(),
            stub.clone(),
            None,
            Arc::new(CanonicalRegistry::with_defaults()),
            Settings::default(),
        );
        (extractor, stub, store, index, dir)
    }

    fn invoice_template() -> Template {
        let mut total = FieldSpec::new(
            ValidatedFieldName::new("invoice_total").unwrap(),
            FieldType::Number,
        );
        total.required = true;
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

    async fn prepared_document(
        store: &FileStore,
        parser: &dyn Parser,
        template: &Template,
        bytes: &[u8],
    ) -> ValidatedDocumentId {
        let doc = store
            .create_document(ValidatedFileName::new("inv.pdf").unwrap(), bytes)
            .await
            .unwrap();
        let (job_id, parsed) = parser.parse(bytes).await.unwrap();
        store
            .update_document_status(&doc.id, DocumentStatus::Analyzing, None)
            .await
            .unwrap();
        store.cache_parse_result(&doc.id, &job_id, parsed).await.unwrap();
        store
            .set_document_template(&doc.id, Some(template.id))
            .await
            .unwrap();
        doc.id
    }

    #[tokio::test]
    async fn test_extraction_uses_job_id_not_bytes() {
        let (extractor, stub, store, _index, _dir) = harness(StubParser::new()).await;
        let template = store.create_template(invoice_template()).await.unwrap();

        let bytes = b"Invoice total: $5,000.00\nVendor: Acme Corp";
        let doc_id = prepared_document(&store, stub.as_ref(), &template, bytes).await;

        let fields = extractor.extract_document(&doc_id).await.unwrap();
        assert_eq!(fields.len(), 2);

        // The stub counts raw-bytes extraction calls; the pipelined path
        // must never produce one.
        assert_eq!(stub.bytes_extract_count(), 0);
        assert_eq!(stub.bytes_parse_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_field_normalized_to_zero_confidence() {
        let (extractor, stub, store, _index, _dir) = harness(StubParser::new()).await;
        let template = store.create_template(invoice_template()).await.unwrap();

        // Only the vendor appears in the document text
        let bytes = b"Vendor: Acme Corp";
        let doc_id = prepared_document(&store, stub.as_ref(), &template, bytes).await;

        let fields = extractor.extract_document(&doc_id).await.unwrap();
        let total = fields
            .iter()
            .find(|f| f.field_name.as_str() == "invoice_total")
            .unwrap();
        assert!(total.is_missing());
        assert_eq!(total.confidence, Confidence::ZERO);
        // Missing required field at zero confidence: critical priority
        assert_eq!(total.validation_status, ValidationStatus::Error);
        assert_eq!(total.audit_priority, AuditPriority::Critical);
    }

    #[tokio::test]
    async fn test_extraction_without_parse_job_fails() {
        let (extractor, _stub, store, _index, _dir) = harness(StubParser::new()).await;
        let template = store.create_template(invoice_template()).await.unwrap();

        let doc = store
            .create_document(ValidatedFileName::new("inv.pdf").unwrap(), b"bytes")
            .await
            .unwrap();
        store
            .set_document_template(&doc.id, Some(template.id))
            .await
            .unwrap();

        let err = extractor.extract_document(&doc.id).await.unwrap_err();
        assert!(err.to_string().contains("parse job"));
    }

    #[tokio::test]
    async fn test_high_confidence_valid_fields_get_low_priority() {
        let parser = StubParser::new()
            .with_extraction(
                "invoice_total",
                serde_json::json!("5000.00"),
                0.95,
                Some(1),
            )
            .with_extraction("vendor", serde_json::json!("Acme Corp"), 0.92, Some(1));
        let (extractor, stub, store, index, _dir) = harness(parser).await;
        let template = store.create_template(invoice_template()).await.unwrap();

        let bytes = b"Invoice total: $5,000.00\nVendor: Acme Corp";
        let doc_id = prepared_document(&store, stub.as_ref(), &template, bytes).await;

        let fields = extractor.extract_document(&doc_id).await.unwrap();
        for field in &fields {
            assert_eq!(field.validation_status, ValidationStatus::Valid);
            assert_eq!(field.audit_priority, AuditPriority::Low);
        }

        // The index write happened and is idempotent
        let search_doc = index.get_doc(&doc_id).await.unwrap();
        assert_eq!(
            search_doc.fields.get("vendor").map(|s| s.as_str()),
            Some("Acme Corp")
        );
    }
}
