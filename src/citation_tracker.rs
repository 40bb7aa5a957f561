// Citation Tracker
// Resolves the inline field-reference markers a generated answer carries
// ([[FIELD:<name>:<document_id>]]) back to extracted fields, records a
// citation row per marker, and flags low-confidence unverified fields with
// the identifiers an audit link is built from.

use anyhow::Result;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::contracts::{AuditLink, Citation, Store};
use crate::pure::snippet_window;
use crate::types::{QuerySource, ValidatedDocumentId};

static MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\[FIELD:([A-Za-z0-9_][A-Za-z0-9_ -]*):([0-9a-fA-F-]{36})\]\]")
        .expect("Invalid marker pattern")
});

/// Radius of answer context captured around each marker
const CONTEXT_RADIUS: usize = 100;

/// A marker parsed out of an answer
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMarker {
    pub field_name: String,
    pub document_id: ValidatedDocumentId,
    pub start: usize,
    pub end: usize,
}

/// A recorded citation plus the verification flags answer consumers need
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedCitation {
    pub citation: Citation,
    pub verified: bool,
    pub needs_audit: bool,
}

pub struct CitationTracker {
    store: Arc<dyn Store>,
    review_threshold: f64,
}

impl CitationTracker {
    pub fn new(store: Arc<dyn Store>, review_threshold: f64) -> Self {
        Self {
            store,
            review_threshold,
        }
    }

    /// Parse all markers in an answer
    pub fn extract_markers(answer: &str) -> Vec<FieldMarker> {
        MARKER
            .captures_iter(answer)
            .filter_map(|captures| {
                let full = captures.get(0)?;
                let field_name = captures.get(1)?.as_str().to_string();
                let document_id = ValidatedDocumentId::parse(captures.get(2)?.as_str()).ok()?;
                Some(FieldMarker {
                    field_name,
                    document_id,
                    start: full.start(),
                    end: full.end(),
                })
            })
            .collect()
    }

    pub fn has_markers(answer: &str) -> bool {
        MARKER.is_match(answer)
    }

    /// Resolve every marker, append citation rows, and bump field counters
    ///
    /// Returns the annotated citations and the count of markers that did not
    /// resolve to a stored field (answer-consistency violations).
    pub async fn process_answer(
        &self,
        answer: &str,
        query_id: Uuid,
        query_text: &str,
        query_source: QuerySource,
    ) -> Result<(Vec<AnnotatedCitation>, usize)> {
        let markers = Self::extract_markers(answer);
        let mut citations = Vec::with_capacity(markers.len());
        let mut unresolved = 0;

        for marker in markers {
            let field = match self
                .store
                .find_field(&marker.document_id, &marker.field_name)
                .await?
            {
                Some(field) => field,
                None => {
                    unresolved += 1;
                    warn!(
                        field = %marker.field_name,
                        doc_id = %marker.document_id,
                        "Answer cited a field that does not exist"
                    );
                    continue;
                }
            };

            let context_snippet =
                snippet_window(answer, marker.start, marker.end, CONTEXT_RADIUS);

            // Low-confidence unverified fields get the identifiers the
            // front-end builds an audit link from
            let needs_audit =
                field.confidence.needs_review(self.review_threshold) && !field.verified;
            let audit_link = needs_audit.then(|| AuditLink {
                field_id: field.id,
                document_id: field.document_id,
            });

            let citation = Citation {
                id: Uuid::new_v4(),
                field_id: field.id,
                document_id: field.document_id,
                query_id,
                query_text: query_text.to_string(),
                query_source,
                confidence_at_citation: field.confidence,
                context_snippet,
                audit_link,
                audit_link_clicked: false,
                correction_made: false,
                created_at: Utc::now(),
            };
            let recorded = self.store.record_citation(citation).await?;
            debug!(
                field = %marker.field_name,
                doc_id = %marker.document_id,
                needs_audit,
                "Citation recorded"
            );
            citations.push(AnnotatedCitation {
                citation: recorded,
                verified: field.verified,
                needs_audit,
            });
        }

        Ok((citations, unresolved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::ExtractedField;
    use crate::file_store::FileStore;
    use crate::types::{Confidence, FieldType, ValidatedFieldName, ValidatedFileName};
    use tempfile::TempDir;

    async fn store_with_field(confidence: f64) -> (Arc<FileStore>, ExtractedField, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(dir.path().to_str().unwrap()).await.unwrap());
        let doc = store
            .create_document(ValidatedFileName::new("inv.pdf").unwrap(), b"bytes")
            .await
            .unwrap();
        let field = ExtractedField::new(
            doc.id,
            ValidatedFieldName::new("invoice_total").unwrap(),
            FieldType::Number,
            Some("1500.00".to_string()),
            None,
            Confidence::new(confidence).unwrap(),
            Some(1),
            None,
        )
        .unwrap();
        let stored = store
            .upsert_extracted_fields(&doc.id, vec![field])
            .await
            .unwrap();
        (store, stored.into_iter().next().unwrap(), dir)
    }

    #[test]
    fn test_marker_extraction() {
        let doc_id = ValidatedDocumentId::new();
        let answer = format!(
            "The total was $1,500.00 [[FIELD:invoice_total:{doc_id}]] due last month."
        );
        let markers = CitationTracker::extract_markers(&answer);
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].field_name, "invoice_total");
        assert_eq!(markers[0].document_id, doc_id);

        assert!(!CitationTracker::has_markers("no markers here"));
        // Malformed ids do not parse as markers
        assert!(CitationTracker::extract_markers("[[FIELD:total:not-a-uuid-here]]").is_empty());
    }

    #[tokio::test]
    async fn test_low_confidence_citation_carries_audit_link() {
        let (store, field, _dir) = store_with_field(0.58).await;
        let tracker = CitationTracker::new(store.clone(), 0.60);

        let answer = format!(
            "The invoice total is $1,500.00 [[FIELD:invoice_total:{}]].",
            field.document_id
        );
        let (citations, unresolved) = tracker
            .process_answer(&answer, Uuid::new_v4(), "what was the total", QuerySource::AskAi)
            .await
            .unwrap();

        assert_eq!(unresolved, 0);
        assert_eq!(citations.len(), 1);
        assert!(citations[0].needs_audit);
        let link = citations[0].citation.audit_link.as_ref().expect("audit link");
        assert_eq!(link.field_id, field.id);
        assert_eq!(link.document_id, field.document_id);

        // Counter and snippet side effects
        let refreshed = store.get_field(&field.id).await.unwrap().unwrap();
        assert_eq!(refreshed.citation_count, 1);
        assert!(refreshed.last_cited_at.is_some());
        assert!(citations[0].citation.context_snippet.contains("invoice total"));
    }

    #[tokio::test]
    async fn test_confident_citation_has_no_audit_link() {
        let (store, field, _dir) = store_with_field(0.90).await;
        let tracker = CitationTracker::new(store, 0.60);

        let answer = format!("Total: [[FIELD:invoice_total:{}]]", field.document_id);
        let (citations, _) = tracker
            .process_answer(&answer, Uuid::new_v4(), "total?", QuerySource::McpRag)
            .await
            .unwrap();
        assert!(!citations[0].needs_audit);
        assert!(citations[0].citation.audit_link.is_none());
    }

    #[tokio::test]
    async fn test_boundary_confidence_does_not_need_audit() {
        // Exactly at the review threshold: strict less-than, so no audit link
        let (store, field, _dir) = store_with_field(0.60).await;
        let tracker = CitationTracker::new(store, 0.60);

        let answer = format!("Total: [[FIELD:invoice_total:{}]]", field.document_id);
        let (citations, _) = tracker
            .process_answer(&answer, Uuid::new_v4(), "total?", QuerySource::AskAi)
            .await
            .unwrap();
        assert!(!citations[0].needs_audit);
    }

    #[tokio::test]
    async fn test_unresolved_marker_counted() {
        let (store, field, _dir) = store_with_field(0.90).await;
        let tracker = CitationTracker::new(store, 0.60);

        let answer = format!(
            "Good: [[FIELD:invoice_total:{}]] Bad: [[FIELD:ghost_field:{}]]",
            field.document_id, field.document_id
        );
        let (citations, unresolved) = tracker
            .process_answer(&answer, Uuid::new_v4(), "q", QuerySource::AskAi)
            .await
            .unwrap();
        assert_eq!(citations.len(), 1);
        assert_eq!(unresolved, 1);
    }
}
