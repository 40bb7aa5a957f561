// Audit Queue
// Priority-ordered human review queue over extracted fields. Membership is
// implicit: every unverified field at priority critical..medium is in the
// queue by virtue of its stored priority. Verification outcomes append to the
// field's history and hand back the next item so reviewers stay in flow.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::contracts::{AuditFilter, Document, ExtractedField, Store};
use crate::types::{AuditPriority, ValidatedFieldId, VerificationAction};

/// A queue item with enough document context to review without a second fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldWithContext {
    pub field: ExtractedField,
    pub document_filename: String,
    pub document_status: String,
}

/// Queue size per priority level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl PriorityCounts {
    fn add(&mut self, priority: AuditPriority) {
        match priority {
            AuditPriority::Critical => self.critical += 1,
            AuditPriority::High => self.high += 1,
            AuditPriority::Medium => self.medium += 1,
            AuditPriority::Low => self.low += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low
    }
}

/// One page of the audit queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditPage {
    pub items: Vec<FieldWithContext>,
    pub total: usize,
    pub priority_counts: PriorityCounts,
}

/// Result of recording one verification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub field: ExtractedField,
    pub next_item: Option<FieldWithContext>,
}

pub struct AuditQueue {
    store: Arc<dyn Store>,
}

impl AuditQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// List queue items ordered by (priority asc, confidence asc, newest
    /// first), paginated
    pub async fn list(&self, filter: &AuditFilter, page: usize, size: usize) -> Result<AuditPage> {
        crate::validation::query::validate_limit(size, 500)?;

        // Counts ignore the priority filter so the caller sees the whole
        // queue's shape even when looking at one level
        let count_filter = AuditFilter {
            priority: None,
            template_id: filter.template_id,
            document_id: filter.document_id,
        };
        let all = self.store.list_audit_fields(&count_filter).await?;
        let mut priority_counts = PriorityCounts::default();
        for field in &all {
            priority_counts.add(field.audit_priority);
        }

        let matching: Vec<&ExtractedField> = all
            .iter()
            .filter(|f| {
                filter
                    .priority
                    .map(|p| f.audit_priority == p)
                    .unwrap_or(true)
            })
            .collect();
        let total = matching.len();

        let mut items = Vec::new();
        for field in matching.into_iter().skip(page * size).take(size) {
            let document = self.store.get_document(&field.document_id).await?;
            items.push(Self::with_context(field.clone(), document));
        }

        Ok(AuditPage {
            items,
            total,
            priority_counts,
        })
    }

    fn with_context(field: ExtractedField, document: Option<Document>) -> FieldWithContext {
        let (filename, status) = document
            .map(|d| (d.filename.as_str().to_string(), d.status.to_string()))
            .unwrap_or_default();
        FieldWithContext {
            field,
            document_filename: filename,
            document_status: status,
        }
    }

    /// Record a verification and return the updated field plus the next item
    /// in queue order
    ///
    /// When the verification was reached through a citation's audit link, the
    /// citation id closes the loop: the citation is marked audited and flagged
    /// when a correction was made.
    pub async fn verify(
        &self,
        field_id: &ValidatedFieldId,
        action: VerificationAction,
        corrected_value: Option<String>,
        notes: Option<String>,
        reviewer_id: Option<String>,
        citation_id: Option<Uuid>,
    ) -> Result<VerifyOutcome> {
        let (field, verification) = self
            .store
            .append_verification(field_id, action, corrected_value, notes, reviewer_id)
            .await?;

        if let Some(citation_id) = citation_id {
            self.store
                .mark_citation_audited(citation_id, action == VerificationAction::Incorrect)
                .await?;
        }

        info!(
            field_id = %field_id,
            action = ?verification.action,
            "Verification recorded"
        );

        let next_item = self
            .list(&AuditFilter::default(), 0, 1)
            .await?
            .items
            .into_iter()
            .next();
        Ok(VerifyOutcome { field, next_item })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::FileStore;
    use crate::pure::compute_audit_priority;
    use crate::types::{
        Confidence, FieldType, ValidatedFieldName, ValidatedFileName, ValidationStatus,
    };
    use crate::contracts::ExtractedField;
    use tempfile::TempDir;

    async fn seed_queue() -> (AuditQueue, Arc<FileStore>, Vec<ExtractedField>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(dir.path().to_str().unwrap()).await.unwrap());
        let doc = store
            .create_document(ValidatedFileName::new("inv.pdf").unwrap(), b"bytes")
            .await
            .unwrap();

        // (name, confidence, validation) spanning all priorities
        let specs = [
            ("critical_field", 0.30, ValidationStatus::Error),
            ("high_field", 0.92, ValidationStatus::Error),
            ("medium_field", 0.75, ValidationStatus::Warning),
            ("low_field", 0.95, ValidationStatus::Valid),
            ("second_critical", 0.10, ValidationStatus::Error),
        ];
        let mut fields = Vec::new();
        for (name, confidence, status) in specs {
            let mut field = ExtractedField::new(
                doc.id,
                ValidatedFieldName::new(name).unwrap(),
                FieldType::Text,
                Some("value".to_string()),
                None,
                Confidence::new(confidence).unwrap(),
                Some(1),
                None,
            )
            .unwrap();
            field.validation_status = status;
            field.audit_priority = compute_audit_priority(confidence, status, 0.60, 0.85);
            fields.push(field);
        }
        let stored = store.upsert_extracted_fields(&doc.id, fields).await.unwrap();
        (AuditQueue::new(store.clone()), store, stored, dir)
    }

    #[tokio::test]
    async fn test_queue_ordering_and_counts() {
        let (queue, _store, _fields, _dir) = seed_queue().await;

        let page = queue.list(&AuditFilter::default(), 0, 10).await.unwrap();
        // Low-priority fields are not in the queue
        assert_eq!(page.total, 4);
        assert_eq!(page.priority_counts.critical, 2);
        assert_eq!(page.priority_counts.high, 1);
        assert_eq!(page.priority_counts.medium, 1);
        assert_eq!(page.priority_counts.low, 0);

        // Priority ascending, then least-confident first
        let names: Vec<&str> = page
            .items
            .iter()
            .map(|i| i.field.field_name.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["second_critical", "critical_field", "high_field", "medium_field"]
        );
        assert_eq!(page.items[0].document_filename, "inv.pdf");
    }

    #[tokio::test]
    async fn test_priority_filter_and_pagination() {
        let (queue, _store, _fields, _dir) = seed_queue().await;

        let filter = AuditFilter {
            priority: Some(AuditPriority::Critical),
            ..AuditFilter::default()
        };
        let page = queue.list(&filter, 0, 1).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].field.field_name.as_str(), "second_critical");
        // Counts still describe the whole queue
        assert_eq!(page.priority_counts.total(), 4);

        let second = queue.list(&filter, 1, 1).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].field.field_name.as_str(), "critical_field");
    }

    #[tokio::test]
    async fn test_verify_dequeues_and_returns_next() {
        let (queue, store, fields, _dir) = seed_queue().await;
        let worst = fields
            .iter()
            .find(|f| f.field_name.as_str() == "second_critical")
            .unwrap();

        let outcome = queue
            .verify(
                &worst.id,
                VerificationAction::Incorrect,
                Some("$2,100.00".to_string()),
                Some("decimal misread".to_string()),
                Some("reviewer-7".to_string()),
                None,
            )
            .await
            .unwrap();

        assert!(outcome.field.verified);
        assert_eq!(outcome.field.verified_value.as_deref(), Some("$2,100.00"));
        // The verified field left the queue; the next-worst item comes back
        let next = outcome.next_item.expect("next item");
        assert_eq!(next.field.field_name.as_str(), "critical_field");

        // History is recorded
        let history = store.verifications_for_field(&worst.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reviewer_id.as_deref(), Some("reviewer-7"));
    }

    #[tokio::test]
    async fn test_incorrect_requires_corrected_value() {
        let (queue, _store, fields, _dir) = seed_queue().await;
        let result = queue
            .verify(
                &fields[0].id,
                VerificationAction::Incorrect,
                None,
                None,
                None,
                None,
            )
            .await;
        assert!(result.is_err());
    }
}
