// Audit-queue and citation-feedback tests: severity promotion into the queue,
// the low-confidence citation loop, and cache invalidation on verification.

use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use paperdb::testing::StubParser;
use paperdb::{
    AuditFilter, AuditPriority, BatchFile, Clients, FieldType, PaperDb, QueryRequest,
    TemplateBuilder, TemplateKind, ValidationStatus, VerificationAction,
};

async fn open_db(dir: &TempDir, parser: Arc<StubParser>) -> PaperDb {
    PaperDb::open(
        dir.path().to_str().unwrap(),
        Clients {
            parser,
            llm: None,
            embedder: None,
        },
    )
    .await
    .unwrap()
}

async fn invoice_template(db: &PaperDb) -> paperdb::Template {
    let template = TemplateBuilder::new("Invoice")
        .unwrap()
        .kind(TemplateKind::Invoice)
        .primary_field("total_amount", FieldType::Number)
        .unwrap()
        .primary_field("vendor", FieldType::Text)
        .unwrap()
        .build()
        .unwrap();
    db.create_template(template).await.unwrap()
}

#[tokio::test]
async fn confident_rule_violation_lands_high_in_queue() -> Result<()> {
    let dir = TempDir::new()?;
    // Extractor is sure about a negative total: confident AND wrong
    let parser = Arc::new(
        StubParser::new()
            .with_extraction("total_amount", serde_json::json!("-500.00"), 0.92, Some(1))
            .with_extraction("vendor", serde_json::json!("Initech"), 0.95, Some(1)),
    );
    let db = open_db(&dir, parser).await;
    let template = invoice_template(&db).await;

    let result = db
        .ingest_batch(vec![BatchFile {
            filename: "inv.pdf".to_string(),
            bytes: b"Total amount: -500.00\nVendor: Initech".to_vec(),
            requested_template_id: Some(template.id),
        }])
        .await;
    assert!(result.failed.is_empty());
    let doc_id = result.succeeded[0].document_id;

    let total = db.store().find_field(&doc_id, "total_amount").await?.unwrap();
    assert_eq!(total.validation_status, ValidationStatus::Error);
    assert_eq!(total.audit_priority, AuditPriority::High);

    // It shows up when listing the high-priority slice of the queue
    let filter = AuditFilter {
        priority: Some(AuditPriority::High),
        ..AuditFilter::default()
    };
    let page = db.audit_list(&filter, 0, 10).await?;
    assert!(page
        .items
        .iter()
        .any(|item| item.field.field_name.as_str() == "total_amount"));
    // The confident, valid vendor field stays out of the queue
    assert!(!page
        .items
        .iter()
        .any(|item| item.field.field_name.as_str() == "vendor"));
    Ok(())
}

#[tokio::test]
async fn citation_feedback_loop_corrects_future_answers() -> Result<()> {
    let dir = TempDir::new()?;
    // Low-confidence extraction: below the review threshold
    let parser = Arc::new(
        StubParser::new()
            .with_extraction("total_amount", serde_json::json!("1500.00"), 0.58, Some(1))
            .with_extraction("vendor", serde_json::json!("Initech"), 0.90, Some(1)),
    );
    let db = open_db(&dir, parser).await;
    let template = invoice_template(&db).await;

    db.ingest_batch(vec![BatchFile {
        filename: "inv.pdf".to_string(),
        bytes: b"Total amount: 1500.00\nVendor: Initech".to_vec(),
        requested_template_id: Some(template.id),
    }])
    .await;

    // First ask: the citation on the shaky field carries an audit link
    let first = db.ask(QueryRequest::new("initech total")).await?;
    assert!(!first.citations.is_empty());
    let shaky = first
        .citations
        .iter()
        .find(|c| c.needs_audit)
        .expect("low-confidence citation");
    assert!(shaky.citation.audit_link.is_some());
    assert!(first.audit_recommended);
    assert!(first.low_confidence_count >= 1);

    // Same query again hits the cache
    let cached = db.ask(QueryRequest::new("initech total")).await?;
    assert!(cached.plan_diagnostics.cache_hit);

    // Human review: the value was wrong
    let outcome = db
        .verify(
            &shaky.citation.field_id,
            VerificationAction::Incorrect,
            Some("$2,100.00".to_string()),
            Some("decimal misread".to_string()),
            Some("reviewer-1".to_string()),
            Some(shaky.citation.id),
        )
        .await?;
    assert!(outcome.field.verified);
    assert_eq!(outcome.field.verified_value.as_deref(), Some("$2,100.00"));

    // The originating citation closed its loop
    let citations = db
        .store()
        .citations_for_field(&shaky.citation.field_id)
        .await?;
    assert!(citations[0].audit_link_clicked);
    assert!(citations[0].correction_made);

    // The identical query re-executes (generation bumped) and the corrected
    // value flows into the new answer with a clean citation
    let after = db.ask(QueryRequest::new("initech total")).await?;
    assert!(!after.plan_diagnostics.cache_hit);
    assert!(after.answer.contains("2,100.00"));
    let corrected = after
        .citations
        .iter()
        .find(|c| c.citation.field_id == shaky.citation.field_id)
        .expect("corrected field cited again");
    assert!(corrected.verified);
    assert!(!corrected.needs_audit);
    Ok(())
}

#[tokio::test]
async fn verifying_correct_only_sets_verification_fields() -> Result<()> {
    let dir = TempDir::new()?;
    let parser = Arc::new(
        StubParser::new()
            .with_extraction("total_amount", serde_json::json!("800.00"), 0.70, Some(1))
            .with_extraction("vendor", serde_json::json!("Globex"), 0.72, Some(1)),
    );
    let db = open_db(&dir, parser).await;
    let template = invoice_template(&db).await;

    let result = db
        .ingest_batch(vec![BatchFile {
            filename: "inv.pdf".to_string(),
            bytes: b"Total amount: 800.00\nVendor: Globex".to_vec(),
            requested_template_id: Some(template.id),
        }])
        .await;
    let doc_id = result.succeeded[0].document_id;
    let before = db.store().find_field(&doc_id, "vendor").await?.unwrap();

    let outcome = db
        .verify(
            &before.id,
            VerificationAction::Correct,
            None,
            None,
            None,
            None,
        )
        .await?;

    let after = outcome.field;
    assert!(after.verified);
    assert!(after.verified_at.is_some());
    // Everything else is untouched
    assert_eq!(after.field_value, before.field_value);
    assert_eq!(after.verified_value, None);
    assert_eq!(after.confidence, before.confidence);
    assert_eq!(after.validation_status, before.validation_status);
    assert_eq!(after.audit_priority, before.audit_priority);
    Ok(())
}

#[tokio::test]
async fn verified_fields_leave_the_queue() -> Result<()> {
    let dir = TempDir::new()?;
    let parser = Arc::new(
        StubParser::new()
            .with_extraction("total_amount", serde_json::json!("900.00"), 0.40, Some(1))
            .with_extraction("vendor", serde_json::json!("Initech"), 0.45, Some(1)),
    );
    let db = open_db(&dir, parser).await;
    let template = invoice_template(&db).await;

    db.ingest_batch(vec![BatchFile {
        filename: "inv.pdf".to_string(),
        bytes: b"Total amount: 900.00\nVendor: Initech".to_vec(),
        requested_template_id: Some(template.id),
    }])
    .await;

    let page = db.audit_list(&AuditFilter::default(), 0, 10).await?;
    let initial_total = page.total;
    assert!(initial_total >= 2);

    // Verify the worst item; the next-item pointer advances and the queue
    // shrinks by one
    let worst = page.items[0].field.clone();
    let outcome = db
        .verify(
            &worst.id,
            VerificationAction::Correct,
            None,
            None,
            None,
            None,
        )
        .await?;
    assert!(outcome.next_item.is_some());
    assert_ne!(outcome.next_item.unwrap().field.id, worst.id);

    let page = db.audit_list(&AuditFilter::default(), 0, 10).await?;
    assert_eq!(page.total, initial_total - 1);
    Ok(())
}
