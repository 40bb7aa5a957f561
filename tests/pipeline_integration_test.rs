// End-to-end ingestion tests: the pipelining invariant, the document state
// machine, partial batch failure, and idempotent index writes.

use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use paperdb::testing::StubParser;
use paperdb::{
    build_search_doc, BatchFile, CanonicalRegistry, Clients, DocumentStatus, FieldType, PaperDb,
    SearchIndex, Settings, TemplateBuilder, TemplateKind,
};

const CONTRACT_TEXT: &str = "\
Contract title: Bring Your Own Cloud (BYOC) Services Addendum
Effective date: June 5, 2025
Party a: Pinecone Systems, Inc.
Party b: Example Customer LLC
Termination clause: Either party may terminate with 30 days notice";

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

async fn create_contract_template(db: &PaperDb) -> paperdb::Template {
    let template = TemplateBuilder::new("Contract")
        .unwrap()
        .kind(TemplateKind::Contract)
        .field("contract_title", FieldType::Text)
        .unwrap()
        .field("effective_date", FieldType::Date)
        .unwrap()
        .primary_field("party_a", FieldType::Text)
        .unwrap()
        .primary_field("party_b", FieldType::Text)
        .unwrap()
        .field("termination_clause", FieldType::Text)
        .unwrap()
        .build()
        .unwrap();
    db.create_template(template).await.unwrap()
}

#[tokio::test]
async fn pipelined_extraction_parses_bytes_exactly_once() -> Result<()> {
    let dir = TempDir::new()?;
    let parser = Arc::new(StubParser::new());
    let db = open_db(&dir, parser.clone()).await;
    create_contract_template(&db).await;

    let result = db
        .ingest_batch(vec![BatchFile {
            filename: "contract.pdf".to_string(),
            bytes: CONTRACT_TEXT.as_bytes().to_vec(),
            requested_template_id: None,
        }])
        .await;

    assert!(result.failed.is_empty(), "failures: {:?}", result.failed);
    assert_eq!(result.succeeded[0].status, DocumentStatus::Completed);
    assert_eq!(result.analytics.signature_matches, 1);

    // The parser received the bytes exactly once; every extraction call went
    // through jobid://
    assert_eq!(parser.bytes_parse_count(), 1);
    assert_eq!(parser.bytes_extract_count(), 0);

    let doc_id = result.succeeded[0].document_id;
    let doc = db.store().get_document(&doc_id).await?.unwrap();
    assert!(doc.parse_job_id.is_some());
    assert!(doc.cached_parse.is_some());
    assert!(doc.processed_at.is_some());

    let title = db
        .store()
        .find_field(&doc_id, "contract_title")
        .await?
        .unwrap();
    assert_eq!(
        title.field_value.as_deref(),
        Some("Bring Your Own Cloud (BYOC) Services Addendum")
    );
    assert!(title.confidence.get() >= 0.80);
    Ok(())
}

#[tokio::test]
async fn duplicate_upload_shares_bytes_and_parse() -> Result<()> {
    let dir = TempDir::new()?;
    let parser = Arc::new(StubParser::new());
    let db = open_db(&dir, parser.clone()).await;
    create_contract_template(&db).await;

    let file = BatchFile {
        filename: "contract.pdf".to_string(),
        bytes: CONTRACT_TEXT.as_bytes().to_vec(),
        requested_template_id: None,
    };
    let first = db.ingest_batch(vec![file.clone()]).await;
    let second = db
        .ingest_batch(vec![BatchFile {
            filename: "contract-copy.pdf".to_string(),
            ..file
        }])
        .await;

    let a = first.succeeded[0].document_id;
    let b = second.succeeded[0].document_id;
    assert_ne!(a, b);

    let doc_a = db.store().get_document(&a).await?.unwrap();
    let doc_b = db.store().get_document(&b).await?.unwrap();
    assert_eq!(doc_a.content_hash, doc_b.content_hash);
    // Same bytes: the cached parse is reused, so still exactly one bytes-parse
    assert_eq!(parser.bytes_parse_count(), 1);
    Ok(())
}

#[tokio::test]
async fn batch_failure_is_isolated() -> Result<()> {
    let dir = TempDir::new()?;
    let parser = Arc::new(StubParser::new());
    let db = open_db(&dir, parser).await;
    create_contract_template(&db).await;

    let result = db
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
            BatchFile {
                filename: "also/bad".to_string(),
                bytes: b"content".to_vec(),
                requested_template_id: None,
            },
        ])
        .await;

    assert_eq!(result.succeeded.len(), 1);
    assert_eq!(result.failed.len(), 2);
    assert_eq!(result.succeeded[0].filename, "good.pdf");
    Ok(())
}

#[tokio::test]
async fn failed_document_stays_visible_with_error() -> Result<()> {
    let dir = TempDir::new()?;
    let parser = Arc::new(StubParser::new());
    let db = open_db(&dir, parser).await;
    let template = create_contract_template(&db).await;

    // Request a template that does not exist: the document rows stay behind
    // in error with a message
    let bogus = paperdb::ValidatedTemplateId::new();
    let result = db
        .ingest_batch(vec![BatchFile {
            filename: "doomed.pdf".to_string(),
            bytes: b"some document text".to_vec(),
            requested_template_id: Some(bogus),
        }])
        .await;
    assert_eq!(result.failed.len(), 1);

    let errored = db.list_documents(Some(DocumentStatus::Error)).await?;
    assert_eq!(errored.len(), 1);
    assert!(errored[0].error_message.is_some());

    // The operator can resume it with a real template
    let resumed = db
        .resume_with_template(&errored[0].id, &template.id)
        .await;
    // Resuming needs a cached parse; this document failed before template
    // matching, so it has one and completes
    assert!(resumed.is_ok());
    assert_eq!(resumed.unwrap().status, DocumentStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn reindexing_a_completed_document_is_byte_identical() -> Result<()> {
    let dir = TempDir::new()?;
    let parser = Arc::new(StubParser::new());
    let db = open_db(&dir, parser).await;
    let template = create_contract_template(&db).await;

    let result = db
        .ingest_batch(vec![BatchFile {
            filename: "contract.pdf".to_string(),
            bytes: CONTRACT_TEXT.as_bytes().to_vec(),
            requested_template_id: None,
        }])
        .await;
    let doc_id = result.succeeded[0].document_id;

    // Rebuild the SearchDoc from store state twice; identical bytes
    let settings = Settings::default();
    let registry = CanonicalRegistry::with_defaults();
    let document = db.store().get_document(&doc_id).await?.unwrap();
    let fields = db.store().fields_for_document(&doc_id).await?;

    let first = build_search_doc(
        &document,
        Some(&template),
        &fields,
        &registry,
        &settings.index,
        None,
    );
    let second = build_search_doc(
        &document,
        Some(&template),
        &fields,
        &registry,
        &settings.index,
        None,
    );
    assert_eq!(
        serde_json::to_vec(&first)?,
        serde_json::to_vec(&second)?
    );
    Ok(())
}

#[tokio::test]
async fn signature_reindex_after_template_edit() -> Result<()> {
    let dir = TempDir::new()?;
    let parser = Arc::new(StubParser::new());
    let db = open_db(&dir, parser).await;
    let template = create_contract_template(&db).await;

    let mut edited = template.clone();
    edited.fields.push(paperdb::FieldSpec::new(
        paperdb::ValidatedFieldName::new("renewal_date").unwrap(),
        FieldType::Date,
    ));
    let updated = db.update_template(edited).await?;
    assert_eq!(updated.signature_version, template.signature_version + 1);

    // Within one refresh the new fingerprint is findable
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let search_index: &dyn SearchIndex = db_index(&db);
    let similar = search_index
        .find_similar_templates(&["renewal_date".to_string()], None, 1)
        .await?;
    assert!(!similar.is_empty());
    assert_eq!(similar[0].template_id, template.id);
    Ok(())
}

// Access the hybrid index through the facade for assertions
fn db_index(db: &PaperDb) -> &dyn SearchIndex {
    db.search_index()
}
