// File-based Store Implementation
// Authoritative persistence for documents, templates, extracted fields,
// verifications, and citations. JSON metadata per entity with an in-memory
// map for fast lookups; verifications and citations are append-only logs
// replayed on open.

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::contracts::{
    AuditFilter, Citation, Document, ExtractedField, ParsedDocument, PhysicalFile, Store, Template,
    Verification,
};
use crate::types::{
    ContentHash, DocumentStatus, ValidatedDocumentId, ValidatedFieldId, ValidatedFileName,
    ValidatedTemplateId, VerificationAction,
};

/// File-backed store
///
/// Directory layout:
/// ```text
/// <root>/files/<hash>.bin            uploaded bytes, one file per hash
/// <root>/files/<template>/<hash>.bin after template-folder reorganization
/// <root>/documents/<id>.json         document rows (incl. cached parse)
/// <root>/templates/<id>.json         template definitions
/// <root>/fields/<doc_id>.json        full field set per document
/// <root>/logs/verifications.jsonl    append-only verification log
/// <root>/logs/citations.jsonl        append-only citation log
/// ```
///
/// Every mutation holds the single write lock for its whole critical section
/// and persists via write-to-temp + rename, so readers never observe a
/// partially-applied multi-row operation.
pub struct FileStore {
    db_path: PathBuf,
    state: RwLock<StoreState>,
    /// Bumped by field-value mutations; query-cache keys include it
    fields_generation: AtomicU64,
}

#[derive(Default)]
struct StoreState {
    physical_files: HashMap<ContentHash, PhysicalFile>,
    documents: HashMap<ValidatedDocumentId, Document>,
    templates: HashMap<ValidatedTemplateId, Template>,
    fields: HashMap<ValidatedFieldId, ExtractedField>,
    fields_by_document: HashMap<ValidatedDocumentId, Vec<ValidatedFieldId>>,
    verifications: HashMap<ValidatedFieldId, Vec<Verification>>,
    citations: HashMap<Uuid, Citation>,
    citations_by_field: HashMap<ValidatedFieldId, Vec<Uuid>>,
}

/// Entries in the append-only citation log
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
enum CitationLogEntry {
    Created(Citation),
    Audited { id: Uuid, correction_made: bool },
}

/// Serialized bundle for the per-document fields file
#[derive(Debug, Serialize, Deserialize)]
struct FieldsFile {
    document_id: ValidatedDocumentId,
    fields: Vec<ExtractedField>,
}

impl FileStore {
    /// Open (or initialize) a store rooted at `path`
    pub async fn open(path: &str) -> Result<Self> {
        crate::validation::file::validate_store_directory(path)?;

        let store = Self {
            db_path: PathBuf::from(path),
            state: RwLock::new(StoreState::default()),
            fields_generation: AtomicU64::new(0),
        };
        store.ensure_directories().await?;
        store.load_existing().await?;
        Ok(store)
    }

    async fn ensure_directories(&self) -> Result<()> {
        let paths = [
            self.db_path.join("files"),
            self.db_path.join("documents"),
            self.db_path.join("templates"),
            self.db_path.join("fields"),
            self.db_path.join("logs"),
        ];
        for path in &paths {
            fs::create_dir_all(path)
                .await
                .with_context(|| format!("Failed to create directory: {}", path.display()))?;
        }
        Ok(())
    }

    async fn load_existing(&self) -> Result<()> {
        let mut state = self.state.write().await;

        Self::load_json_dir(&self.db_path.join("templates"), |t: Template| {
            state.templates.insert(t.id, t);
        })
        .await?;

        Self::load_json_dir(&self.db_path.join("documents"), |d: Document| {
            state
                .physical_files
                .entry(d.content_hash)
                .or_insert_with(|| PhysicalFile {
                    hash: d.content_hash,
                    storage_path: d.actual_file_path.clone(),
                    size: 0,
                    uploaded_at: d.created_at,
                });
            state.documents.insert(d.id, d);
        })
        .await?;

        Self::load_json_dir(&self.db_path.join("fields"), |bundle: FieldsFile| {
            let mut ids = Vec::with_capacity(bundle.fields.len());
            for field in bundle.fields {
                ids.push(field.id);
                state.fields.insert(field.id, field);
            }
            state.fields_by_document.insert(bundle.document_id, ids);
        })
        .await?;

        // Replay append-only logs
        let verifications_log = self.db_path.join("logs").join("verifications.jsonl");
        if verifications_log.exists() {
            let raw = fs::read_to_string(&verifications_log).await?;
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                let verification: Verification = serde_json::from_str(line)
                    .with_context(|| "Corrupt verification log entry")?;
                state
                    .verifications
                    .entry(verification.field_id)
                    .or_default()
                    .push(verification);
            }
        }

        let citations_log = self.db_path.join("logs").join("citations.jsonl");
        if citations_log.exists() {
            let raw = fs::read_to_string(&citations_log).await?;
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                let entry: CitationLogEntry =
                    serde_json::from_str(line).with_context(|| "Corrupt citation log entry")?;
                match entry {
                    CitationLogEntry::Created(citation) => {
                        state
                            .citations_by_field
                            .entry(citation.field_id)
                            .or_default()
                            .push(citation.id);
                        state.citations.insert(citation.id, citation);
                    }
                    CitationLogEntry::Audited {
                        id,
                        correction_made,
                    } => {
                        if let Some(citation) = state.citations.get_mut(&id) {
                            citation.audit_link_clicked = true;
                            citation.correction_made = correction_made;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn load_json_dir<T, F>(dir: &Path, mut apply: F) -> Result<()>
    where
        T: serde::de::DeserializeOwned,
        F: FnMut(T),
    {
        if !dir.exists() {
            return Ok(());
        }
        let mut entries = fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path).await?;
            match serde_json::from_str::<T>(&raw) {
                Ok(value) => apply(value),
                Err(e) => {
                    tracing::warn!("Skipping corrupt store file {}: {}", path.display(), e);
                }
            }
        }
        Ok(())
    }

    /// Write JSON atomically: temp file in the same directory, then rename
    async fn write_json_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let raw = serde_json::to_string_pretty(value).context("Failed to serialize store row")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, raw.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to move {} into place", path.display()))?;
        Ok(())
    }

    async fn append_log_line<T: Serialize>(&self, log: &str, value: &T) -> Result<()> {
        let path = self.db_path.join("logs").join(log);
        let mut line = serde_json::to_string(value).context("Failed to serialize log entry")?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open log: {}", path.display()))?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    fn document_row_path(&self, id: &ValidatedDocumentId) -> PathBuf {
        self.db_path
            .join("documents")
            .join(format!("{}.json", id.as_uuid()))
    }

    fn template_row_path(&self, id: &ValidatedTemplateId) -> PathBuf {
        self.db_path
            .join("templates")
            .join(format!("{}.json", id.as_uuid()))
    }

    fn fields_row_path(&self, id: &ValidatedDocumentId) -> PathBuf {
        self.db_path
            .join("fields")
            .join(format!("{}.json", id.as_uuid()))
    }

    async fn persist_document(&self, doc: &Document) -> Result<()> {
        self.write_json_atomic(&self.document_row_path(&doc.id), doc)
            .await
    }

    async fn persist_fields(
        &self,
        document_id: &ValidatedDocumentId,
        fields: &[ExtractedField],
    ) -> Result<()> {
        let bundle = FieldsFile {
            document_id: *document_id,
            fields: fields.to_vec(),
        };
        self.write_json_atomic(&self.fields_row_path(document_id), &bundle)
            .await
    }

    fn bump_generation(&self) {
        self.fields_generation.fetch_add(1, Ordering::SeqCst);
    }

    fn sanitize_folder_name(name: &str) -> String {
        name.chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

#[async_trait]
impl Store for FileStore {
    async fn create_document(
        &self,
        filename: ValidatedFileName,
        bytes: &[u8],
    ) -> Result<Document> {
        ensure!(!bytes.is_empty(), "Uploaded file is empty");

        let hash = ContentHash::of_bytes(bytes);
        let mut state = self.state.write().await;

        // Deduplicate the physical file by content hash; a repeat upload gets
        // a fresh document row over the already-stored bytes.
        let physical = match state.physical_files.get(&hash) {
            Some(existing) => existing.clone(),
            None => {
                let path = self
                    .db_path
                    .join("files")
                    .join(format!("{}.bin", hash.to_hex()));
                fs::write(&path, bytes)
                    .await
                    .with_context(|| format!("Failed to store file: {}", path.display()))?;
                let physical = PhysicalFile {
                    hash,
                    storage_path: path.to_string_lossy().to_string(),
                    size: bytes.len() as u64,
                    uploaded_at: Utc::now(),
                };
                state.physical_files.insert(hash, physical.clone());
                physical
            }
        };

        let document = Document {
            id: ValidatedDocumentId::new(),
            filename,
            content_hash: hash,
            status: DocumentStatus::Uploaded,
            template_id: None,
            parse_job_id: None,
            cached_parse: None,
            actual_file_path: physical.storage_path.clone(),
            error_message: None,
            created_at: Utc::now(),
            processed_at: None,
        };

        self.persist_document(&document).await?;
        state.documents.insert(document.id, document.clone());
        Ok(document)
    }

    async fn get_document(&self, id: &ValidatedDocumentId) -> Result<Option<Document>> {
        let state = self.state.read().await;
        Ok(state.documents.get(id).cloned())
    }

    async fn list_documents(&self, status: Option<DocumentStatus>) -> Result<Vec<Document>> {
        let state = self.state.read().await;
        let mut docs: Vec<Document> = state
            .documents
            .values()
            .filter(|d| status.map(|s| d.status == s).unwrap_or(true))
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(docs)
    }

    async fn update_document_status(
        &self,
        id: &ValidatedDocumentId,
        status: DocumentStatus,
        error: Option<String>,
    ) -> Result<Document> {
        let mut state = self.state.write().await;
        let doc = state
            .documents
            .get_mut(id)
            .with_context(|| format!("Document not found: {id}"))?;

        // Re-applying the current status is a no-op so retried pipeline steps
        // stay idempotent.
        if doc.status != status {
            ensure!(
                doc.status.can_transition_to(status),
                "Illegal status transition for {}: {} -> {}",
                id,
                doc.status,
                status
            );
            doc.status = status;
        }
        match status {
            DocumentStatus::Completed => {
                doc.processed_at = Some(Utc::now());
                doc.error_message = None;
            }
            DocumentStatus::Error => {
                if let Some(message) = error {
                    doc.error_message = Some(message);
                }
            }
            _ => {}
        }

        let updated = doc.clone();
        self.persist_document(&updated).await?;
        Ok(updated)
    }

    async fn set_document_template(
        &self,
        id: &ValidatedDocumentId,
        template_id: Option<ValidatedTemplateId>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(tid) = &template_id {
            ensure!(
                state.templates.contains_key(tid),
                "Unknown template: {tid}"
            );
        }
        let doc = state
            .documents
            .get_mut(id)
            .with_context(|| format!("Document not found: {id}"))?;
        doc.template_id = template_id;
        let updated = doc.clone();
        self.persist_document(&updated).await?;
        Ok(())
    }

    async fn cache_parse_result(
        &self,
        id: &ValidatedDocumentId,
        job_id: &str,
        parsed: ParsedDocument,
    ) -> Result<()> {
        ensure!(!job_id.is_empty(), "Parse job id cannot be empty");
        let mut state = self.state.write().await;
        let doc = state
            .documents
            .get_mut(id)
            .with_context(|| format!("Document not found: {id}"))?;
        doc.parse_job_id = Some(job_id.to_string());
        doc.cached_parse = Some(parsed);
        let updated = doc.clone();
        self.persist_document(&updated).await?;
        Ok(())
    }

    async fn relocate_document_file(
        &self,
        id: &ValidatedDocumentId,
        template_name: &str,
    ) -> Result<String> {
        let mut state = self.state.write().await;
        let doc = state
            .documents
            .get(id)
            .with_context(|| format!("Document not found: {id}"))?
            .clone();

        let folder = Self::sanitize_folder_name(template_name);
        let target_dir = self.db_path.join("files").join(&folder);
        fs::create_dir_all(&target_dir).await?;
        let target = target_dir.join(format!("{}.bin", doc.content_hash.to_hex()));
        let target_str = target.to_string_lossy().to_string();

        let physical = state
            .physical_files
            .get_mut(&doc.content_hash)
            .with_context(|| format!("Physical file missing for {}", doc.content_hash))?;

        if physical.storage_path != target_str {
            fs::rename(&physical.storage_path, &target)
                .await
                .with_context(|| {
                    format!("Failed to move {} to {}", physical.storage_path, target_str)
                })?;
            physical.storage_path = target_str.clone();
        }

        // Every document backed by this hash sees the new location
        let sharing: Vec<ValidatedDocumentId> = state
            .documents
            .values()
            .filter(|d| d.content_hash == doc.content_hash)
            .map(|d| d.id)
            .collect();
        for doc_id in sharing {
            if let Some(d) = state.documents.get_mut(&doc_id) {
                d.actual_file_path = target_str.clone();
                let updated = d.clone();
                self.persist_document(&updated).await?;
            }
        }
        Ok(target_str)
    }

    async fn get_physical_file(&self, hash: &ContentHash) -> Result<Option<PhysicalFile>> {
        let state = self.state.read().await;
        Ok(state.physical_files.get(hash).cloned())
    }

    async fn create_template(&self, template: Template) -> Result<Template> {
        let mut state = self.state.write().await;
        ensure!(
            !state.templates.contains_key(&template.id),
            "Template already exists: {}",
            template.id
        );
        ensure!(
            !state
                .templates
                .values()
                .any(|t| t.name.as_str() == template.name.as_str()),
            "Template name already in use: {}",
            template.name
        );
        self.write_json_atomic(&self.template_row_path(&template.id), &template)
            .await?;
        state.templates.insert(template.id, template.clone());
        Ok(template)
    }

    async fn get_template(&self, id: &ValidatedTemplateId) -> Result<Option<Template>> {
        let state = self.state.read().await;
        Ok(state.templates.get(id).cloned())
    }

    async fn list_templates(&self) -> Result<Vec<Template>> {
        let state = self.state.read().await;
        let mut templates: Vec<Template> = state.templates.values().cloned().collect();
        templates.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
        Ok(templates)
    }

    async fn update_template(&self, mut template: Template) -> Result<Template> {
        let mut state = self.state.write().await;
        let existing = state
            .templates
            .get(&template.id)
            .with_context(|| format!("Template not found: {}", template.id))?;

        // Every edit bumps the signature version; the caller re-indexes the
        // fingerprint. Existing documents keep their extracted fields.
        template.signature_version = existing.signature_version + 1;
        template.created_at = existing.created_at;
        template.updated_at = Utc::now();

        self.write_json_atomic(&self.template_row_path(&template.id), &template)
            .await?;
        state.templates.insert(template.id, template.clone());
        Ok(template)
    }

    async fn upsert_extracted_fields(
        &self,
        document_id: &ValidatedDocumentId,
        mut fields: Vec<ExtractedField>,
    ) -> Result<Vec<ExtractedField>> {
        for field in &fields {
            ensure!(
                field.document_id == *document_id,
                "Field {} belongs to a different document",
                field.field_name
            );
        }

        let mut state = self.state.write().await;
        ensure!(
            state.documents.contains_key(document_id),
            "Document not found: {document_id}"
        );

        // Carry identity and verification history across the replacement so
        // verifications and citations keep pointing at a live row.
        let old_ids = state
            .fields_by_document
            .get(document_id)
            .cloned()
            .unwrap_or_default();
        let old_by_name: HashMap<String, ExtractedField> = old_ids
            .iter()
            .filter_map(|id| state.fields.get(id))
            .map(|f| (f.field_name.as_str().to_string(), f.clone()))
            .collect();

        for field in &mut fields {
            if let Some(old) = old_by_name.get(field.field_name.as_str()) {
                field.id = old.id;
                field.created_at = old.created_at;
                field.citation_count = old.citation_count;
                field.last_cited_at = old.last_cited_at;
                if old.verified {
                    field.verified = true;
                    field.verified_value = old.verified_value.clone();
                    field.verified_at = old.verified_at;
                }
            }
        }

        self.persist_fields(document_id, &fields).await?;

        for id in old_ids {
            state.fields.remove(&id);
        }
        let mut new_ids = Vec::with_capacity(fields.len());
        for field in &fields {
            new_ids.push(field.id);
            state.fields.insert(field.id, field.clone());
        }
        state.fields_by_document.insert(*document_id, new_ids);

        self.bump_generation();
        Ok(fields)
    }

    async fn fields_for_document(
        &self,
        document_id: &ValidatedDocumentId,
    ) -> Result<Vec<ExtractedField>> {
        let state = self.state.read().await;
        let ids = state
            .fields_by_document
            .get(document_id)
            .cloned()
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| state.fields.get(id))
            .cloned()
            .collect())
    }

    async fn get_field(&self, id: &ValidatedFieldId) -> Result<Option<ExtractedField>> {
        let state = self.state.read().await;
        Ok(state.fields.get(id).cloned())
    }

    async fn find_field(
        &self,
        document_id: &ValidatedDocumentId,
        field_name: &str,
    ) -> Result<Option<ExtractedField>> {
        let state = self.state.read().await;
        let ids = match state.fields_by_document.get(document_id) {
            Some(ids) => ids,
            None => return Ok(None),
        };
        Ok(ids
            .iter()
            .filter_map(|id| state.fields.get(id))
            .find(|f| f.field_name.as_str() == field_name)
            .cloned())
    }

    async fn list_audit_fields(&self, filter: &AuditFilter) -> Result<Vec<ExtractedField>> {
        let state = self.state.read().await;
        let mut fields: Vec<ExtractedField> = state
            .fields
            .values()
            .filter(|f| !f.verified && f.audit_priority.needs_audit())
            .filter(|f| {
                filter
                    .priority
                    .map(|p| f.audit_priority == p)
                    .unwrap_or(true)
            })
            .filter(|f| {
                filter
                    .document_id
                    .map(|d| f.document_id == d)
                    .unwrap_or(true)
            })
            .filter(|f| match filter.template_id {
                Some(tid) => state
                    .documents
                    .get(&f.document_id)
                    .map(|d| d.template_id == Some(tid))
                    .unwrap_or(false),
                None => true,
            })
            .cloned()
            .collect();
        // Queue order: priority first, least-confident first, newest first
        fields.sort_by(|a, b| {
            a.audit_priority
                .cmp(&b.audit_priority)
                .then_with(|| {
                    a.confidence
                        .get()
                        .partial_cmp(&b.confidence.get())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(fields)
    }

    async fn append_verification(
        &self,
        field_id: &ValidatedFieldId,
        action: VerificationAction,
        corrected_value: Option<String>,
        notes: Option<String>,
        reviewer_id: Option<String>,
    ) -> Result<(ExtractedField, Verification)> {
        if action == VerificationAction::Incorrect {
            ensure!(
                corrected_value.is_some(),
                "Marking a field incorrect requires a corrected value"
            );
        }

        let mut state = self.state.write().await;
        let field = state
            .fields
            .get_mut(field_id)
            .with_context(|| format!("Field not found: {field_id}"))?;

        let verification = Verification {
            id: Uuid::new_v4(),
            field_id: *field_id,
            action,
            corrected_value: corrected_value.clone(),
            notes,
            reviewer_id,
            verified_at: Utc::now(),
        };

        field.verified = true;
        field.verified_at = Some(verification.verified_at);
        if action == VerificationAction::Incorrect {
            field.verified_value = corrected_value;
        }
        let updated_field = field.clone();
        let document_id = updated_field.document_id;

        let doc_fields: Vec<ExtractedField> = state
            .fields_by_document
            .get(&document_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.fields.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        self.persist_fields(&document_id, &doc_fields).await?;
        self.append_log_line("verifications.jsonl", &verification)
            .await?;

        state
            .verifications
            .entry(*field_id)
            .or_default()
            .push(verification.clone());

        self.bump_generation();
        Ok((updated_field, verification))
    }

    async fn verifications_for_field(
        &self,
        field_id: &ValidatedFieldId,
    ) -> Result<Vec<Verification>> {
        let state = self.state.read().await;
        Ok(state
            .verifications
            .get(field_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_citation(&self, citation: Citation) -> Result<Citation> {
        let mut state = self.state.write().await;
        let field = state
            .fields
            .get_mut(&citation.field_id)
            .with_context(|| format!("Cited field not found: {}", citation.field_id))?;

        field.citation_count += 1;
        field.last_cited_at = Some(citation.created_at);
        let document_id = field.document_id;

        let doc_fields: Vec<ExtractedField> = state
            .fields_by_document
            .get(&document_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.fields.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        self.persist_fields(&document_id, &doc_fields).await?;
        self.append_log_line("citations.jsonl", &CitationLogEntry::Created(citation.clone()))
            .await?;

        state
            .citations_by_field
            .entry(citation.field_id)
            .or_default()
            .push(citation.id);
        state.citations.insert(citation.id, citation.clone());
        Ok(citation)
    }

    async fn mark_citation_audited(&self, citation_id: Uuid, correction_made: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let citation = state
            .citations
            .get_mut(&citation_id)
            .with_context(|| format!("Citation not found: {citation_id}"))?;
        citation.audit_link_clicked = true;
        citation.correction_made = correction_made;
        self.append_log_line(
            "citations.jsonl",
            &CitationLogEntry::Audited {
                id: citation_id,
                correction_made,
            },
        )
        .await?;
        Ok(())
    }

    async fn citations_for_field(&self, field_id: &ValidatedFieldId) -> Result<Vec<Citation>> {
        let state = self.state.read().await;
        let ids = state
            .citations_by_field
            .get(field_id)
            .cloned()
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| state.citations.get(id))
            .cloned()
            .collect())
    }

    async fn fields_generation(&self) -> u64 {
        self.fields_generation.load(Ordering::SeqCst)
    }

    async fn flush(&self) -> Result<()> {
        // Rows are persisted at mutation time; nothing is buffered. Kept so
        // wrappers and shutdown paths have a uniform hook.
        Ok(())
    }
}

/// Convenience constructor mirroring the other component factories
pub async fn create_file_store(path: &str) -> Result<FileStore> {
    FileStore::open(path).await
}
