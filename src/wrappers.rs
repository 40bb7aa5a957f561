// Wrapper Components
// High-level wrappers that layer tracing, retries, and caching onto the core
// contracts without the implementations knowing about any of it.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::contracts::{
    AuditFilter, Citation, Document, ExtractedField, ParsedDocument, PhysicalFile, Store, Template,
    Verification,
};
use crate::embedder::Embedder;
use crate::errors::ExternalError;
use crate::parser_client::{Parser, RawExtraction, SourceRef};
use crate::types::{
    ContentHash, DocumentStatus, ValidatedDocumentId, ValidatedFieldId, ValidatedFileName,
    ValidatedTemplateId, VerificationAction,
};

/// Simple LRU cache with per-entry TTL
///
/// Backs the process-wide prompt cache and query cache. Not thread-safe by
/// itself; callers wrap it in their own lock.
pub struct TtlCache<K, V> {
    capacity: usize,
    ttl: Duration,
    map: HashMap<K, (Instant, V)>,
    access_order: Vec<K>,
}

impl<K: Clone + Eq + std::hash::Hash, V> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            map: HashMap::with_capacity(capacity),
            access_order: Vec::with_capacity(capacity),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        let expired = match self.map.get(key) {
            Some((inserted, _)) => inserted.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            self.map.remove(key);
            self.access_order.retain(|k| k != key);
            return None;
        }
        self.access_order.retain(|k| k != key);
        self.access_order.push(key.clone());
        self.map.get(key).map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.map.len() >= self.capacity && !self.map.contains_key(&key) {
            if let Some(lru_key) = self.access_order.first().cloned() {
                self.access_order.remove(0);
                self.map.remove(&lru_key);
            }
        }
        self.map.insert(key.clone(), (Instant::now(), value));
        self.access_order.retain(|k| k != &key);
        self.access_order.push(key);
    }

    pub fn remove(&mut self, key: &K) {
        self.map.remove(key);
        self.access_order.retain(|k| k != key);
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.access_order.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Retry an external call with exponential backoff and jitter
///
/// Only transient failures are retried; malformed and permanent errors
/// surface immediately.
pub async fn with_backoff<T, F, Fut>(
    service: &str,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut delay = base_delay;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("{} call succeeded after {} attempts", service, attempt);
                }
                return Ok(value);
            }
            Err(e) => {
                let transient = e
                    .downcast_ref::<ExternalError>()
                    .map(|ext| ext.is_transient())
                    .unwrap_or(false);
                if !transient || attempt >= max_attempts {
                    if attempt > 1 {
                        warn!(
                            "{} call failed after {} attempts: {}",
                            service, attempt, e
                        );
                    }
                    return Err(e);
                }
                warn!(
                    "{} call failed (attempt {}/{}): {}",
                    service, attempt, max_attempts, e
                );
                tokio::time::sleep(delay).await;

                delay = std::cmp::min(delay * 2, max_delay);
                let jitter = Duration::from_millis(rand::random::<u64>() % 100);
                delay += jitter;
            }
        }
    }
}

/// Store wrapper that adds tracing and operation counting
pub struct TracedStore<S: Store> {
    inner: S,
    trace_id: Uuid,
    operation_count: AtomicU64,
}

impl<S: Store> TracedStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            trace_id: Uuid::new_v4(),
            operation_count: AtomicU64::new(0),
        }
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn operation_count(&self) -> u64 {
        self.operation_count.load(Ordering::Relaxed)
    }

    fn count(&self) {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl<S: Store> Store for TracedStore<S> {
    async fn create_document(
        &self,
        filename: ValidatedFileName,
        bytes: &[u8],
    ) -> Result<Document> {
        self.count();
        let start = Instant::now();
        let result = self.inner.create_document(filename, bytes).await;
        match &result {
            Ok(doc) => info!(
                trace_id = %self.trace_id,
                doc_id = %doc.id,
                elapsed_ms = start.elapsed().as_millis(),
                "store.create_document"
            ),
            Err(e) => warn!(trace_id = %self.trace_id, error = %e, "store.create_document failed"),
        }
        result
    }

    async fn get_document(&self, id: &ValidatedDocumentId) -> Result<Option<Document>> {
        debug!(trace_id = %self.trace_id, doc_id = %id, "store.get_document");
        self.inner.get_document(id).await
    }

    async fn list_documents(&self, status: Option<DocumentStatus>) -> Result<Vec<Document>> {
        self.inner.list_documents(status).await
    }

    async fn update_document_status(
        &self,
        id: &ValidatedDocumentId,
        status: DocumentStatus,
        error: Option<String>,
    ) -> Result<Document> {
        self.count();
        info!(trace_id = %self.trace_id, doc_id = %id, status = %status, "store.update_document_status");
        self.inner.update_document_status(id, status, error).await
    }

    async fn set_document_template(
        &self,
        id: &ValidatedDocumentId,
        template_id: Option<ValidatedTemplateId>,
    ) -> Result<()> {
        self.count();
        self.inner.set_document_template(id, template_id).await
    }

    async fn cache_parse_result(
        &self,
        id: &ValidatedDocumentId,
        job_id: &str,
        parsed: ParsedDocument,
    ) -> Result<()> {
        self.count();
        info!(trace_id = %self.trace_id, doc_id = %id, job_id, "store.cache_parse_result");
        self.inner.cache_parse_result(id, job_id, parsed).await
    }

    async fn relocate_document_file(
        &self,
        id: &ValidatedDocumentId,
        template_name: &str,
    ) -> Result<String> {
        self.count();
        self.inner.relocate_document_file(id, template_name).await
    }

    async fn get_physical_file(&self, hash: &ContentHash) -> Result<Option<PhysicalFile>> {
        self.inner.get_physical_file(hash).await
    }

    async fn create_template(&self, template: Template) -> Result<Template> {
        self.count();
        self.inner.create_template(template).await
    }

    async fn get_template(&self, id: &ValidatedTemplateId) -> Result<Option<Template>> {
        self.inner.get_template(id).await
    }

    async fn list_templates(&self) -> Result<Vec<Template>> {
        self.inner.list_templates().await
    }

    async fn update_template(&self, template: Template) -> Result<Template> {
        self.count();
        info!(trace_id = %self.trace_id, template_id = %template.id, "store.update_template");
        self.inner.update_template(template).await
    }

    async fn upsert_extracted_fields(
        &self,
        document_id: &ValidatedDocumentId,
        fields: Vec<ExtractedField>,
    ) -> Result<Vec<ExtractedField>> {
        self.count();
        let start = Instant::now();
        let count = fields.len();
        let result = self.inner.upsert_extracted_fields(document_id, fields).await;
        info!(
            trace_id = %self.trace_id,
            doc_id = %document_id,
            fields = count,
            elapsed_ms = start.elapsed().as_millis(),
            ok = result.is_ok(),
            "store.upsert_extracted_fields"
        );
        result
    }

    async fn fields_for_document(
        &self,
        document_id: &ValidatedDocumentId,
    ) -> Result<Vec<ExtractedField>> {
        self.inner.fields_for_document(document_id).await
    }

    async fn get_field(&self, id: &ValidatedFieldId) -> Result<Option<ExtractedField>> {
        self.inner.get_field(id).await
    }

    async fn find_field(
        &self,
        document_id: &ValidatedDocumentId,
        field_name: &str,
    ) -> Result<Option<ExtractedField>> {
        self.inner.find_field(document_id, field_name).await
    }

    async fn list_audit_fields(&self, filter: &AuditFilter) -> Result<Vec<ExtractedField>> {
        self.inner.list_audit_fields(filter).await
    }

    async fn append_verification(
        &self,
        field_id: &ValidatedFieldId,
        action: VerificationAction,
        corrected_value: Option<String>,
        notes: Option<String>,
        reviewer_id: Option<String>,
    ) -> Result<(ExtractedField, Verification)> {
        self.count();
        info!(trace_id = %self.trace_id, field_id = %field_id, action = ?action, "store.append_verification");
        self.inner
            .append_verification(field_id, action, corrected_value, notes, reviewer_id)
            .await
    }

    async fn verifications_for_field(
        &self,
        field_id: &ValidatedFieldId,
    ) -> Result<Vec<Verification>> {
        self.inner.verifications_for_field(field_id).await
    }

    async fn record_citation(&self, citation: Citation) -> Result<Citation> {
        self.count();
        self.inner.record_citation(citation).await
    }

    async fn mark_citation_audited(&self, citation_id: Uuid, correction_made: bool) -> Result<()> {
        self.count();
        self.inner
            .mark_citation_audited(citation_id, correction_made)
            .await
    }

    async fn citations_for_field(&self, field_id: &ValidatedFieldId) -> Result<Vec<Citation>> {
        self.inner.citations_for_field(field_id).await
    }

    async fn fields_generation(&self) -> u64 {
        self.inner.fields_generation().await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }
}

/// Parser wrapper with parse-result caching keyed by job id
///
/// This is where the pipelining invariant is enforced client-side: bytes that
/// already have a cached parse are silently upgraded to a `jobid://` call, so
/// the external parser receives each physical file exactly once.
pub struct CachedParser<P: Parser> {
    inner: P,
    by_hash: DashMap<ContentHash, String>,
    by_job: DashMap<String, ParsedDocument>,
    bytes_parse_count: AtomicU64,
}

impl<P: Parser> CachedParser<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            by_hash: DashMap::new(),
            by_job: DashMap::new(),
            bytes_parse_count: AtomicU64::new(0),
        }
    }

    /// Locally cached parse payload for a job id
    pub fn cached_result(&self, job_id: &str) -> Option<ParsedDocument> {
        self.by_job.get(job_id).map(|entry| entry.clone())
    }

    /// Times the wrapped parser has been sent raw bytes
    pub fn bytes_parse_count(&self) -> u64 {
        self.bytes_parse_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<P: Parser> Parser for CachedParser<P> {
    async fn parse(&self, bytes: &[u8]) -> Result<(String, ParsedDocument)> {
        let hash = ContentHash::of_bytes(bytes);
        if let Some(job_id) = self.by_hash.get(&hash) {
            if let Some(parsed) = self.by_job.get(job_id.value()) {
                debug!(job_id = %job_id.value(), "Parse cache hit");
                return Ok((job_id.clone(), parsed.clone()));
            }
        }

        self.bytes_parse_count.fetch_add(1, Ordering::Relaxed);
        let (job_id, parsed) = self.inner.parse(bytes).await?;
        self.by_hash.insert(hash, job_id.clone());
        self.by_job.insert(job_id.clone(), parsed.clone());
        Ok((job_id, parsed))
    }

    async fn extract_structured(
        &self,
        source: SourceRef<'_>,
        fields: &[crate::contracts::FieldSpec],
    ) -> Result<HashMap<String, RawExtraction>> {
        match source {
            SourceRef::JobId(_) => self.inner.extract_structured(source, fields).await,
            SourceRef::Bytes(bytes) => {
                // Upgrade to a job reference if these bytes were parsed before
                let hash = ContentHash::of_bytes(bytes);
                if let Some(job_id) = self.by_hash.get(&hash) {
                    let job_id = job_id.clone();
                    return self
                        .inner
                        .extract_structured(SourceRef::JobId(&job_id), fields)
                        .await;
                }
                self.inner.extract_structured(source, fields).await
            }
        }
    }
}

/// Embedder wrapper that retries transient failures with backoff
pub struct RetryingEmbedder<E: Embedder> {
    inner: Arc<E>,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl<E: Embedder> RetryingEmbedder<E> {
    pub fn new(inner: E, max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Arc::new(inner),
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    pub fn from_settings(inner: E, settings: &crate::config::EmbedderSettings) -> Self {
        Self::new(
            inner,
            settings.max_retries,
            Duration::from_millis(settings.retry_base_ms),
            Duration::from_millis(settings.retry_cap_ms),
        )
    }
}

#[async_trait]
impl<E: Embedder> Embedder for RetryingEmbedder<E> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let inner = self.inner.clone();
        with_backoff(
            "embedder",
            self.max_attempts,
            self.base_delay,
            self.max_delay,
            move || {
                let inner = inner.clone();
                let text = text.to_string();
                async move { inner.embed(&text).await }
            },
        )
        .await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_ttl_cache_lru_eviction() {
        let mut cache = TtlCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.get(&"a");
        cache.insert("c", 3); // evicts "b", the least recently used

        assert!(cache.get(&"a").is_some());
        assert!(cache.get(&"b").is_none());
        assert!(cache.get(&"c").is_some());
    }

    #[test]
    fn test_ttl_cache_expiry() {
        let mut cache = TtlCache::new(4, Duration::from_millis(0));
        cache.insert("a", 1);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&"a").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_backoff_retries_transient_only() {
        let attempts = Arc::new(AtomicU32::new(0));

        // Transient errors retry until success
        let counter = attempts.clone();
        let result = with_backoff(
            "test",
            3,
            Duration::from_millis(1),
            Duration::from_millis(5),
            move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(ExternalError::transient("test", "flaky").into())
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        // Permanent errors fail immediately
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<u32> = with_backoff(
            "test",
            3,
            Duration::from_millis(1),
            Duration::from_millis(5),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ExternalError::permanent("test", "bad request").into())
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
