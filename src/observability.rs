// Centralized Observability Infrastructure for PaperDB
// Structured logging, metric counters, and trace contexts shared by the
// ingestion pipeline and the query path.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

// Global atomic counters for metrics
static OPERATION_COUNTER: AtomicU64 = AtomicU64::new(0);
static ERROR_COUNTER: AtomicU64 = AtomicU64::new(0);
static QUERY_COUNTER: AtomicU64 = AtomicU64::new(0);
static INGEST_COUNTER: AtomicU64 = AtomicU64::new(0);
static LLM_TOKENS_TOTAL: AtomicU64 = AtomicU64::new(0);
static LLM_TOKENS_CACHED: AtomicU64 = AtomicU64::new(0);

/// Initialize the logging and tracing infrastructure
/// This should be called once at application startup
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

/// Initialize logging with configurable verbosity
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    let filter_level = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("paperdb=debug,info")
    } else {
        // Default: warnings and errors for paperdb, only errors for dependencies
        EnvFilter::new("paperdb=warn,error")
    };

    // Quiet flag takes precedence over the RUST_LOG environment variable
    let env_filter = if quiet {
        EnvFilter::new("error")
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or(filter_level)
    } else {
        filter_level
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(!quiet)
        .with_thread_ids(!quiet)
        .with_ansi(true);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => {
            if !quiet {
                info!("PaperDB observability initialized");
            }
            Ok(())
        }
        Err(_) => {
            // Already initialized, which is fine in test environments
            Ok(())
        }
    }
}

/// Operations logged with structured context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    // Store operations
    StoreWrite { entity: &'static str, id: Uuid },
    StoreRead { entity: &'static str, id: Uuid },

    // Index operations
    IndexDocument { doc_id: Uuid, field_count: usize },
    IndexSignature { template_id: Uuid, version: u64 },
    IndexSearch { result_count: usize, fuzzy: bool },

    // Pipeline stages
    Parse { doc_id: Uuid, chunk_count: usize },
    TemplateMatch { doc_id: Uuid, source: String },
    Extract { doc_id: Uuid, field_count: usize },

    // Query path
    QueryPlan { intent: String, used_llm: bool },
    QueryExecute { result_count: usize },
    AnswerGenerate { citation_count: usize },

    // External calls
    LlmCall {
        purpose: &'static str,
        cached_tokens: u64,
        total_tokens: u64,
    },
    EmbedCall { dimension: usize },
}

/// Metric types for performance monitoring
#[derive(Debug, Clone)]
pub enum MetricType {
    Counter {
        name: &'static str,
        value: u64,
    },
    Gauge {
        name: &'static str,
        value: f64,
    },
    Histogram {
        name: &'static str,
        value: f64,
        unit: &'static str,
    },
    Timer {
        name: &'static str,
        duration: Duration,
    },
}

/// Operation context for tracing through the system
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub operation: String,
    pub start_time: Instant,
    pub attributes: Vec<(String, String)>,
}

impl OperationContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            parent_span_id: None,
            operation: operation.into(),
            start_time: Instant::now(),
            attributes: Vec::new(),
        }
    }

    pub fn child(&self, operation: impl Into<String>) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: Uuid::new_v4(),
            parent_span_id: Some(self.span_id),
            operation: operation.into(),
            start_time: Instant::now(),
            attributes: Vec::new(),
        }
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.push((key.into(), value.into()));
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Log an operation with full context
#[instrument(skip(ctx))]
pub fn log_operation(ctx: &OperationContext, op: &Operation, result: &Result<()>) {
    let elapsed = ctx.elapsed();
    let attrs = ctx
        .attributes
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ");

    match result {
        Ok(()) => {
            info!(
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
                operation = %ctx.operation,
                elapsed_ms = elapsed.as_millis(),
                attributes = %attrs,
                "Operation completed: {:?}", op
            );
            OPERATION_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            error!(
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
                operation = %ctx.operation,
                elapsed_ms = elapsed.as_millis(),
                attributes = %attrs,
                error = %e,
                "Operation failed: {:?}", op
            );
            ERROR_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
    }

    match op {
        Operation::QueryExecute { .. } => {
            QUERY_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        Operation::Parse { .. } => {
            INGEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        Operation::LlmCall {
            cached_tokens,
            total_tokens,
            ..
        } => {
            LLM_TOKENS_TOTAL.fetch_add(*total_tokens, Ordering::Relaxed);
            LLM_TOKENS_CACHED.fetch_add(*cached_tokens, Ordering::Relaxed);
        }
        _ => {}
    }
}

/// Record token usage for LLM cost tracking
pub fn record_llm_usage(purpose: &'static str, cached_tokens: u64, total_tokens: u64) {
    LLM_TOKENS_TOTAL.fetch_add(total_tokens, Ordering::Relaxed);
    LLM_TOKENS_CACHED.fetch_add(cached_tokens, Ordering::Relaxed);
    let cache_ratio = if total_tokens > 0 {
        cached_tokens as f64 / total_tokens as f64
    } else {
        0.0
    };
    debug!(
        purpose,
        cached_tokens, total_tokens, cache_ratio, "LLM tokens consumed"
    );
}

/// Record a metric
pub fn record_metric(metric: MetricType) {
    match metric {
        MetricType::Counter { name, value } => {
            debug!("metric.counter {} = {}", name, value);
        }
        MetricType::Gauge { name, value } => {
            debug!("metric.gauge {} = {}", name, value);
        }
        MetricType::Histogram { name, value, unit } => {
            debug!("metric.histogram {} = {} {}", name, value, unit);
        }
        MetricType::Timer { name, duration } => {
            debug!("metric.timer {} = {:?}", name, duration);
        }
    }
}

/// Execute a closure with a trace context
pub async fn with_trace_id<F, T>(operation: &str, f: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let ctx = OperationContext::new(operation);
    let trace_id = ctx.trace_id;
    let span_id = ctx.span_id;

    debug!(
        trace_id = %trace_id,
        span_id = %span_id,
        "Starting operation: {}", operation
    );

    let start = Instant::now();
    let result = f.await;
    let elapsed = start.elapsed();

    match &result {
        Ok(_) => {
            debug!(
                trace_id = %trace_id,
                span_id = %span_id,
                elapsed_ms = elapsed.as_millis(),
                "Operation completed successfully: {}", operation
            );
            record_metric(MetricType::Timer {
                name: "operation.duration",
                duration: elapsed,
            });
            OPERATION_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            error!(
                trace_id = %trace_id,
                span_id = %span_id,
                elapsed_ms = elapsed.as_millis(),
                error = %e,
                "Operation failed: {}", operation
            );
            ERROR_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
    }

    result
}

/// Get current metrics snapshot
pub fn get_metrics() -> serde_json::Value {
    let total = LLM_TOKENS_TOTAL.load(Ordering::Relaxed);
    let cached = LLM_TOKENS_CACHED.load(Ordering::Relaxed);
    serde_json::json!({
        "operations": {
            "total": OPERATION_COUNTER.load(Ordering::Relaxed),
            "errors": ERROR_COUNTER.load(Ordering::Relaxed),
            "queries": QUERY_COUNTER.load(Ordering::Relaxed),
            "documents_parsed": INGEST_COUNTER.load(Ordering::Relaxed),
        },
        "llm": {
            "tokens_total": total,
            "tokens_cached": cached,
            "cache_ratio": if total > 0 { cached as f64 / total as f64 } else { 0.0 },
        },
        "timestamp": Utc::now().to_rfc3339(),
    })
}

/// Structured error logging with context
#[instrument]
pub fn log_error_with_context(error: &anyhow::Error, ctx: &OperationContext) {
    let error_chain = error
        .chain()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(" -> ");

    error!(
        trace_id = %ctx.trace_id,
        span_id = %ctx.span_id,
        operation = %ctx.operation,
        error_chain = %error_chain,
        "Error occurred during operation"
    );
}

/// Performance timer for measuring operation duration
pub struct PerfTimer {
    name: String,
    start: Instant,
    ctx: OperationContext,
}

impl PerfTimer {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let ctx = OperationContext::new(&name);
        debug!(
            trace_id = %ctx.trace_id,
            span_id = %ctx.span_id,
            "Timer started: {}", name
        );
        Self {
            name,
            start: Instant::now(),
            ctx,
        }
    }
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        debug!(
            trace_id = %self.ctx.trace_id,
            span_id = %self.ctx.span_id,
            elapsed_ms = elapsed.as_millis(),
            "Timer completed: {}", self.name
        );
        record_metric(MetricType::Timer {
            name: "perf.timer",
            duration: elapsed,
        });
    }
}
