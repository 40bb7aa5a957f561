// Error Taxonomy
// Component boundaries fold raw external errors into these shapes. Internal
// layers propagate anyhow::Result; nothing below converts back out, so the
// pipeline and query services never leak raw client errors to callers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of an external-service failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalErrorKind {
    /// Network error or 5xx; retried with exponential backoff
    Transient,
    /// Response arrived but is structurally invalid (missing chunks,
    /// unparseable JSON in a JSON-mode call)
    Malformed,
    /// 4xx or config error; retrying cannot help
    Permanent,
}

/// Failure from one of the external collaborators (parser, LLM, embedder)
#[derive(Debug, Error)]
#[error("{service} error ({kind:?}): {message}")]
pub struct ExternalError {
    pub service: &'static str,
    pub kind: ExternalErrorKind,
    pub message: String,
}

impl ExternalError {
    pub fn transient(service: &'static str, message: impl Into<String>) -> Self {
        Self {
            service,
            kind: ExternalErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn malformed(service: &'static str, message: impl Into<String>) -> Self {
        Self {
            service,
            kind: ExternalErrorKind::Malformed,
            message: message.into(),
        }
    }

    pub fn permanent(service: &'static str, message: impl Into<String>) -> Self {
        Self {
            service,
            kind: ExternalErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ExternalErrorKind::Transient
    }
}

/// Stable failure codes surfaced in batch results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestFailureCode {
    ParseFailed,
    NoTemplate,
    ExtractFailed,
    IndexFailed,
}

/// Per-document ingestion failure
///
/// Every failing pipeline stage maps to exactly one code; the message is
/// preserved on the document row as `error_message`.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("parse failed: {0}")]
    ParseFailed(String),

    #[error("no template matched: {0}")]
    NoTemplate(String),

    #[error("extraction failed: {0}")]
    ExtractFailed(String),

    #[error("index write failed: {0}")]
    IndexFailed(String),

    #[error("deadline exceeded during {stage}")]
    Cancelled { stage: &'static str },
}

impl IngestError {
    pub fn code(&self) -> IngestFailureCode {
        match self {
            Self::ParseFailed(_) => IngestFailureCode::ParseFailed,
            Self::NoTemplate(_) => IngestFailureCode::NoTemplate,
            Self::ExtractFailed(_) => IngestFailureCode::ExtractFailed,
            Self::IndexFailed(_) => IngestFailureCode::IndexFailed,
            // A deadline is reported against the stage that was running
            Self::Cancelled { stage } => match *stage {
                "parse" => IngestFailureCode::ParseFailed,
                "extract" => IngestFailureCode::ExtractFailed,
                "index" => IngestFailureCode::IndexFailed,
                _ => IngestFailureCode::ExtractFailed,
            },
        }
    }
}

/// What the caller of a failed query should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryFailureAdvice {
    /// Zero results even after fuzzy fallback; try the suggestions
    Reformulate,
    /// Transient backend trouble; retry the same query
    Retry,
    /// Store or index unavailable; escalate to an operator
    Escalate,
}

/// Query-path failure
///
/// Zero-result queries are NOT errors; they return an empty result set with
/// reformulation suggestions. These variants cover the cases where no answer
/// can be produced at all.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query deadline of {deadline_ms}ms exceeded")]
    Timeout { deadline_ms: u64 },

    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("fatal backend failure: {0}")]
    Fatal(String),
}

impl QueryError {
    pub fn advice(&self) -> QueryFailureAdvice {
        match self {
            Self::Timeout { .. } | Self::Transient(_) => QueryFailureAdvice::Retry,
            Self::Fatal(_) => QueryFailureAdvice::Escalate,
        }
    }
}
