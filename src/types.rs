// Validated Types
// Strongly-typed wrappers that enforce invariants at construction time.
// These types cannot be built with invalid data, which removes whole classes
// of bugs before the pipeline or the indices ever see a value.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// A document ID that is guaranteed to be valid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValidatedDocumentId {
    inner: Uuid,
}

impl Default for ValidatedDocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidatedDocumentId {
    /// Create a new random document ID
    pub fn new() -> Self {
        Self {
            inner: Uuid::new_v4(),
        }
    }

    /// Create from an existing UUID with validation
    pub fn from_uuid(id: Uuid) -> Result<Self> {
        ensure!(!id.is_nil(), "Document ID cannot be nil UUID");
        Ok(Self { inner: id })
    }

    /// Parse from string
    pub fn parse(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s)?;
        Self::from_uuid(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.inner
    }
}

impl fmt::Display for ValidatedDocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A template ID that is guaranteed to be valid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValidatedTemplateId {
    inner: Uuid,
}

impl Default for ValidatedTemplateId {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidatedTemplateId {
    pub fn new() -> Self {
        Self {
            inner: Uuid::new_v4(),
        }
    }

    pub fn from_uuid(id: Uuid) -> Result<Self> {
        ensure!(!id.is_nil(), "Template ID cannot be nil UUID");
        Ok(Self { inner: id })
    }

    pub fn parse(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s)?;
        Self::from_uuid(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.inner
    }
}

impl fmt::Display for ValidatedTemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// An extracted-field ID that is guaranteed to be valid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValidatedFieldId {
    inner: Uuid,
}

impl Default for ValidatedFieldId {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidatedFieldId {
    pub fn new() -> Self {
        Self {
            inner: Uuid::new_v4(),
        }
    }

    pub fn from_uuid(id: Uuid) -> Result<Self> {
        ensure!(!id.is_nil(), "Field ID cannot be nil UUID");
        Ok(Self { inner: id })
    }

    pub fn parse(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s)?;
        Self::from_uuid(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.inner
    }
}

impl fmt::Display for ValidatedFieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A field name validated against the shared naming rules
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValidatedFieldName {
    inner: String,
}

impl ValidatedFieldName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        crate::validation::field::validate_field_name(&name)?;
        Ok(Self {
            inner: name.trim().to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for ValidatedFieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A template name validated against the shared naming rules
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedTemplateName {
    inner: String,
}

impl ValidatedTemplateName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        crate::validation::field::validate_template_name(&name)?;
        Ok(Self {
            inner: name.trim().to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for ValidatedTemplateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// An uploaded filename validated against filesystem rules
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedFileName {
    inner: String,
}

impl ValidatedFileName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        crate::validation::file::validate_file_name(&name)?;
        Ok(Self { inner: name })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for ValidatedFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// SHA-256 content hash identifying the bytes of a physical file
///
/// Two uploads with the same hash share one stored file; the hash is the
/// lookup key regardless of where the file sits under a template folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash {
    inner: [u8; 32],
}

impl ContentHash {
    /// Hash file bytes
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut inner = [0u8; 32];
        inner.copy_from_slice(&digest);
        Self { inner }
    }

    /// Parse from a 64-character hex string
    pub fn parse(s: &str) -> Result<Self> {
        let raw = hex::decode(s)?;
        ensure!(raw.len() == 32, "Content hash must be 32 bytes");
        let mut inner = [0u8; 32];
        inner.copy_from_slice(&raw);
        Ok(Self { inner })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.inner
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.inner)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// An extraction or match confidence, guaranteed to be in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Confidence {
    inner: f64,
}

impl Confidence {
    pub const ZERO: Confidence = Confidence { inner: 0.0 };
    pub const FULL: Confidence = Confidence { inner: 1.0 };

    pub fn new(value: f64) -> Result<Self> {
        ensure!(value.is_finite(), "Confidence must be finite");
        ensure!(
            (0.0..=1.0).contains(&value),
            "Confidence must be in [0, 1], got {}",
            value
        );
        Ok(Self { inner: value })
    }

    /// Clamp an unchecked score into [0, 1]
    ///
    /// Used for derived scores (similarity normalization, planner confidence)
    /// where arithmetic can drift slightly outside the range.
    pub fn clamped(value: f64) -> Self {
        if value.is_nan() {
            return Self::ZERO;
        }
        Self {
            inner: value.clamp(0.0, 1.0),
        }
    }

    pub fn get(&self) -> f64 {
        self.inner
    }

    /// Whether the value clears a threshold. The review boundary is strict:
    /// confidence exactly equal to the threshold does NOT need review.
    pub fn needs_review(&self, review_threshold: f64) -> bool {
        self.inner < review_threshold
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.inner)
    }
}

/// A source bounding box on a parsed page
///
/// Only plausible boxes are constructible; implausible ones (coordinate over
/// 10,000 or non-positive extent) are dropped to None at index time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Result<Self> {
        ensure!(
            crate::validation::index::bbox_is_plausible(x, y, width, height),
            "Implausible bounding box: ({}, {}, {}, {})",
            x,
            y,
            width,
            height
        );
        Ok(Self {
            x,
            y,
            width,
            height,
        })
    }

    /// Build a box if plausible, otherwise None
    pub fn checked(x: f64, y: f64, width: f64, height: f64) -> Option<Self> {
        Self::new(x, y, width, height).ok()
    }

    /// Build from a [x, y, w, h] tuple as returned by the parser
    pub fn from_tuple(raw: [f64; 4]) -> Option<Self> {
        Self::checked(raw[0], raw[1], raw[2], raw[3])
    }
}

/// Declared type of a template field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Date,
    Boolean,
    Array,
    Table,
    ArrayOfObjects,
}

impl FieldType {
    /// Structured types carry their value as JSON, scalar types as a string
    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Array | Self::Table | Self::ArrayOfObjects)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Date => "date",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Table => "table",
            Self::ArrayOfObjects => "array_of_objects",
        };
        write!(f, "{name}")
    }
}

/// Tagged variant for structured extracted values
///
/// Scalar values (text, number, date, boolean) are stored as strings on the
/// field row; this variant models the structured shapes (arrays, tables,
/// arrays of objects) behind a typed accessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldValue {
    Scalar { value: String },
    Number { value: f64 },
    Array { items: Vec<FieldValue> },
    Table {
        headers: Vec<String>,
        rows: Vec<Vec<FieldValue>>,
    },
    ArrayOfObjects {
        items: Vec<serde_json::Map<String, serde_json::Value>>,
    },
}

impl FieldValue {
    /// Flatten the value into searchable text
    pub fn to_index_text(&self) -> String {
        match self {
            Self::Scalar { value } => value.clone(),
            Self::Number { value } => format!("{value}"),
            Self::Array { items } => items
                .iter()
                .map(|v| v.to_index_text())
                .collect::<Vec<_>>()
                .join(" "),
            Self::Table { headers, rows } => {
                let mut parts = headers.clone();
                for row in rows {
                    for cell in row {
                        parts.push(cell.to_index_text());
                    }
                }
                parts.join(" ")
            }
            Self::ArrayOfObjects { items } => items
                .iter()
                .flat_map(|obj| obj.values())
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Number of top-level elements, for array-type validation
    pub fn element_count(&self) -> usize {
        match self {
            Self::Array { items } => items.len(),
            Self::Table { rows, .. } => rows.len(),
            Self::ArrayOfObjects { items } => items.len(),
            _ => 1,
        }
    }
}

/// Document lifecycle states
///
/// ```text
/// uploaded -> analyzing -> template_matched -> processing -> completed
///                 |               |                 |
///                 v               v                 v
///          template_needed   (user picks)         error
///          template_suggested
/// ```
///
/// `error` is terminal unless an operator retries; the retry paths re-enter
/// `analyzing` (full retry) or `processing` (re-extract with cached parse).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    Analyzing,
    TemplateMatched,
    TemplateSuggested,
    TemplateNeeded,
    Processing,
    Completed,
    Error,
}

impl DocumentStatus {
    /// Whether a transition to `next` is legal
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Uploaded, Analyzing)
                | (Analyzing, TemplateMatched)
                | (Analyzing, TemplateSuggested)
                | (Analyzing, TemplateNeeded)
                | (Analyzing, Error)
                | (TemplateMatched, Processing)
                | (TemplateSuggested, TemplateMatched)
                | (TemplateSuggested, Processing)
                | (TemplateNeeded, TemplateMatched)
                | (TemplateNeeded, Processing)
                | (Processing, Completed)
                | (Processing, Error)
                // Operator retry paths: re-analyze or re-extract
                | (Error, Analyzing)
                | (Error, Processing)
                | (Completed, Processing)
        )
    }

    /// States that wait for a user template decision
    pub fn awaits_user_decision(&self) -> bool {
        matches!(self, Self::TemplateSuggested | Self::TemplateNeeded)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Analyzing => "analyzing",
            Self::TemplateMatched => "template_matched",
            Self::TemplateSuggested => "template_suggested",
            Self::TemplateNeeded => "template_needed",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Validation outcome for an extracted field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Valid,
    Warning,
    Error,
    Unchecked,
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Valid => "valid",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Unchecked => "unchecked",
        };
        write!(f, "{name}")
    }
}

/// Four-level audit priority driving review-queue ordering
///
/// Lower values review first. Derived purely from (confidence, validation
/// status, thresholds); see `pure::compute_audit_priority`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AuditPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl AuditPriority {
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Critical),
            1 => Ok(Self::High),
            2 => Ok(Self::Medium),
            3 => Ok(Self::Low),
            other => anyhow::bail!("Invalid audit priority: {}", other),
        }
    }

    /// Priorities at or above this level sit in the audit queue
    pub fn needs_audit(&self) -> bool {
        self.as_u8() <= 2
    }
}

impl fmt::Display for AuditPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        write!(f, "{name}")
    }
}

/// Outcome chosen by a human reviewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationAction {
    Correct,
    Incorrect,
    NotFound,
}

/// Where a query came from, recorded on each citation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuerySource {
    AskAi,
    McpSearch,
    McpRag,
}

/// Template-kind discriminator selecting the business-rule set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    Invoice,
    Receipt,
    Contract,
    PurchaseOrder,
    Generic,
}

impl Default for TemplateKind {
    fn default() -> Self {
        Self::Generic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id() {
        assert!(ValidatedDocumentId::from_uuid(Uuid::new_v4()).is_ok());
        assert!(ValidatedDocumentId::from_uuid(Uuid::nil()).is_err());
        assert!(ValidatedDocumentId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_content_hash_round_trip() {
        let hash = ContentHash::of_bytes(b"invoice bytes");
        let parsed = ContentHash::parse(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);

        // Same bytes, same hash; different bytes, different hash
        assert_eq!(hash, ContentHash::of_bytes(b"invoice bytes"));
        assert_ne!(hash, ContentHash::of_bytes(b"other bytes"));
    }

    #[test]
    fn test_confidence_bounds() {
        assert!(Confidence::new(0.0).is_ok());
        assert!(Confidence::new(1.0).is_ok());
        assert!(Confidence::new(-0.1).is_err());
        assert!(Confidence::new(1.1).is_err());
        assert!(Confidence::new(f64::NAN).is_err());

        assert_eq!(Confidence::clamped(1.7).get(), 1.0);
        assert_eq!(Confidence::clamped(-2.0).get(), 0.0);
    }

    #[test]
    fn test_review_boundary_is_strict() {
        let threshold = 0.60;
        assert!(!Confidence::new(0.60).unwrap().needs_review(threshold));
        assert!(Confidence::new(0.59).unwrap().needs_review(threshold));
    }

    #[test]
    fn test_bounding_box_rejection() {
        assert!(BoundingBox::checked(10.0, 10.0, 50.0, 20.0).is_some());
        assert!(BoundingBox::checked(10.0, 10.0, 0.0, 20.0).is_none());
        assert!(BoundingBox::checked(10.0, 10.0, 50.0, -1.0).is_none());
        assert!(BoundingBox::checked(10_001.0, 10.0, 50.0, 20.0).is_none());
    }

    #[test]
    fn test_status_transitions() {
        use DocumentStatus::*;

        assert!(Uploaded.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(TemplateMatched));
        assert!(Analyzing.can_transition_to(TemplateNeeded));
        assert!(TemplateMatched.can_transition_to(Processing));
        assert!(TemplateSuggested.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Error));
        assert!(Error.can_transition_to(Processing));

        // Operator-initiated re-extract of a completed document
        assert!(Completed.can_transition_to(Processing));

        assert!(!Uploaded.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Analyzing));
        assert!(!Analyzing.can_transition_to(Uploaded));
        assert!(!TemplateNeeded.can_transition_to(Completed));
    }

    #[test]
    fn test_audit_priority_ordering() {
        let mut priorities = vec![
            AuditPriority::Low,
            AuditPriority::Critical,
            AuditPriority::Medium,
            AuditPriority::High,
        ];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![
                AuditPriority::Critical,
                AuditPriority::High,
                AuditPriority::Medium,
                AuditPriority::Low,
            ]
        );
        assert!(AuditPriority::Medium.needs_audit());
        assert!(!AuditPriority::Low.needs_audit());
    }

    #[test]
    fn test_field_value_index_text() {
        let table = FieldValue::Table {
            headers: vec!["item".to_string(), "qty".to_string()],
            rows: vec![vec![
                FieldValue::Scalar {
                    value: "widget".to_string(),
                },
                FieldValue::Number { value: 3.0 },
            ]],
        };
        let text = table.to_index_text();
        assert!(text.contains("item"));
        assert!(text.contains("widget"));
        assert!(text.contains('3'));
        assert_eq!(table.element_count(), 1);
    }
}
