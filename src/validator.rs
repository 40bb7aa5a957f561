// Field Validator
// Schema-typed validation plus per-template-kind business rules. Rule
// failures are never fatal: they become a validation status on the field and
// feed the audit priority. Severity is adjusted by extraction confidence:
// a confident extractor tripping a rule is almost certainly a real problem,
// a guessing one gets the benefit of the doubt.

use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::config::AuditSettings;
use crate::contracts::{ExtractedField, Template};
use crate::pure::{parse_date, parse_number};
use crate::types::{FieldType, FieldValue, TemplateKind, ValidationStatus};

/// Monetary sanity cap: anything above this is a parse artifact, not a price
const MONEY_SANITY_CAP: f64 = 1_000_000_000.0;

/// Substrings marking a numeric field as monetary
const MONEY_PATTERNS: &[&str] = &["amount", "total", "price", "cost", "subtotal", "tax", "value"];

/// Field-name pairs for the effective-date <= end-date rule
const START_DATE_PATTERNS: &[&str] = &["effective_date", "start_date", "issue_date", "order_date"];
const END_DATE_PATTERNS: &[&str] = &["end_date", "termination_date", "expiration_date", "due_date"];

/// Validation result for one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValidation {
    pub status: ValidationStatus,
    pub errors: Vec<String>,
}

impl FieldValidation {
    fn valid() -> Self {
        Self {
            status: ValidationStatus::Valid,
            errors: Vec::new(),
        }
    }
}

pub struct Validator {
    settings: AuditSettings,
    /// Days a date may sit in the future before it is suspect
    max_future_days: i64,
    /// Years a date may sit in the past before it is suspect
    max_past_years: i64,
    /// Injected "today" so date-window rules are testable
    reference_date: Option<NaiveDate>,
}

impl Validator {
    pub fn new(settings: AuditSettings) -> Self {
        Self {
            settings,
            max_future_days: 30,
            max_past_years: 10,
            reference_date: None,
        }
    }

    pub fn with_reference_date(mut self, date: NaiveDate) -> Self {
        self.reference_date = Some(date);
        self
    }

    fn today(&self) -> NaiveDate {
        self.reference_date
            .unwrap_or_else(|| Utc::now().date_naive())
    }

    /// Validate every field of a document against its template
    ///
    /// Returns one entry per extracted field. Fields the template does not
    /// declare are checked for type sanity only.
    pub fn validate(
        &self,
        template: &Template,
        fields: &[ExtractedField],
    ) -> HashMap<String, FieldValidation> {
        let mut results: HashMap<String, FieldValidation> = HashMap::new();

        for field in fields {
            let mut issues: Vec<Issue> = Vec::new();
            let spec = template.field(field.field_name.as_str());

            if field.is_missing() {
                let required = spec.map(|s| s.required).unwrap_or(false);
                if required {
                    // A missing required field is an error no matter how
                    // unsure the extractor was.
                    results.insert(
                        field.field_name.as_str().to_string(),
                        FieldValidation {
                            status: ValidationStatus::Error,
                            errors: vec!["required field has no extracted value".to_string()],
                        },
                    );
                } else {
                    results.insert(
                        field.field_name.as_str().to_string(),
                        FieldValidation {
                            status: ValidationStatus::Warning,
                            errors: vec!["no value extracted".to_string()],
                        },
                    );
                }
                continue;
            }

            self.check_type(field, &mut issues);
            self.check_business_rules(template.kind, field, &mut issues);

            let validation = self.finalize(field, issues);
            results.insert(field.field_name.as_str().to_string(), validation);
        }

        self.check_cross_field_rules(fields, &mut results);
        results
    }

    fn check_type(&self, field: &ExtractedField, issues: &mut Vec<Issue>) {
        match field.field_type {
            FieldType::Number => {
                if let Some(value) = &field.field_value {
                    if parse_number(value).is_none() {
                        issues.push(Issue::error(format!("'{value}' is not a number")));
                    }
                }
            }
            FieldType::Date => {
                if let Some(value) = &field.field_value {
                    if parse_date(value).is_none() {
                        issues.push(Issue::error(format!("'{value}' is not a recognizable date")));
                    }
                }
            }
            FieldType::Boolean => {
                if let Some(value) = &field.field_value {
                    let lowered = value.trim().to_lowercase();
                    if !matches!(lowered.as_str(), "true" | "false" | "yes" | "no") {
                        issues.push(Issue::error(format!("'{value}' is not a boolean")));
                    }
                }
            }
            FieldType::Text => {}
            FieldType::Array => match &field.field_value_json {
                Some(FieldValue::Array { items }) => {
                    let mut kinds: Vec<&'static str> =
                        items.iter().map(variant_name).collect();
                    kinds.dedup();
                    if kinds.len() > 1 {
                        issues.push(Issue::error(
                            "array elements have mixed types".to_string(),
                        ));
                    }
                }
                Some(_) => issues.push(Issue::error("value is not an array".to_string())),
                None => {}
            },
            FieldType::Table => match &field.field_value_json {
                Some(FieldValue::Table { headers, rows }) => {
                    if rows.iter().any(|row| row.len() != headers.len()) {
                        issues.push(Issue::error(format!(
                            "table rows do not all have {} columns",
                            headers.len()
                        )));
                    }
                }
                Some(_) => issues.push(Issue::error("value is not a table".to_string())),
                None => {}
            },
            FieldType::ArrayOfObjects => match &field.field_value_json {
                Some(FieldValue::ArrayOfObjects { .. }) => {}
                Some(_) => {
                    issues.push(Issue::error("value is not an array of objects".to_string()))
                }
                None => {}
            },
        }
    }

    fn check_business_rules(
        &self,
        kind: TemplateKind,
        field: &ExtractedField,
        issues: &mut Vec<Issue>,
    ) {
        let name = field.field_name.as_str().to_lowercase();

        // Monetary fields must be positive and under the sanity cap
        if field.field_type == FieldType::Number
            && MONEY_PATTERNS.iter().any(|p| name.contains(p))
        {
            if let Some(value) = field.field_value.as_deref().and_then(parse_number) {
                if value <= 0.0 {
                    issues.push(Issue::error(format!(
                        "monetary field must be positive, got {value}"
                    )));
                } else if value > MONEY_SANITY_CAP {
                    issues.push(Issue::error(format!(
                        "monetary value {value} exceeds the sanity cap"
                    )));
                }
            }
        }

        // Dates must land in a plausible window
        if field.field_type == FieldType::Date {
            if let Some(date) = field.field_value.as_deref().and_then(parse_date) {
                let today = self.today();
                if date > today + Duration::days(self.max_future_days) {
                    issues.push(Issue::error(format!(
                        "date {date} is more than {} days in the future",
                        self.max_future_days
                    )));
                }
                if date < today - Duration::days(365 * self.max_past_years) {
                    issues.push(Issue::error(format!(
                        "date {date} is more than {} years in the past",
                        self.max_past_years
                    )));
                }
            }
        }

        // Kind-specific expectations
        if kind == TemplateKind::Receipt
            && field.field_type == FieldType::Number
            && name.contains("total")
        {
            if let Some(value) = field.field_value.as_deref().and_then(parse_number) {
                if value > 100_000.0 {
                    issues.push(Issue::error(format!(
                        "receipt total {value} is implausibly large"
                    )));
                }
            }
        }
    }

    /// Cross-field rules: date ordering and the subtotal + tax = total check
    fn check_cross_field_rules(
        &self,
        fields: &[ExtractedField],
        results: &mut HashMap<String, FieldValidation>,
    ) {
        let date_of = |patterns: &[&str]| -> Option<(String, NaiveDate)> {
            fields.iter().find_map(|f| {
                let name = f.field_name.as_str().to_lowercase();
                if patterns.iter().any(|p| name.contains(p)) {
                    f.field_value
                        .as_deref()
                        .and_then(parse_date)
                        .map(|d| (f.field_name.as_str().to_string(), d))
                } else {
                    None
                }
            })
        };
        let number_of = |pattern: &str| -> Option<f64> {
            fields.iter().find_map(|f| {
                let name = f.field_name.as_str().to_lowercase();
                if name.contains(pattern) {
                    f.field_value.as_deref().and_then(parse_number)
                } else {
                    None
                }
            })
        };

        if let (Some((start_name, start)), Some((_, end))) =
            (date_of(START_DATE_PATTERNS), date_of(END_DATE_PATTERNS))
        {
            if start > end {
                self.demote_or_keep(
                    fields,
                    results,
                    &start_name,
                    format!("start date {start} is after end date {end}"),
                );
            }
        }

        if let (Some(subtotal), Some(tax), Some(total)) = (
            number_of("subtotal"),
            number_of("tax"),
            number_of("total"),
        ) {
            let expected = subtotal + tax;
            let tolerance = (expected.abs() * 0.005).max(0.01);
            if (expected - total).abs() > tolerance {
                let total_field = fields
                    .iter()
                    .find(|f| f.field_name.as_str().to_lowercase().contains("total"));
                if let Some(total_field) = total_field {
                    self.demote_or_keep(
                        fields,
                        results,
                        total_field.field_name.as_str(),
                        format!("subtotal {subtotal} + tax {tax} != total {total}"),
                    );
                }
            }
        }
    }

    /// Attach a cross-field failure to a named field with severity adjustment
    fn demote_or_keep(
        &self,
        fields: &[ExtractedField],
        results: &mut HashMap<String, FieldValidation>,
        field_name: &str,
        message: String,
    ) {
        let confidence = fields
            .iter()
            .find(|f| f.field_name.as_str() == field_name)
            .map(|f| f.confidence.get())
            .unwrap_or(0.0);
        let severity = self.adjusted_severity(confidence);

        let entry = results
            .entry(field_name.to_string())
            .or_insert_with(FieldValidation::valid);
        entry.errors.push(message);
        if severity == ValidationStatus::Error || entry.status == ValidationStatus::Valid {
            entry.status = merge_status(entry.status, severity);
        }
    }

    fn finalize(&self, field: &ExtractedField, issues: Vec<Issue>) -> FieldValidation {
        if issues.is_empty() {
            return FieldValidation::valid();
        }
        let severity = self.adjusted_severity(field.confidence.get());
        debug!(
            field = field.field_name.as_str(),
            confidence = field.confidence.get(),
            issues = issues.len(),
            severity = %severity,
            "Validation issues found"
        );
        FieldValidation {
            status: severity,
            errors: issues.into_iter().map(|i| i.message).collect(),
        }
    }

    /// Severity adjustment by confidence: confident-and-wrong promotes to
    /// error, guessing demotes to warning
    fn adjusted_severity(&self, confidence: f64) -> ValidationStatus {
        if confidence >= self.settings.high_confidence {
            ValidationStatus::Error
        } else if confidence < self.settings.low_confidence {
            ValidationStatus::Warning
        } else {
            ValidationStatus::Error
        }
    }
}

fn merge_status(current: ValidationStatus, incoming: ValidationStatus) -> ValidationStatus {
    use ValidationStatus::*;
    match (current, incoming) {
        (Error, _) | (_, Error) => Error,
        (Warning, _) | (_, Warning) => Warning,
        _ => incoming,
    }
}

fn variant_name(value: &FieldValue) -> &'static str {
    match value {
        FieldValue::Scalar { .. } => "scalar",
        FieldValue::Number { .. } => "number",
        FieldValue::Array { .. } => "array",
        FieldValue::Table { .. } => "table",
        FieldValue::ArrayOfObjects { .. } => "array_of_objects",
    }
}

struct Issue {
    message: String,
}

impl Issue {
    fn error(message: String) -> Self {
        Self { message }
    }
}
