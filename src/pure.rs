// Pure Functions
// Algorithmic kernels with no I/O and no hidden state. Keeping these pure
// makes the priority and ranking invariants directly property-testable.

use std::collections::HashMap;

use crate::types::{AuditPriority, ValidatedDocumentId, ValidationStatus};

/// Derive the audit priority for an extracted field
///
/// Pure function of (confidence, validation status, thresholds):
///
/// | confidence            | validation | priority     |
/// |-----------------------|------------|--------------|
/// | < review_threshold    | error      | 0 (critical) |
/// | < review_threshold    | *          | 1 (high)     |
/// | >= review_threshold   | error      | 1 (high)     |
/// | >= review_threshold   | warning    | 2 (medium)   |
/// | >= high_confidence    | valid      | 3 (low)      |
///
/// A valid field between the two thresholds lands at medium: the rule said
/// nothing is wrong but the extractor was not confident enough to skip review.
/// Unchecked validation is treated like a warning.
pub fn compute_audit_priority(
    confidence: f64,
    validation: ValidationStatus,
    review_threshold: f64,
    high_confidence: f64,
) -> AuditPriority {
    let below_review = confidence < review_threshold;
    match (below_review, validation) {
        (true, ValidationStatus::Error) => AuditPriority::Critical,
        (true, _) => AuditPriority::High,
        (false, ValidationStatus::Error) => AuditPriority::High,
        (false, ValidationStatus::Warning) | (false, ValidationStatus::Unchecked) => {
            AuditPriority::Medium
        }
        (false, ValidationStatus::Valid) => {
            if confidence >= high_confidence {
                AuditPriority::Low
            } else {
                AuditPriority::Medium
            }
        }
    }
}

/// Merge keyword and semantic rankings with Reciprocal Rank Fusion
///
/// score(d) = alpha * 1/(k + rank_kw(d)) + (1 - alpha) * 1/(k + rank_sem(d))
/// where ranks are 1-based and a document absent from a ranking contributes
/// nothing from that side. Result is sorted by fused score descending.
pub fn reciprocal_rank_fusion(
    keyword_ranked: &[ValidatedDocumentId],
    semantic_ranked: &[ValidatedDocumentId],
    k: f64,
    alpha: f64,
) -> Vec<(ValidatedDocumentId, f64)> {
    let mut fused: HashMap<ValidatedDocumentId, f64> = HashMap::new();

    for (rank, id) in keyword_ranked.iter().enumerate() {
        *fused.entry(*id).or_insert(0.0) += alpha / (k + (rank + 1) as f64);
    }
    for (rank, id) in semantic_ranked.iter().enumerate() {
        *fused.entry(*id).or_insert(0.0) += (1.0 - alpha) / (k + (rank + 1) as f64);
    }

    let mut result: Vec<(ValidatedDocumentId, f64)> = fused.into_iter().collect();
    result.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    result
}

/// Normalize raw scores into [0, 1] by dividing by the maximum
///
/// An all-zero or empty slice is left untouched.
pub fn normalize_scores(scores: &mut [f64]) {
    let max = scores.iter().cloned().fold(0.0_f64, f64::max);
    if max > 0.0 {
        for score in scores.iter_mut() {
            *score /= max;
        }
    }
}

/// Final ordering score: verified fields avoid the unverified penalty
pub fn ordering_score(fused_score: f64, has_verified_fields: bool, unverified_penalty: f64) -> f64 {
    if has_verified_fields {
        fused_score
    } else {
        fused_score * (1.0 - unverified_penalty)
    }
}

/// A window of `radius` characters on either side of [start, end)
///
/// Offsets are clamped to char boundaries so multibyte text never panics.
pub fn snippet_window(text: &str, start: usize, end: usize, radius: usize) -> String {
    let from = start.saturating_sub(radius);
    let to = (end + radius).min(text.len());

    let mut from = from.min(text.len());
    while from > 0 && !text.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = to;
    while to < text.len() && !text.is_char_boundary(to) {
        to += 1;
    }

    text[from..to].to_string()
}

/// Lowercase alphanumeric tokens, splitting on everything else
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Tokens that occur in both sets, for template tie-breaking
pub fn overlap_count(left: &[String], right: &[String]) -> usize {
    let right_set: std::collections::HashSet<&str> =
        right.iter().map(|s| s.as_str()).collect();
    left.iter().filter(|t| right_set.contains(t.as_str())).count()
}

/// Parse a monetary or plain numeric string ("$5,000.00", "-500.00", "1 200")
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-' || *c == '+')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a date in the formats documents actually carry
///
/// Accepts RFC 3339, ISO dates, US slash dates, and long-form dates like
/// "June 5, 2025".
pub fn parse_date(raw: &str) -> Option<chrono::NaiveDate> {
    let trimmed = raw.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.date_naive());
    }
    for format in ["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y", "%B %d, %Y", "%b %d, %Y"] {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(trimmed, format) {
            return Some(date);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_priority_table() {
        use AuditPriority::*;
        use ValidationStatus::*;
        let rt = 0.60;
        let hc = 0.85;

        assert_eq!(compute_audit_priority(0.30, Error, rt, hc), Critical);
        assert_eq!(compute_audit_priority(0.30, Warning, rt, hc), High);
        assert_eq!(compute_audit_priority(0.30, Valid, rt, hc), High);
        assert_eq!(compute_audit_priority(0.92, Error, rt, hc), High);
        assert_eq!(compute_audit_priority(0.75, Warning, rt, hc), Medium);
        assert_eq!(compute_audit_priority(0.92, Valid, rt, hc), Low);
        assert_eq!(compute_audit_priority(0.75, Valid, rt, hc), Medium);
    }

    #[test]
    fn test_priority_boundary_is_strict() {
        // Exactly at the review threshold counts as not-below
        assert_eq!(
            compute_audit_priority(0.60, ValidationStatus::Error, 0.60, 0.85),
            AuditPriority::High
        );
        assert_eq!(
            compute_audit_priority(0.85, ValidationStatus::Valid, 0.60, 0.85),
            AuditPriority::Low
        );
    }

    proptest! {
        // Priority purity: same inputs, same output, for any threshold config
        #[test]
        fn priority_is_pure_and_total(
            confidence in 0.0f64..=1.0,
            review in 0.0f64..=1.0,
            high in 0.0f64..=1.0,
            status_idx in 0usize..4,
        ) {
            let status = [
                ValidationStatus::Valid,
                ValidationStatus::Warning,
                ValidationStatus::Error,
                ValidationStatus::Unchecked,
            ][status_idx];

            let first = compute_audit_priority(confidence, status, review, high);
            let second = compute_audit_priority(confidence, status, review, high);
            prop_assert_eq!(first, second);

            // Errors below the review threshold are always critical
            if confidence < review && status == ValidationStatus::Error {
                prop_assert_eq!(first, AuditPriority::Critical);
            }
            // Low priority requires a valid field
            if first == AuditPriority::Low {
                prop_assert_eq!(status, ValidationStatus::Valid);
            }
        }
    }

    #[test]
    fn test_rrf_prefers_documents_in_both_rankings() {
        let a = ValidatedDocumentId::new();
        let b = ValidatedDocumentId::new();
        let c = ValidatedDocumentId::new();

        let fused = reciprocal_rank_fusion(&[a, b], &[b, c], 60.0, 0.5);
        assert_eq!(fused[0].0, b);
        assert_eq!(fused.len(), 3);
    }

    #[test]
    fn test_rrf_alpha_one_is_keyword_only() {
        let a = ValidatedDocumentId::new();
        let b = ValidatedDocumentId::new();

        let fused = reciprocal_rank_fusion(&[a], &[b], 60.0, 1.0);
        let b_score = fused.iter().find(|(id, _)| *id == b).unwrap().1;
        assert_eq!(b_score, 0.0);
    }

    #[test]
    fn test_normalize_scores() {
        let mut scores = vec![2.0, 1.0, 4.0];
        normalize_scores(&mut scores);
        assert_eq!(scores, vec![0.5, 0.25, 1.0]);

        let mut zeros = vec![0.0, 0.0];
        normalize_scores(&mut zeros);
        assert_eq!(zeros, vec![0.0, 0.0]);
    }

    #[test]
    fn test_ordering_score_penalizes_unverified() {
        assert_eq!(ordering_score(0.8, true, 0.05), 0.8);
        assert!((ordering_score(0.8, false, 0.05) - 0.76).abs() < 1e-9);
    }

    #[test]
    fn test_snippet_window_char_boundaries() {
        let text = "caffè latte réceipt for the café on the corner";
        let pos = text.find("réceipt").unwrap();
        let snippet = snippet_window(text, pos, pos + "réceipt".len(), 8);
        assert!(snippet.contains("réceipt"));

        // Radius larger than the text clamps cleanly
        let all = snippet_window(text, 0, text.len(), 500);
        assert_eq!(all, text);
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Invoice #1234: $5,000.00"),
            vec!["invoice", "1234", "5", "000", "00"]
        );
        assert!(tokenize("---").is_empty());
    }

    #[test]
    fn test_overlap_count() {
        let left = vec!["invoice_number".to_string(), "total".to_string()];
        let right = vec!["total".to_string(), "vendor".to_string()];
        assert_eq!(overlap_count(&left, &right), 1);
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("$5,000.00"), Some(5000.0));
        assert_eq!(parse_number("-500.00"), Some(-500.0));
        assert_eq!(parse_number("1 200"), Some(1200.0));
        assert_eq!(parse_number("n/a"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn test_parse_date() {
        use chrono::NaiveDate;
        let expected = NaiveDate::from_ymd_opt(2025, 6, 5).unwrap();
        assert_eq!(parse_date("2025-06-05"), Some(expected));
        assert_eq!(parse_date("06/05/2025"), Some(expected));
        assert_eq!(parse_date("June 5, 2025"), Some(expected));
        assert_eq!(parse_date("not a date"), None);
    }
}
