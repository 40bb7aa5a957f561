// Query Planner
// Turns a natural-language query into an executable Plan: intent detection by
// keyword heuristics, range/date/entity filter extraction, canonical field
// resolution, synonym expansion, and a confidence score that decides between
// the fast path and LLM refinement.

use anyhow::{Context, Result};
use chrono::{Datelike, Duration, NaiveDate, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::canonical::{AggregationType, CanonicalRegistry};
use crate::config::PlannerSettings;
use crate::contracts::{FieldFilter, FilterOp};
use crate::llm_client::LlmClient;
use crate::types::ValidatedTemplateId;

static RANGE_OVER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:over|above|more than|greater than|at least)\s+\$?([\d,]+(?:\.\d+)?)")
        .expect("Invalid over pattern")
});
static RANGE_UNDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:under|below|less than|at most)\s+\$?([\d,]+(?:\.\d+)?)")
        .expect("Invalid under pattern")
});
static RANGE_BETWEEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bbetween\s+\$?([\d,]+(?:\.\d+)?)\s+and\s+\$?([\d,]+(?:\.\d+)?)")
        .expect("Invalid between pattern")
});
static QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"]+)""#).expect("Invalid quoted pattern"));
static PROPER_RUN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)\b").expect("Invalid proper-noun pattern")
});
static QUARTER_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bq([1-4])\s+(\d{4})\b").expect("Invalid quarter pattern"));
static LAST_N_DAYS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\blast\s+(\d{1,3})\s+days?\b").expect("Invalid days pattern"));

/// Domain synonym dictionary used for query expansion
static SYNONYMS: Lazy<HashMap<&'static str, Vec<&'static str>>> = Lazy::new(|| {
    let entries: &[(&str, &[&str])] = &[
        ("invoice", &["bill", "receipt"]),
        ("bill", &["invoice"]),
        ("receipt", &["invoice", "bill"]),
        ("vendor", &["supplier", "seller"]),
        ("supplier", &["vendor"]),
        ("contract", &["agreement"]),
        ("agreement", &["contract"]),
        ("total", &["amount", "sum"]),
        ("amount", &["total", "value"]),
        ("customer", &["client", "buyer"]),
        ("client", &["customer"]),
        ("payment", &["paid", "remittance"]),
        ("po", &["purchase", "order"]),
    ];
    entries
        .iter()
        .map(|(word, syns)| (*word, syns.to_vec()))
        .collect()
});

/// Tokens that carry no retrieval signal once filters are extracted
const STOPWORDS: &[&str] = &[
    "the", "a", "an", "of", "for", "with", "in", "on", "all", "any", "show", "me", "find", "list",
    "get", "what", "which", "was", "is", "are", "and", "or", "to", "from", "over", "under",
    "above", "below", "between", "than", "more", "less", "this", "last", "next", "vs", "versus",
    "compare", "how", "many", "much", "average", "sum",
];

/// Detected query intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    Search,
    Retrieve,
    Filter,
    Aggregate,
    Compare,
}

impl std::fmt::Display for QueryIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Search => "search",
            Self::Retrieve => "retrieve",
            Self::Filter => "filter",
            Self::Aggregate => "aggregate",
            Self::Compare => "compare",
        };
        write!(f, "{name}")
    }
}

/// Aggregation to execute over the hit set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub agg_type: AggregationType,
    /// Field to aggregate; canonical names expand per document
    pub field: String,
    pub canonical: bool,
    /// One bucket for plain aggregates, several for comparisons
    pub time_buckets: Vec<TimeBucket>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeBucket {
    pub label: String,
    pub from: chrono::DateTime<Utc>,
    pub to: chrono::DateTime<Utc>,
}

/// Result ordering requested by the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Relevance,
    CreatedDesc,
}

/// An executable query plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub intent: QueryIntent,
    pub filters: Vec<FieldFilter>,
    pub template_id: Option<ValidatedTemplateId>,
    /// Free-text component after synonym expansion
    pub text_query: String,
    pub aggregation: Option<AggregationSpec>,
    pub sort: SortOrder,
    pub confidence: f64,
    pub use_llm_refinement: bool,
}

impl Plan {
    /// Stable key for the query cache: normalized query + filter set
    pub fn cache_key(raw_query: &str, template_id: Option<ValidatedTemplateId>) -> String {
        let normalized: String = raw_query
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        match template_id {
            Some(id) => format!("{normalized}|{id}"),
            None => normalized,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefinedPlanWire {
    intent: Option<String>,
    text_query: Option<String>,
    #[serde(default)]
    filters: Vec<RefinedFilterWire>,
    aggregation: Option<RefinedAggregationWire>,
}

#[derive(Debug, Deserialize)]
struct RefinedFilterWire {
    field: String,
    #[serde(default)]
    canonical: bool,
    op: String,
    value: Option<f64>,
    low: Option<f64>,
    high: Option<f64>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefinedAggregationWire {
    #[serde(rename = "type")]
    agg_type: String,
    field: String,
    #[serde(default)]
    canonical: bool,
    #[serde(default)]
    time_buckets: Vec<RefinedBucketWire>,
}

#[derive(Debug, Deserialize)]
struct RefinedBucketWire {
    label: Option<String>,
    from: chrono::DateTime<Utc>,
    to: chrono::DateTime<Utc>,
}

pub struct QueryPlanner {
    registry: Arc<CanonicalRegistry>,
    llm: Option<Arc<dyn LlmClient>>,
    settings: PlannerSettings,
    reference_date: Option<NaiveDate>,
}

impl QueryPlanner {
    pub fn new(
        registry: Arc<CanonicalRegistry>,
        llm: Option<Arc<dyn LlmClient>>,
        settings: PlannerSettings,
    ) -> Self {
        Self {
            registry,
            llm,
            settings,
            reference_date: None,
        }
    }

    /// Pin "today" for deterministic date-window resolution in tests
    pub fn with_reference_date(mut self, date: NaiveDate) -> Self {
        self.reference_date = Some(date);
        self
    }

    fn today(&self) -> NaiveDate {
        self.reference_date
            .unwrap_or_else(|| Utc::now().date_naive())
    }

    /// Build a plan for a query; refines through the LLM when the heuristic
    /// confidence misses the fast-path gate
    pub async fn plan(
        &self,
        raw_query: &str,
        template_id: Option<ValidatedTemplateId>,
    ) -> Result<Plan> {
        let query = crate::validation::query::sanitize_query(raw_query)?;
        let mut confidence: f64 = 1.0;

        let intent = self.detect_intent(&query);
        let mut filters = Vec::new();
        let mut consumed_spans: Vec<(usize, usize)> = Vec::new();

        self.extract_range_filters(&query, &mut filters, &mut consumed_spans);
        let date_ambiguous =
            self.extract_date_filters(&query, intent, &mut filters, &mut consumed_spans);
        self.extract_entity_filters(&query, &mut filters, &mut consumed_spans);

        // Aggregation target, resolved through the canonical registry
        let aggregation = self.build_aggregation(&query, intent, &mut confidence);

        // Confidence penalties for the ambiguity signals the heuristics saw
        if intent == QueryIntent::Compare {
            confidence -= 0.30;
        }
        if date_ambiguous {
            confidence -= 0.15;
        }
        if matches!(intent, QueryIntent::Aggregate | QueryIntent::Compare)
            && aggregation.is_none()
        {
            confidence -= 0.25;
        }
        if filters.is_empty() && matches!(intent, QueryIntent::Filter) {
            confidence -= 0.20;
        }
        let confidence = confidence.max(0.0);

        let text_query = self.expand_free_text(&query, &consumed_spans);
        let sort = if text_query.is_empty() {
            SortOrder::CreatedDesc
        } else {
            SortOrder::Relevance
        };

        let use_llm_refinement = confidence < self.settings.fast_path_threshold;
        let plan = Plan {
            intent,
            filters,
            template_id,
            text_query,
            aggregation,
            sort,
            confidence,
            use_llm_refinement,
        };
        debug!(
            intent = %plan.intent,
            confidence = plan.confidence,
            filters = plan.filters.len(),
            llm = plan.use_llm_refinement,
            "Query planned"
        );

        if !plan.use_llm_refinement {
            return Ok(plan);
        }
        match &self.llm {
            Some(llm) => self.refine(llm.as_ref(), &query, plan).await,
            None => Ok(plan),
        }
    }

    /// Reformulation suggestions for zero-result responses, drawn from the
    /// synonym dictionary
    pub fn reformulations(&self, raw_query: &str) -> Vec<String> {
        let tokens = crate::pure::tokenize(raw_query);
        let mut suggestions = Vec::new();
        for token in &tokens {
            if let Some(synonyms) = SYNONYMS.get(token.as_str()) {
                for synonym in synonyms.iter().take(self.settings.max_expansions) {
                    let suggestion = raw_query.to_lowercase().replace(token, synonym);
                    if !suggestions.contains(&suggestion) {
                        suggestions.push(suggestion);
                    }
                }
            }
        }
        suggestions.truncate(5);
        suggestions
    }

    fn detect_intent(&self, query: &str) -> QueryIntent {
        let lowered = query.to_lowercase();
        if lowered.contains(" vs ")
            || lowered.contains(" versus ")
            || lowered.contains("compare")
        {
            return QueryIntent::Compare;
        }
        if lowered.starts_with("how many")
            || lowered.contains("count of")
            || lowered.starts_with("total ")
            || lowered.contains("sum of")
            || lowered.contains("average")
            || lowered.contains("total revenue")
        {
            return QueryIntent::Aggregate;
        }
        if lowered.starts_with("filter") || lowered.starts_with("only ") {
            return QueryIntent::Filter;
        }
        QueryIntent::Retrieve
    }

    fn extract_range_filters(
        &self,
        query: &str,
        filters: &mut Vec<FieldFilter>,
        consumed: &mut Vec<(usize, usize)>,
    ) {
        let field = self.range_target(query);

        if let Some(captures) = RANGE_BETWEEN.captures(query) {
            let low = parse_captured_number(&captures[1]);
            let high = parse_captured_number(&captures[2]);
            if let (Some(low), Some(high)) = (low, high) {
                filters.push(FieldFilter {
                    field: field.clone(),
                    canonical: true,
                    op: FilterOp::Between { low, high },
                });
                mark_span(consumed, &captures, query);
                return;
            }
        }
        if let Some(captures) = RANGE_OVER.captures(query) {
            if let Some(value) = parse_captured_number(&captures[1]) {
                filters.push(FieldFilter {
                    field: field.clone(),
                    canonical: true,
                    op: FilterOp::Gte { value },
                });
                mark_span(consumed, &captures, query);
            }
        }
        if let Some(captures) = RANGE_UNDER.captures(query) {
            if let Some(value) = parse_captured_number(&captures[1]) {
                filters.push(FieldFilter {
                    field,
                    canonical: true,
                    op: FilterOp::Lte { value },
                });
                mark_span(consumed, &captures, query);
            }
        }
    }

    /// The canonical target of a numeric range: an explicitly-named canonical
    /// (or alias) wins, otherwise `amount`
    fn range_target(&self, query: &str) -> String {
        for token in crate::pure::tokenize(query) {
            if let Some(canonical) = self.registry.resolve_term(&token) {
                if canonical != "date" && !canonical.ends_with("_date") {
                    return canonical;
                }
            }
        }
        "amount".to_string()
    }

    /// Returns true when the query mentions time periods the heuristics could
    /// not turn into a concrete interval
    fn extract_date_filters(
        &self,
        query: &str,
        intent: QueryIntent,
        filters: &mut Vec<FieldFilter>,
        consumed: &mut Vec<(usize, usize)>,
    ) -> bool {
        let lowered = query.to_lowercase();
        let today = self.today();

        let mut push_range = |from: NaiveDate, to: NaiveDate| {
            filters.push(FieldFilter {
                field: "date".to_string(),
                canonical: true,
                op: FilterOp::DateRange {
                    from: Utc.from_utc_datetime(&from.and_hms_opt(0, 0, 0).expect("midnight")),
                    to: Utc.from_utc_datetime(&to.and_hms_opt(23, 59, 59).expect("end of day")),
                },
            });
        };

        if let Some(captures) = LAST_N_DAYS.captures(&lowered) {
            if let Ok(days) = captures[1].parse::<i64>() {
                push_range(today - Duration::days(days), today);
                mark_span(consumed, &captures, query);
                return false;
            }
        }
        if let Some(captures) = QUARTER_LITERAL.captures(&lowered) {
            let quarter: u32 = captures[1].parse().unwrap_or(1);
            let year: i32 = captures[2].parse().unwrap_or(today.year());
            let (from, to) = quarter_bounds(year, quarter);
            push_range(from, to);
            mark_span(consumed, &captures, query);
            return false;
        }
        if lowered.contains("last month") {
            let first_of_this = today.with_day(1).expect("first of month");
            let last_month_end = first_of_this - Duration::days(1);
            let last_month_start = last_month_end.with_day(1).expect("first of month");
            push_range(last_month_start, last_month_end);
            return false;
        }
        if lowered.contains("this month") {
            push_range(today.with_day(1).expect("first of month"), today);
            return false;
        }
        if lowered.contains("ytd") || lowered.contains("year to date") {
            push_range(
                NaiveDate::from_ymd_opt(today.year(), 1, 1).expect("jan 1"),
                today,
            );
            return false;
        }
        if lowered.contains("this year") {
            push_range(
                NaiveDate::from_ymd_opt(today.year(), 1, 1).expect("jan 1"),
                today,
            );
            return false;
        }
        if lowered.contains("last year") {
            push_range(
                NaiveDate::from_ymd_opt(today.year() - 1, 1, 1).expect("jan 1"),
                NaiveDate::from_ymd_opt(today.year() - 1, 12, 31).expect("dec 31"),
            );
            return false;
        }

        // Quarter phrases: concrete for plain retrieval, buckets for compares
        let mentions_quarter = lowered.contains("quarter");
        if mentions_quarter && intent != QueryIntent::Compare {
            let quarter = (today.month0() / 3) + 1;
            if lowered.contains("last quarter") && !lowered.contains("this quarter") {
                let (from, to) = previous_quarter_bounds(today.year(), quarter);
                push_range(from, to);
                return false;
            }
            if lowered.contains("this quarter") {
                let (from, _) = quarter_bounds(today.year(), quarter);
                push_range(from, today);
                return false;
            }
            return true;
        }

        // A compare across quarters resolves through time buckets instead of
        // a filter; anything else mentioning a quarter stays ambiguous
        mentions_quarter && intent == QueryIntent::Compare
    }

    fn extract_entity_filters(
        &self,
        query: &str,
        filters: &mut Vec<FieldFilter>,
        consumed: &mut Vec<(usize, usize)>,
    ) {
        for captures in QUOTED.captures_iter(query) {
            if let Some(matched) = captures.get(1) {
                filters.push(FieldFilter {
                    field: "entity_name".to_string(),
                    canonical: true,
                    op: FilterOp::Equals {
                        value: matched.as_str().to_string(),
                    },
                });
                consumed.push((matched.start().saturating_sub(1), matched.end() + 1));
            }
        }
        if filters.iter().any(|f| f.field == "entity_name") {
            return;
        }
        for captures in PROPER_RUN.captures_iter(query) {
            if let Some(matched) = captures.get(1) {
                filters.push(FieldFilter {
                    field: "entity_name".to_string(),
                    canonical: true,
                    op: FilterOp::Equals {
                        value: matched.as_str().to_string(),
                    },
                });
                consumed.push((matched.start(), matched.end()));
                break;
            }
        }
    }

    fn build_aggregation(
        &self,
        query: &str,
        intent: QueryIntent,
        confidence: &mut f64,
    ) -> Option<AggregationSpec> {
        if !matches!(intent, QueryIntent::Aggregate | QueryIntent::Compare) {
            return None;
        }
        let lowered = query.to_lowercase();
        let agg_type = if lowered.starts_with("how many") || lowered.contains("count") {
            AggregationType::Count
        } else if lowered.contains("average") {
            AggregationType::Avg
        } else {
            AggregationType::Sum
        };

        // Find the aggregation target among canonical names and aliases
        let field = crate::pure::tokenize(query)
            .into_iter()
            .find_map(|token| self.registry.resolve_term(&token));
        match field {
            Some(field) => Some(AggregationSpec {
                agg_type,
                field,
                canonical: true,
                time_buckets: Vec::new(),
            }),
            None => {
                // The query wants an aggregate over something the registry
                // does not know; the LLM path has to name the field.
                *confidence -= 0.20;
                None
            }
        }
    }

    /// Free text minus consumed filter spans and stopwords, expanded with
    /// synonyms up to the configured cap
    fn expand_free_text(&self, query: &str, consumed: &[(usize, usize)]) -> String {
        let mut cleaned = String::with_capacity(query.len());
        for (i, ch) in query.char_indices() {
            if consumed.iter().any(|(start, end)| i >= *start && i < *end) {
                cleaned.push(' ');
            } else {
                cleaned.push(ch);
            }
        }

        let mut expanded: Vec<String> = Vec::new();
        for token in crate::pure::tokenize(&cleaned) {
            if STOPWORDS.contains(&token.as_str()) || token.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            if expanded.contains(&token) {
                continue;
            }
            expanded.push(token.clone());
            // Singular form so "invoices" still expands through "invoice"
            let lookup = SYNONYMS
                .get(token.as_str())
                .or_else(|| SYNONYMS.get(token.trim_end_matches('s')));
            if let Some(synonyms) = lookup {
                for synonym in synonyms.iter().take(self.settings.max_expansions) {
                    let synonym = synonym.to_string();
                    if !expanded.contains(&synonym) {
                        expanded.push(synonym);
                    }
                }
            }
        }
        expanded.join(" ")
    }

    async fn refine(&self, llm: &dyn LlmClient, query: &str, heuristic: Plan) -> Result<Plan> {
        let canonical_names = self.registry.canonical_names().join(", ");
        let today = self.today();
        let prompt = format!(
            "You turn business-document questions into structured query plans.\n\
             Today is {today}.\n\
             Canonical fields available: {canonical_names}.\n\n\
             Question: {query}\n\n\
             Produce the plan. Use concrete RFC 3339 timestamps for time buckets. \
             Intents: search, retrieve, filter, aggregate, compare."
        );
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "intent": {"enum": ["search", "retrieve", "filter", "aggregate", "compare"]},
                "text_query": {"type": "string"},
                "filters": {"type": "array", "items": {"type": "object", "properties": {
                    "field": {"type": "string"},
                    "canonical": {"type": "boolean"},
                    "op": {"enum": ["gte", "lte", "between", "equals", "date_range"]},
                    "value": {"type": ["number", "null"]},
                    "low": {"type": ["number", "null"]},
                    "high": {"type": ["number", "null"]},
                    "text": {"type": ["string", "null"]}
                }}},
                "aggregation": {"type": ["object", "null"], "properties": {
                    "type": {"enum": ["sum", "avg", "count", "terms", "date_histogram"]},
                    "field": {"type": "string"},
                    "canonical": {"type": "boolean"},
                    "time_buckets": {"type": "array", "items": {"type": "object", "properties": {
                        "label": {"type": "string"},
                        "from": {"type": "string", "format": "date-time"},
                        "to": {"type": "string", "format": "date-time"}
                    }}}
                }}
            },
            "required": ["intent"]
        });

        let raw = llm.complete_json(&prompt, &schema).await?;
        let refined: RefinedPlanWire =
            serde_json::from_value(raw).context("Refined plan had unexpected shape")?;

        let mut plan = heuristic;
        if let Some(intent) = refined.intent.as_deref().and_then(parse_intent) {
            plan.intent = intent;
        }
        if let Some(text) = refined.text_query {
            plan.text_query = self.expand_free_text(&text, &[]);
        }
        if !refined.filters.is_empty() {
            plan.filters = refined
                .filters
                .into_iter()
                .filter_map(convert_refined_filter)
                .collect();
        }
        if let Some(aggregation) = refined.aggregation {
            plan.aggregation = convert_refined_aggregation(aggregation);
        }
        info!(
            intent = %plan.intent,
            buckets = plan
                .aggregation
                .as_ref()
                .map(|a| a.time_buckets.len())
                .unwrap_or(0),
            "Plan refined via LLM"
        );
        Ok(plan)
    }
}

fn parse_intent(raw: &str) -> Option<QueryIntent> {
    match raw {
        "search" => Some(QueryIntent::Search),
        "retrieve" => Some(QueryIntent::Retrieve),
        "filter" => Some(QueryIntent::Filter),
        "aggregate" => Some(QueryIntent::Aggregate),
        "compare" => Some(QueryIntent::Compare),
        _ => None,
    }
}

fn convert_refined_filter(wire: RefinedFilterWire) -> Option<FieldFilter> {
    let op = match wire.op.as_str() {
        "gte" => FilterOp::Gte { value: wire.value? },
        "lte" => FilterOp::Lte { value: wire.value? },
        "between" => FilterOp::Between {
            low: wire.low?,
            high: wire.high?,
        },
        "equals" => FilterOp::Equals { value: wire.text? },
        _ => return None,
    };
    Some(FieldFilter {
        field: wire.field,
        canonical: wire.canonical,
        op,
    })
}

fn convert_refined_aggregation(wire: RefinedAggregationWire) -> Option<AggregationSpec> {
    let agg_type = match wire.agg_type.as_str() {
        "sum" => AggregationType::Sum,
        "avg" => AggregationType::Avg,
        "count" => AggregationType::Count,
        "terms" => AggregationType::Terms,
        "date_histogram" => AggregationType::DateHistogram,
        _ => return None,
    };
    Some(AggregationSpec {
        agg_type,
        field: wire.field,
        canonical: wire.canonical,
        time_buckets: wire
            .time_buckets
            .into_iter()
            .enumerate()
            .map(|(i, bucket)| TimeBucket {
                label: bucket.label.unwrap_or_else(|| format!("bucket_{i}")),
                from: bucket.from,
                to: bucket.to,
            })
            .collect(),
    })
}

fn parse_captured_number(raw: &str) -> Option<f64> {
    crate::pure::parse_number(raw)
}

fn mark_span(consumed: &mut Vec<(usize, usize)>, captures: &regex::Captures, _query: &str) {
    if let Some(full) = captures.get(0) {
        consumed.push((full.start(), full.end()));
    }
}

fn quarter_bounds(year: i32, quarter: u32) -> (NaiveDate, NaiveDate) {
    let start_month = (quarter - 1) * 3 + 1;
    let from = NaiveDate::from_ymd_opt(year, start_month, 1).expect("quarter start");
    let to = if quarter == 4 {
        NaiveDate::from_ymd_opt(year, 12, 31).expect("year end")
    } else {
        NaiveDate::from_ymd_opt(year, start_month + 3, 1).expect("next quarter") - Duration::days(1)
    };
    (from, to)
}

fn previous_quarter_bounds(year: i32, quarter: u32) -> (NaiveDate, NaiveDate) {
    if quarter == 1 {
        quarter_bounds(year - 1, 4)
    } else {
        quarter_bounds(year, quarter - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedLlm;
    use pretty_assertions::assert_eq;

    fn planner() -> QueryPlanner {
        QueryPlanner::new(
            Arc::new(CanonicalRegistry::with_defaults()),
            None,
            PlannerSettings::default(),
        )
        .with_reference_date(NaiveDate::from_ymd_opt(2025, 5, 15).unwrap())
    }

    #[tokio::test]
    async fn test_fast_path_money_filter() {
        let plan = planner().plan("invoices over $5000", None).await.unwrap();

        assert_eq!(plan.intent, QueryIntent::Retrieve);
        assert!(!plan.use_llm_refinement);
        assert!(plan.confidence >= 0.80);
        assert_eq!(plan.filters.len(), 1);
        assert_eq!(plan.filters[0].field, "amount");
        assert!(plan.filters[0].canonical);
        assert_eq!(plan.filters[0].op, FilterOp::Gte { value: 5000.0 });
        // The money span is consumed; "invoices" expands with synonyms
        assert!(plan.text_query.contains("invoice"));
        assert!(plan.text_query.contains("bill"));
    }

    #[tokio::test]
    async fn test_between_filter() {
        let plan = planner()
            .plan("receipts between $100 and $250", None)
            .await
            .unwrap();
        assert_eq!(
            plan.filters[0].op,
            FilterOp::Between {
                low: 100.0,
                high: 250.0
            }
        );
    }

    #[tokio::test]
    async fn test_date_phrases_resolve_concretely() {
        let plan = planner().plan("invoices from last month", None).await.unwrap();
        let date_filter = plan
            .filters
            .iter()
            .find(|f| f.field == "date")
            .expect("date filter");
        match &date_filter.op {
            FilterOp::DateRange { from, to } => {
                assert_eq!(from.date_naive(), NaiveDate::from_ymd_opt(2025, 4, 1).unwrap());
                assert_eq!(to.date_naive(), NaiveDate::from_ymd_opt(2025, 4, 30).unwrap());
            }
            other => panic!("expected date range, got {other:?}"),
        }

        let plan = planner().plan("purchase orders q4 2024", None).await.unwrap();
        let date_filter = plan.filters.iter().find(|f| f.field == "date").unwrap();
        match &date_filter.op {
            FilterOp::DateRange { from, to } => {
                assert_eq!(from.date_naive(), NaiveDate::from_ymd_opt(2024, 10, 1).unwrap());
                assert_eq!(to.date_naive(), NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
            }
            other => panic!("expected date range, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_entity_extraction() {
        let plan = planner()
            .plan("contracts with \"Pinecone Systems\"", None)
            .await
            .unwrap();
        let entity = plan
            .filters
            .iter()
            .find(|f| f.field == "entity_name")
            .expect("entity filter");
        assert_eq!(
            entity.op,
            FilterOp::Equals {
                value: "Pinecone Systems".to_string()
            }
        );

        // Proper-noun run without quotes
        let plan = planner().plan("invoices from Acme Corp", None).await.unwrap();
        assert!(plan.filters.iter().any(|f| f.field == "entity_name"));
    }

    #[tokio::test]
    async fn test_compare_query_takes_llm_path() {
        let llm = Arc::new(ScriptedLlm::new().with_response(
            r#"{
                "intent": "compare",
                "text_query": "revenue",
                "aggregation": {
                    "type": "sum",
                    "field": "revenue",
                    "canonical": true,
                    "time_buckets": [
                        {"label": "this_quarter", "from": "2025-04-01T00:00:00Z", "to": "2025-06-30T23:59:59Z"},
                        {"label": "last_quarter", "from": "2025-01-01T00:00:00Z", "to": "2025-03-31T23:59:59Z"}
                    ]
                }
            }"#,
        ));
        let planner = QueryPlanner::new(
            Arc::new(CanonicalRegistry::with_defaults()),
            Some(llm.clone()),
            PlannerSettings::default(),
        )
        .with_reference_date(NaiveDate::from_ymd_opt(2025, 5, 15).unwrap());

        let plan = planner
            .plan("total revenue this quarter vs last quarter", None)
            .await
            .unwrap();

        assert!(plan.use_llm_refinement);
        assert!(plan.confidence <= 0.60);
        assert_eq!(llm.call_count(), 1);
        assert_eq!(plan.intent, QueryIntent::Compare);
        let aggregation = plan.aggregation.expect("aggregation");
        assert_eq!(aggregation.agg_type, AggregationType::Sum);
        assert_eq!(aggregation.field, "revenue");
        assert_eq!(aggregation.time_buckets.len(), 2);
    }

    #[tokio::test]
    async fn test_aggregate_with_known_canonical_stays_fast() {
        let plan = planner().plan("how many invoices this year", None).await.unwrap();
        assert_eq!(plan.intent, QueryIntent::Aggregate);
        // "how many" + a concrete date window: no ambiguity penalties apply,
        // but the count target resolves only if a canonical term is present
        assert!(plan.confidence > 0.0);
    }

    #[tokio::test]
    async fn test_reformulations_from_synonyms() {
        let suggestions = planner().reformulations("invoice for catering");
        assert!(suggestions.iter().any(|s| s.contains("bill")));
    }

    #[tokio::test]
    async fn test_no_llm_keeps_heuristic_plan() {
        let plan = planner()
            .plan("compare spend across departments", None)
            .await
            .unwrap();
        // Flag says refinement was wanted; with no client wired the heuristic
        // plan stands
        assert!(plan.use_llm_refinement);
        assert_eq!(plan.intent, QueryIntent::Compare);
    }
}
