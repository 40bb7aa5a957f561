// Canonical Field Registry
// Cross-template semantic names (e.g. "amount", "entity_name") that expand at
// query time into the concrete field of each template. Process-wide state:
// readers grab an immutable snapshot, edits swap the snapshot copy-on-write.

use anyhow::{ensure, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Default aggregation semantics attached to a canonical name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationType {
    Sum,
    Avg,
    Count,
    Terms,
    DateHistogram,
}

/// One canonical name with its per-template field mappings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMapping {
    pub canonical_name: String,
    /// Explicit template-name -> field-name mappings (user-editable)
    pub field_mappings: HashMap<String, String>,
    pub aggregation_type: AggregationType,
    pub aliases: Vec<String>,
    /// Fallback substrings matched against field names when no explicit
    /// mapping exists for a template
    pub default_patterns: Vec<String>,
}

impl CanonicalMapping {
    pub fn new(canonical_name: impl Into<String>, aggregation_type: AggregationType) -> Result<Self> {
        let canonical_name = canonical_name.into();
        crate::validation::field::validate_canonical_name(&canonical_name)?;
        Ok(Self {
            canonical_name,
            field_mappings: HashMap::new(),
            aggregation_type,
            aliases: Vec::new(),
            default_patterns: Vec::new(),
        })
    }

    fn with_patterns(mut self, patterns: &[&str]) -> Self {
        self.default_patterns = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Resolve this canonical name under one template's field list
    pub fn resolve_for_template(
        &self,
        template_name: &str,
        field_names: &[String],
    ) -> Option<String> {
        if let Some(field) = self.field_mappings.get(template_name) {
            if field_names.iter().any(|f| f == field) {
                return Some(field.clone());
            }
        }
        // Fallback: first declared field whose name contains a pattern
        for field in field_names {
            let lowered = field.to_lowercase();
            if self
                .default_patterns
                .iter()
                .any(|p| lowered.contains(p.as_str()))
            {
                return Some(field.clone());
            }
        }
        None
    }
}

/// Immutable snapshot shared with readers
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    mappings: HashMap<String, CanonicalMapping>,
    /// alias (lowercase) -> canonical name
    alias_index: HashMap<String, String>,
}

impl RegistrySnapshot {
    fn rebuild_aliases(&mut self) {
        self.alias_index.clear();
        for (name, mapping) in &self.mappings {
            self.alias_index.insert(name.clone(), name.clone());
            for alias in &mapping.aliases {
                self.alias_index
                    .insert(alias.to_lowercase(), name.clone());
            }
        }
    }
}

/// Process-wide canonical registry
///
/// Reads are lock-free after the Arc clone; template edits and user mapping
/// changes build a new snapshot and swap it in.
pub struct CanonicalRegistry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl Default for CanonicalRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl CanonicalRegistry {
    /// Empty registry (no canonical names at all)
    pub fn empty() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
        }
    }

    /// Registry seeded with the built-in canonical categories
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        for mapping in Self::default_mappings() {
            registry
                .upsert(mapping)
                .expect("Built-in canonical mappings are valid");
        }
        registry
    }

    fn default_mappings() -> Vec<CanonicalMapping> {
        use AggregationType::*;
        vec![
            CanonicalMapping::new("amount", Sum)
                .expect("valid")
                .with_patterns(&["amount", "total", "price", "cost", "value", "subtotal"]),
            CanonicalMapping::new("date", DateHistogram)
                .expect("valid")
                .with_patterns(&["date"]),
            CanonicalMapping::new("start_date", DateHistogram)
                .expect("valid")
                .with_patterns(&["start_date", "effective_date", "issue_date", "order_date"]),
            CanonicalMapping::new("end_date", DateHistogram)
                .expect("valid")
                .with_patterns(&["end_date", "expiration_date", "due_date", "termination_date"]),
            CanonicalMapping::new("entity_name", Terms)
                .expect("valid")
                .with_patterns(&[
                    "vendor", "supplier", "customer", "client", "party", "company", "merchant",
                    "payee",
                ]),
            CanonicalMapping::new("identifier", Terms)
                .expect("valid")
                .with_patterns(&["number", "reference", "invoice_no", "po_no", "id"]),
            CanonicalMapping::new("status", Terms)
                .expect("valid")
                .with_patterns(&["status", "state"]),
            CanonicalMapping::new("description", Terms)
                .expect("valid")
                .with_patterns(&["description", "memo", "notes", "summary"]),
            CanonicalMapping::new("quantity", Sum)
                .expect("valid")
                .with_patterns(&["quantity", "qty", "count", "units"]),
            CanonicalMapping::new("address", Terms)
                .expect("valid")
                .with_patterns(&["address", "street", "city"]),
            CanonicalMapping::new("contact", Terms)
                .expect("valid")
                .with_patterns(&["contact", "email", "phone"]),
        ]
    }

    /// Current snapshot for lock-free reads
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().clone()
    }

    /// Insert or replace a canonical mapping (copy-on-write swap)
    pub fn upsert(&self, mapping: CanonicalMapping) -> Result<()> {
        crate::validation::field::validate_canonical_name(&mapping.canonical_name)?;
        let mut guard = self.snapshot.write();
        let mut next = RegistrySnapshot {
            mappings: guard.mappings.clone(),
            alias_index: HashMap::new(),
        };
        next.mappings
            .insert(mapping.canonical_name.clone(), mapping);
        next.rebuild_aliases();
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn remove(&self, canonical_name: &str) -> Result<()> {
        let mut guard = self.snapshot.write();
        ensure!(
            guard.mappings.contains_key(canonical_name),
            "Unknown canonical name: {canonical_name}"
        );
        let mut next = RegistrySnapshot {
            mappings: guard.mappings.clone(),
            alias_index: HashMap::new(),
        };
        next.mappings.remove(canonical_name);
        next.rebuild_aliases();
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn get(&self, canonical_name: &str) -> Option<CanonicalMapping> {
        self.snapshot().mappings.get(canonical_name).cloned()
    }

    pub fn canonical_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().mappings.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a free-text term (canonical name or alias) to a canonical name
    pub fn resolve_term(&self, term: &str) -> Option<String> {
        self.snapshot()
            .alias_index
            .get(&term.to_lowercase())
            .cloned()
    }

    /// Resolve a canonical name under one template's declared fields
    pub fn resolve_for_template(
        &self,
        canonical_name: &str,
        template_name: &str,
        field_names: &[String],
    ) -> Option<String> {
        self.snapshot()
            .mappings
            .get(canonical_name)?
            .resolve_for_template(template_name, field_names)
    }

    /// Expand a canonical name across all templates, yielding
    /// (template_name, field_name) pairs
    pub fn expand(
        &self,
        canonical_name: &str,
        templates: &[(String, Vec<String>)],
    ) -> Vec<(String, String)> {
        let snapshot = self.snapshot();
        let mapping = match snapshot.mappings.get(canonical_name) {
            Some(m) => m,
            None => return Vec::new(),
        };
        templates
            .iter()
            .filter_map(|(template_name, field_names)| {
                mapping
                    .resolve_for_template(template_name, field_names)
                    .map(|field| (template_name.clone(), field))
            })
            .collect()
    }

    /// Load user mappings from disk, merged over the defaults
    pub fn load(path: &Path) -> Result<Self> {
        let registry = Self::with_defaults();
        if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read canonical mappings: {}", path.display()))?;
            let user_mappings: Vec<CanonicalMapping> = serde_json::from_str(&raw)
                .with_context(|| "Failed to parse canonical mappings")?;
            for mapping in user_mappings {
                registry.upsert(mapping)?;
            }
        }
        Ok(registry)
    }

    /// Persist the full mapping set
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        let mut mappings: Vec<&CanonicalMapping> = snapshot.mappings.values().collect();
        mappings.sort_by(|a, b| a.canonical_name.cmp(&b.canonical_name));
        let raw = serde_json::to_string_pretty(&mappings)
            .context("Failed to serialize canonical mappings")?;
        std::fs::write(path, raw)
            .with_context(|| format!("Failed to write canonical mappings: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn template(name: &str, fields: &[&str]) -> (String, Vec<String>) {
        (
            name.to_string(),
            fields.iter().map(|f| f.to_string()).collect(),
        )
    }

    #[test]
    fn test_defaults_cover_required_categories() {
        let registry = CanonicalRegistry::with_defaults();
        let names = registry.canonical_names();
        for required in [
            "amount",
            "date",
            "start_date",
            "end_date",
            "entity_name",
            "identifier",
            "status",
            "description",
            "quantity",
            "address",
            "contact",
        ] {
            assert!(names.contains(&required.to_string()), "missing {required}");
        }
    }

    #[test]
    fn test_explicit_mapping_wins_over_pattern() {
        let registry = CanonicalRegistry::with_defaults();
        let mut revenue =
            CanonicalMapping::new("revenue", AggregationType::Sum).unwrap();
        revenue
            .field_mappings
            .insert("Invoice".to_string(), "invoice_total".to_string());
        revenue
            .field_mappings
            .insert("Receipt".to_string(), "payment_amount".to_string());
        revenue
            .field_mappings
            .insert("Contract".to_string(), "contract_value".to_string());
        revenue.aliases = vec!["sales".to_string(), "income".to_string(), "total".to_string()];
        registry.upsert(revenue).unwrap();

        let templates = vec![
            template("Invoice", &["invoice_number", "invoice_total", "vendor"]),
            template("Receipt", &["payment_amount", "merchant"]),
            template("Contract", &["contract_value", "party_a"]),
        ];

        let mut expanded = registry.expand("revenue", &templates);
        expanded.sort();
        assert_eq!(
            expanded,
            vec![
                ("Contract".to_string(), "contract_value".to_string()),
                ("Invoice".to_string(), "invoice_total".to_string()),
                ("Receipt".to_string(), "payment_amount".to_string()),
            ]
        );

        assert_eq!(registry.resolve_term("sales"), Some("revenue".to_string()));
        assert_eq!(registry.resolve_term("SALES"), Some("revenue".to_string()));
    }

    #[test]
    fn test_pattern_fallback() {
        let registry = CanonicalRegistry::with_defaults();
        let templates = vec![
            template("Invoice", &["invoice_number", "invoice_total", "vendor"]),
            template("Memo", &["subject", "body"]),
        ];

        let expanded = registry.expand("amount", &templates);
        assert_eq!(
            expanded,
            vec![("Invoice".to_string(), "invoice_total".to_string())]
        );

        let entities = registry.expand("entity_name", &templates);
        assert_eq!(
            entities,
            vec![("Invoice".to_string(), "vendor".to_string())]
        );
    }

    #[test]
    fn test_copy_on_write_isolation() {
        let registry = CanonicalRegistry::with_defaults();
        let before = registry.snapshot();

        registry
            .upsert(CanonicalMapping::new("revenue", AggregationType::Sum).unwrap())
            .unwrap();

        // The old snapshot is untouched; new readers see the addition
        assert!(!before.mappings.contains_key("revenue"));
        assert!(registry.get("revenue").is_some());
    }

    #[test]
    fn test_rejects_invalid_canonical_names() {
        let registry = CanonicalRegistry::empty();
        assert!(CanonicalMapping::new("Bad Name", AggregationType::Sum).is_err());
        assert!(registry
            .upsert(CanonicalMapping {
                canonical_name: "Not Snake".to_string(),
                field_mappings: HashMap::new(),
                aggregation_type: AggregationType::Sum,
                aliases: vec![],
                default_patterns: vec![],
            })
            .is_err());
    }

    #[test]
    fn test_load_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canonical.json");

        let registry = CanonicalRegistry::with_defaults();
        let mut revenue = CanonicalMapping::new("revenue", AggregationType::Sum).unwrap();
        revenue.aliases = vec!["sales".to_string()];
        registry.upsert(revenue).unwrap();
        registry.save(&path).unwrap();

        let loaded = CanonicalRegistry::load(&path).unwrap();
        assert!(loaded.get("revenue").is_some());
        assert_eq!(loaded.resolve_term("sales"), Some("revenue".to_string()));
        // Defaults still present after merge
        assert!(loaded.get("amount").is_some());
    }
}
