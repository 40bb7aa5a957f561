// Builder Patterns
// Fluent builders for the objects callers assemble by hand: templates and
// canonical field mappings. Validating setters return Result so invalid
// names fail at the call site, not deep inside the store.

use anyhow::{ensure, Result};
use std::collections::HashMap;

use crate::canonical::{AggregationType, CanonicalMapping};
use crate::contracts::{FieldSpec, Template};
use crate::types::{FieldType, TemplateKind, ValidatedFieldName, ValidatedTemplateName};

/// Fluent builder for templates
///
/// ```
/// use paperdb::builders::TemplateBuilder;
/// use paperdb::types::{FieldType, TemplateKind};
///
/// let template = TemplateBuilder::new("Invoice")?
///     .kind(TemplateKind::Invoice)
///     .field("invoice_number", FieldType::Text)?
///     .required_field("invoice_total", FieldType::Number)?
///     .primary_field("vendor", FieldType::Text)?
///     .sample_text("INVOICE #1042")
///     .build()?;
/// assert_eq!(template.fields.len(), 3);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct TemplateBuilder {
    name: ValidatedTemplateName,
    kind: TemplateKind,
    fields: Vec<FieldSpec>,
    sample_text: Option<String>,
}

impl TemplateBuilder {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            name: ValidatedTemplateName::new(name)?,
            kind: TemplateKind::Generic,
            fields: Vec::new(),
            sample_text: None,
        })
    }

    pub fn kind(mut self, kind: TemplateKind) -> Self {
        self.kind = kind;
        self
    }

    /// Add an optional field
    pub fn field(mut self, name: &str, field_type: FieldType) -> Result<Self> {
        self.fields
            .push(FieldSpec::new(ValidatedFieldName::new(name)?, field_type));
        Ok(self)
    }

    /// Add a required field
    pub fn required_field(mut self, name: &str, field_type: FieldType) -> Result<Self> {
        let mut spec = FieldSpec::new(ValidatedFieldName::new(name)?, field_type);
        spec.required = true;
        self.fields.push(spec);
        Ok(self)
    }

    /// Add a primary field (indexed in the middle weight band)
    pub fn primary_field(mut self, name: &str, field_type: FieldType) -> Result<Self> {
        let mut spec = FieldSpec::new(ValidatedFieldName::new(name)?, field_type);
        spec.primary = true;
        self.fields.push(spec);
        Ok(self)
    }

    /// Describe the most recently added field
    pub fn description(mut self, text: impl Into<String>) -> Result<Self> {
        let last = self
            .fields
            .last_mut()
            .ok_or_else(|| anyhow::anyhow!("description() requires a field first"))?;
        last.description = text.into();
        Ok(self)
    }

    /// Add an extraction hint to the most recently added field
    pub fn hint(mut self, text: impl Into<String>) -> Result<Self> {
        let last = self
            .fields
            .last_mut()
            .ok_or_else(|| anyhow::anyhow!("hint() requires a field first"))?;
        last.extraction_hints.push(text.into());
        Ok(self)
    }

    /// Override the review threshold for the most recently added field
    pub fn confidence_threshold(mut self, threshold: f64) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&threshold),
            "Confidence threshold must be in [0, 1]"
        );
        let last = self
            .fields
            .last_mut()
            .ok_or_else(|| anyhow::anyhow!("confidence_threshold() requires a field first"))?;
        last.confidence_threshold = Some(threshold);
        Ok(self)
    }

    pub fn sample_text(mut self, text: impl Into<String>) -> Self {
        self.sample_text = Some(text.into());
        self
    }

    pub fn build(self) -> Result<Template> {
        ensure!(!self.fields.is_empty(), "Template needs at least one field");
        let mut template = Template::new(self.name, self.kind, self.fields)?;
        template.sample_text = self.sample_text;
        Ok(template)
    }
}

/// Fluent builder for canonical field mappings
pub struct CanonicalMappingBuilder {
    canonical_name: String,
    aggregation_type: AggregationType,
    field_mappings: HashMap<String, String>,
    aliases: Vec<String>,
}

impl CanonicalMappingBuilder {
    pub fn new(canonical_name: impl Into<String>, aggregation_type: AggregationType) -> Self {
        Self {
            canonical_name: canonical_name.into(),
            aggregation_type,
            field_mappings: HashMap::new(),
            aliases: Vec::new(),
        }
    }

    /// Map a template name to its concrete field
    pub fn map(mut self, template_name: &str, field_name: &str) -> Self {
        self.field_mappings
            .insert(template_name.to_string(), field_name.to_string());
        self
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }

    pub fn build(self) -> Result<CanonicalMapping> {
        let mut mapping = CanonicalMapping::new(self.canonical_name, self.aggregation_type)?;
        mapping.field_mappings = self.field_mappings;
        mapping.aliases = self.aliases;
        Ok(mapping)
    }
}
