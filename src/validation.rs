// Validation Functions
// Free-function validators shared by the validated types and the index layer.
// Newtypes in types.rs call into these so invariants live in exactly one place.

use anyhow::{ensure, Result};

/// Validators for names that end up as index keys
pub mod field {
    use super::*;

    /// Validate an extracted-field or template-field name
    ///
    /// # Invariants
    /// - Non-empty after trimming
    /// - Max 128 characters
    /// - Only alphanumeric, underscore, dash, space
    /// - Must start with an alphanumeric character
    pub fn validate_field_name(name: &str) -> Result<()> {
        let trimmed = name.trim();
        ensure!(!trimmed.is_empty(), "Field name cannot be empty");
        ensure!(
            trimmed.len() <= 128,
            "Field name too long (max 128 characters)"
        );
        ensure!(
            trimmed
                .chars()
                .next()
                .map(|c| c.is_alphanumeric())
                .unwrap_or(false),
            "Field name must start with an alphanumeric character"
        );
        ensure!(
            trimmed
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == ' '),
            "Field name contains invalid characters: {}",
            trimmed
        );
        Ok(())
    }

    /// Validate a template name
    ///
    /// Same character set as field names but allows up to 256 characters.
    pub fn validate_template_name(name: &str) -> Result<()> {
        let trimmed = name.trim();
        ensure!(!trimmed.is_empty(), "Template name cannot be empty");
        ensure!(
            trimmed.len() <= 256,
            "Template name too long (max 256 characters)"
        );
        ensure!(
            trimmed
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == ' '),
            "Template name contains invalid characters: {}",
            trimmed
        );
        Ok(())
    }

    /// Validate a canonical field name (e.g. "amount", "entity_name")
    ///
    /// Canonical names are lowercase snake_case identifiers.
    pub fn validate_canonical_name(name: &str) -> Result<()> {
        ensure!(!name.is_empty(), "Canonical name cannot be empty");
        ensure!(
            name.len() <= 64,
            "Canonical name too long (max 64 characters)"
        );
        ensure!(
            name.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'),
            "Canonical name must be lowercase snake_case: {}",
            name
        );
        Ok(())
    }
}

/// Validators for uploaded file metadata
pub mod file {
    use super::*;

    /// Validate an uploaded filename
    ///
    /// # Invariants
    /// - Non-empty
    /// - Max 255 bytes (filesystem limit)
    /// - No path separators, traversal, or null bytes
    pub fn validate_file_name(name: &str) -> Result<()> {
        ensure!(!name.is_empty(), "Filename cannot be empty");
        ensure!(name.len() <= 255, "Filename too long (max 255 bytes)");
        ensure!(!name.contains('\0'), "Filename contains null byte");
        ensure!(
            !name.contains('/') && !name.contains('\\'),
            "Filename must not contain path separators"
        );
        ensure!(
            name != "." && name != "..",
            "Filename must not be a directory reference"
        );
        Ok(())
    }

    /// Validate a storage directory path for opening the store
    pub fn validate_store_directory(path: &str) -> Result<()> {
        ensure!(!path.is_empty(), "Store path cannot be empty");
        ensure!(path.len() < 4096, "Store path too long");
        ensure!(!path.contains('\0'), "Store path contains null byte");
        Ok(())
    }
}

/// Validators for the query path
pub mod query {
    use super::*;

    /// Validate and sanitize a natural-language query
    ///
    /// # Invariants
    /// - Non-empty after trimming
    /// - Max 1024 characters
    /// - Control characters stripped
    pub fn sanitize_query(raw: &str) -> Result<String> {
        let cleaned: String = raw
            .chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
            .collect();
        let trimmed = cleaned.trim();
        ensure!(!trimmed.is_empty(), "Query cannot be empty");
        ensure!(trimmed.len() <= 1024, "Query too long (max 1024 characters)");
        Ok(trimmed.to_string())
    }

    /// Validate a result limit
    pub fn validate_limit(limit: usize, max: usize) -> Result<()> {
        ensure!(limit > 0, "Limit must be greater than zero");
        ensure!(limit <= max, "Limit exceeds maximum of {}", max);
        Ok(())
    }
}

/// Validators applied at index time
pub mod index {
    /// Maximum coordinate value accepted for a source bounding box.
    pub const MAX_BBOX_COORDINATE: f64 = 10_000.0;

    /// Check whether a bounding box is plausible enough to index.
    ///
    /// Boxes with any coordinate above 10,000 or a non-positive extent are
    /// rejected; callers replace them with None rather than failing the field.
    pub fn bbox_is_plausible(x: f64, y: f64, width: f64, height: f64) -> bool {
        let coords_ok = [x, y, width, height]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0 && *v <= MAX_BBOX_COORDINATE);
        coords_ok && width > 0.0 && height > 0.0
    }
}
