//! Identifier and bundle validation.

use std::path::Path;

use ocishim_shared::errors::{ShimError, ShimResult};

/// Validate a container or process id.
///
/// Ids become directory names, so only `[A-Za-z0-9_+.-]` is accepted and
/// `.`/`..` are refused.
pub fn validate_id(kind: &str, id: &str) -> ShimResult<()> {
    if id.is_empty() {
        return Err(ShimError::InvalidArgument(format!("{} id cannot be empty", kind)));
    }
    if id == "." || id == ".." {
        return Err(ShimError::InvalidArgument(format!(
            "invalid {} id: {:?}",
            kind, id
        )));
    }
    let valid = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '.' | '-'));
    if !valid {
        return Err(ShimError::InvalidArgument(format!(
            "invalid {} id {:?}: only [A-Za-z0-9_+.-] allowed",
            kind, id
        )));
    }
    Ok(())
}

/// Check that `bundle` is an absolute directory holding a parseable
/// `config.json`.
pub fn validate_bundle(bundle: &Path) -> ShimResult<()> {
    if !bundle.is_absolute() {
        return Err(ShimError::InvalidArgument(format!(
            "bundle must be an absolute path, got: {}",
            bundle.display()
        )));
    }
    let config = bundle.join("config.json");
    oci_spec::runtime::Spec::load(&config).map_err(|e| {
        ShimError::InvalidArgument(format!(
            "invalid bundle {}: cannot load {}: {}",
            bundle.display(),
            config.display(),
            e
        ))
    })?;
    Ok(())
}
