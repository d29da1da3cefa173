use super::MetricsError;
use lazy_static::lazy_static;
use regex::Regex;

/// Longest accepted dotted path.
pub const MAX_PATH_LEN: usize = 128;

lazy_static! {
    // Dotted identifier segments, each starting with a letter, at most 32
    // characters long. Paths are spliced into SQL (JSONB paths cannot be
    // bound as parameters), so nothing outside this shape may pass.
    static ref PATH_RE: Regex =
        Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,31}(\.[A-Za-z][A-Za-z0-9_]{0,31})*$").unwrap();
}

pub fn validate_path(path: &str) -> Result<(), MetricsError> {
    if path.len() > MAX_PATH_LEN || !PATH_RE.is_match(path) {
        return Err(MetricsError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// `cpu.total` → `cpu,total`, ready for `data #> '{cpu,total}'`. Only ever
/// called on a validated path.
pub fn path_to_jsonb_selector(path: &str) -> String {
    path.split('.').collect::<Vec<_>>().join(",")
}
