//! Identifier and limit sanitizers for values spliced into query templates.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static SAFE_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[A-Z0-9_#$@]{1,128}$").expect("identifier pattern"));

static SPECIAL_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\*[A-Z0-9_]+$").expect("special value pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("invalid {what}: {value:?}")]
pub struct IdentError {
    pub what: String,
    pub value: String,
}

impl IdentError {
    fn new(what: &str, value: &str) -> Self {
        Self {
            what: what.to_string(),
            value: value.to_string(),
        }
    }
}

/// Accepts a bare system identifier and returns it upper-cased.
pub fn safe_ident(value: &str, what: &str) -> Result<String, IdentError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || !SAFE_IDENT.is_match(trimmed) {
        return Err(IdentError::new(what, value));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// Like [`safe_ident`], but also accepts special values such as `*ALL` or
/// `*LIBL`.
pub fn safe_ident_or_special(value: &str, what: &str) -> Result<String, IdentError> {
    let trimmed = value.trim();
    if trimmed.starts_with('*') {
        if !SPECIAL_VALUE.is_match(trimmed) {
            return Err(IdentError::new(what, value));
        }
        return Ok(trimmed.to_ascii_uppercase());
    }
    safe_ident(value, what)
}

/// Validates every entry of a comma separated list. Blank entries are
/// skipped; an all-blank list yields an empty string.
pub fn safe_csv_idents(value: &str, what: &str) -> Result<String, IdentError> {
    let parts = value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| safe_ident(part, what))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join(","))
}

/// Clamps a caller-supplied row limit into `1..=max`, falling back to
/// `default` when the caller gave nothing.
pub fn safe_limit(requested: Option<i64>, default: usize, max: usize) -> usize {
    let max = max.max(1);
    match requested {
        None => default.clamp(1, max),
        Some(n) if n < 1 => 1,
        Some(n) => usize::try_from(n).map_or(max, |n| n.min(max)),
    }
}
