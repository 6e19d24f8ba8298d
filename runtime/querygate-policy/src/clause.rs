use std::sync::LazyLock;

use crate::validator::{Rejection, ValidationPolicy, has_comment};

static DEFAULT_POLICY: LazyLock<ValidationPolicy> = LazyLock::new(ValidationPolicy::strict);

/// Checks a caller-supplied fragment (a `WHERE` body, an `ORDER BY` list)
/// before it is spliced into a fixed template. Returns the trimmed fragment.
///
/// Fragments get no parentheses at all, so no subquery or function call can
/// hide inside them. Empty fragments are accepted as empty. Forbidden verbs
/// are checked against the default list.
pub fn validate_clause(clause: &str, clause_kind: &str) -> Result<String, Rejection> {
    let trimmed = clause.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    if trimmed.contains(';') {
        return Err(Rejection::MultiStatement);
    }
    if has_comment(trimmed) {
        return Err(Rejection::CommentNotAllowed);
    }
    if let Some(keyword) = DEFAULT_POLICY.forbidden_match(trimmed) {
        return Err(Rejection::ForbiddenOperation { keyword });
    }
    if trimmed.contains('(') || trimmed.contains(')') {
        return Err(Rejection::ParenthesesNotAllowed {
            clause: clause_kind.to_string(),
        });
    }
    let upper = trimmed.to_ascii_uppercase();
    if upper
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|word| word == "SELECT")
    {
        return Err(Rejection::NestedSelect {
            clause: clause_kind.to_string(),
        });
    }
    Ok(trimmed.to_string())
}
