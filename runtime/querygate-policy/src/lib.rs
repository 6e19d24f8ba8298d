//! Read-only SQL acceptance policy.
//!
//! The validator here is a conservative, regex-based acceptor rather than a
//! parser. It recognizes the obfuscation patterns it was written against and
//! nothing more: qualifiers assembled at runtime (dynamic SQL, string
//! concatenation inside functions) are invisible to the namespace check.

mod bound;
mod clause;
mod ident;
mod validator;

pub use bound::has_row_bound;
pub use clause::validate_clause;
pub use ident::{IdentError, safe_csv_idents, safe_ident, safe_ident_or_special, safe_limit};
pub use validator::{
    AcceptedQuery, CommentMode, DEFAULT_FORBIDDEN_KEYWORDS, PolicyError, PolicySummary, Rejection,
    SYSTEM_NAMESPACES, ValidationPolicy, ValidationResult, validate,
};
