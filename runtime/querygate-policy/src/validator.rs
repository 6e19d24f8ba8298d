//! Statement-level acceptance checks.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::bound::has_row_bound;
use crate::ident::{IdentError, safe_ident};

/// Catalog namespaces every policy allows.
pub const SYSTEM_NAMESPACES: &[&str] = &["QSYS2", "SYSTOOLS", "SYSIBM", "QSYS", "INFORMATION_SCHEMA"];

/// Mutating and administrative verbs, plus the command-escape forms.
pub const DEFAULT_FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "DROP", "ALTER", "CREATE", "CALL", "GRANT", "REVOKE",
    "RUN", "CL:", "QCMDEXC",
];

/// Words that may legitimately precede a dot without naming a schema.
const GRAMMAR_QUALIFIERS: &[&str] = &["TABLE", "VALUES", "LATERAL"];

static QUALIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z0-9_#$@]{1,128})\s*\.").expect("qualifier pattern"));

static LEADING_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Za-z]+)").expect("leading keyword pattern"));

pub type ValidationResult = Result<AcceptedQuery, Rejection>;

/// Why a statement was refused. Every variant is recoverable by the caller:
/// fix the statement, do not resubmit it as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    #[error("empty SQL is not allowed")]
    EmptyQuery,
    #[error("only SELECT/WITH statements are allowed")]
    NotReadOnly,
    #[error("multiple statements are not allowed (no semicolons)")]
    MultiStatement,
    #[error("forbidden SQL operation `{keyword}`; only read-only queries are allowed")]
    ForbiddenOperation { keyword: String },
    #[error("SQL comments are not allowed")]
    CommentNotAllowed,
    #[error("schema `{qualifier}` is not allowed; allowed schemas: {}", .allowed.join(", "))]
    NamespaceNotAllowed {
        qualifier: String,
        allowed: Vec<String>,
    },
    #[error("parentheses are not allowed in {clause}")]
    ParenthesesNotAllowed { clause: String },
    #[error("SELECT is not allowed in {clause}")]
    NestedSelect { clause: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("forbidden keyword list is empty")]
    NoForbiddenKeywords,
    #[error("invalid forbidden keyword {0:?}")]
    InvalidKeyword(String),
    #[error(transparent)]
    Namespace(#[from] IdentError),
}

/// Whether inline comments are tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentMode {
    Strict,
    Permissive,
}

/// A statement that passed validation. Only [`validate`] constructs one, so
/// holding an `AcceptedQuery` is proof the text was checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedQuery {
    text: String,
    row_bound: bool,
}

impl AcceptedQuery {
    /// The statement exactly as submitted.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// True if the statement already limits its own row count.
    pub fn has_row_bound(&self) -> bool {
        self.row_bound
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    system_namespaces: BTreeSet<String>,
    user_namespaces: BTreeSet<String>,
    forbidden: Vec<String>,
    forbidden_pattern: Regex,
    comments: CommentMode,
}

/// Serializable view of a policy, for answering "what can you access".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicySummary {
    pub system_namespaces: Vec<String>,
    pub user_namespaces: Vec<String>,
    pub forbidden_keywords: Vec<String>,
    pub comments: CommentMode,
}

impl ValidationPolicy {
    pub fn new<I, S>(forbidden: I, comments: CommentMode) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let forbidden = forbidden
            .into_iter()
            .map(|kw| kw.as_ref().trim().to_ascii_uppercase())
            .collect::<Vec<_>>();
        if forbidden.is_empty() {
            return Err(PolicyError::NoForbiddenKeywords);
        }
        if let Some(bad) = forbidden.iter().find(|kw| kw.is_empty()) {
            return Err(PolicyError::InvalidKeyword(bad.clone()));
        }
        let alternatives = forbidden
            .iter()
            .map(|kw| {
                // `CL:` ends in punctuation, where `\b` would never match.
                let tail = if kw.ends_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
                    r"\b"
                } else {
                    ""
                };
                format!(r"\b{}{tail}", regex::escape(kw))
            })
            .collect::<Vec<_>>()
            .join("|");
        let forbidden_pattern = Regex::new(&format!("(?i){alternatives}"))
            .map_err(|err| PolicyError::InvalidKeyword(err.to_string()))?;
        Ok(Self {
            system_namespaces: SYSTEM_NAMESPACES.iter().map(|ns| ns.to_string()).collect(),
            user_namespaces: BTreeSet::new(),
            forbidden,
            forbidden_pattern,
            comments,
        })
    }

    /// The strict default: system namespaces only, default forbidden verbs,
    /// comments refused.
    pub fn strict() -> Self {
        Self::new(DEFAULT_FORBIDDEN_KEYWORDS, CommentMode::Strict)
            .expect("default forbidden keywords are valid")
    }

    /// Same rules as [`ValidationPolicy::strict`] but tolerating comments.
    pub fn permissive() -> Self {
        Self::strict().with_comment_mode(CommentMode::Permissive)
    }

    pub fn with_comment_mode(mut self, comments: CommentMode) -> Self {
        self.comments = comments;
        self
    }

    /// Widens the allow-list with operator-approved namespaces. This is the
    /// only way to extend a policy, and every call is written to the audit
    /// log. Returns how many namespaces were new.
    pub fn register_user_namespaces<I, S>(&mut self, names: I) -> Result<usize, PolicyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = names
            .into_iter()
            .filter(|name| !name.as_ref().trim().is_empty())
            .map(|name| safe_ident(name.as_ref(), "namespace"))
            .collect::<Result<Vec<_>, _>>()?;
        let mut added = Vec::new();
        for name in names {
            if self.system_namespaces.contains(&name) {
                continue;
            }
            if self.user_namespaces.insert(name.clone()) {
                added.push(name);
            }
        }
        tracing::info!(
            target: "querygate::audit",
            added = ?added,
            total_user = self.user_namespaces.len(),
            "registered user namespaces"
        );
        Ok(added.len())
    }

    pub fn allows_namespace(&self, qualifier: &str) -> bool {
        self.system_namespaces.contains(qualifier) || self.user_namespaces.contains(qualifier)
    }

    /// Every allowed namespace, sorted.
    pub fn allowed_namespaces(&self) -> Vec<String> {
        self.system_namespaces
            .union(&self.user_namespaces)
            .cloned()
            .collect()
    }

    pub fn user_namespaces(&self) -> impl Iterator<Item = &str> {
        self.user_namespaces.iter().map(String::as_str)
    }

    pub fn comment_mode(&self) -> CommentMode {
        self.comments
    }

    /// First forbidden keyword found in `text`, upper-cased.
    pub fn forbidden_match(&self, text: &str) -> Option<String> {
        self.forbidden_pattern
            .find(text)
            .map(|m| m.as_str().to_ascii_uppercase())
    }

    pub fn summary(&self) -> PolicySummary {
        PolicySummary {
            system_namespaces: self.system_namespaces.iter().cloned().collect(),
            user_namespaces: self.user_namespaces.iter().cloned().collect(),
            forbidden_keywords: self.forbidden.clone(),
            comments: self.comments,
        }
    }
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self::strict()
    }
}

pub(crate) fn has_comment(text: &str) -> bool {
    text.contains("--") || text.contains("/*")
}

/// Checks `text` against `policy`. Pure: no I/O, no logging, no rewriting.
pub fn validate(text: &str, policy: &ValidationPolicy) -> ValidationResult {
    if text.trim().is_empty() {
        return Err(Rejection::EmptyQuery);
    }

    let leading = LEADING_KEYWORD
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_uppercase());
    if !matches!(leading.as_deref(), Some("SELECT" | "WITH")) {
        return Err(Rejection::NotReadOnly);
    }

    if text.contains(';') {
        return Err(Rejection::MultiStatement);
    }

    if let Some(keyword) = policy.forbidden_match(text) {
        return Err(Rejection::ForbiddenOperation { keyword });
    }

    if policy.comment_mode() == CommentMode::Strict && has_comment(text) {
        return Err(Rejection::CommentNotAllowed);
    }

    let upper = text.to_ascii_uppercase();
    for caps in QUALIFIER.captures_iter(&upper) {
        let qualifier = &caps[1];
        if GRAMMAR_QUALIFIERS.contains(&qualifier) {
            continue;
        }
        // Numeric literals such as `1.5` are not qualifiers.
        if qualifier.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if !policy.allows_namespace(qualifier) {
            return Err(Rejection::NamespaceNotAllowed {
                qualifier: qualifier.to_string(),
                allowed: policy.allowed_namespaces(),
            });
        }
    }

    Ok(AcceptedQuery {
        text: text.to_string(),
        row_bound: has_row_bound(text),
    })
}
