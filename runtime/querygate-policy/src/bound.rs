//! Detection of statements that already bound their own row count.

use std::sync::LazyLock;

use regex::Regex;
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer};

static BOUND_FALLBACK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bFETCH\s+(?:FIRST|NEXT)\b|\bLIMIT\s+(?:\d+|\?)").expect("row bound pattern")
});

/// Returns true when the outermost query carries a `FETCH FIRST|NEXT` or
/// `LIMIT` clause. Bounds inside parenthesized subqueries do not count.
///
/// Statements the tokenizer cannot handle fall back to a plain pattern match,
/// which may also see bounds inside subqueries.
pub fn has_row_bound(sql: &str) -> bool {
    let dialect = GenericDialect {};
    let tokens = match Tokenizer::new(&dialect, sql).tokenize() {
        Ok(tokens) => tokens,
        Err(_) => return BOUND_FALLBACK.is_match(sql),
    };

    let mut depth = 0usize;
    let mut significant = tokens
        .iter()
        .filter(|token| !matches!(token, Token::Whitespace(_)))
        .peekable();
    while let Some(token) = significant.next() {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => depth = depth.saturating_sub(1),
            Token::Word(word) if depth == 0 => match word.keyword {
                Keyword::LIMIT => return true,
                Keyword::FETCH => {
                    if let Some(Token::Word(next)) = significant.peek() {
                        if matches!(next.keyword, Keyword::FIRST | Keyword::NEXT) {
                            return true;
                        }
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }
    false
}
