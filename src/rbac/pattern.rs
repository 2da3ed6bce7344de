//! Stack-name patterns. `*` matches any run of characters, including none;
//! every other character matches itself.

use glob::{MatchOptions, Pattern};

use crate::error::{Error, Result};

const MAX_PATTERN_LEN: usize = 255;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// How narrowly a pattern selects stacks. Higher is more specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Specificity {
    Wildcard,
    Contains,
    Affix,
    Exact,
}

/// Compiles a stack pattern so that only `*` is special.
fn compile(pattern: &str) -> Option<Pattern> {
    let escaped: Vec<String> = pattern.split('*').map(Pattern::escape).collect();
    Pattern::new(&escaped.join("*")).ok()
}

#[must_use]
pub fn matches_pattern(stack_name: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return stack_name == pattern;
    }
    compile(pattern).is_some_and(|p| p.matches_with(stack_name, MATCH_OPTIONS))
}

#[must_use]
pub fn pattern_specificity(pattern: &str) -> Specificity {
    let stars = pattern.matches('*').count();
    if stars == 0 {
        return Specificity::Exact;
    }
    if pattern.chars().all(|c| c == '*') {
        return Specificity::Wildcard;
    }
    if stars == 1 && (pattern.starts_with('*') || pattern.ends_with('*')) {
        return Specificity::Affix;
    }
    Specificity::Contains
}

/// Rejects patterns that could never name a stack.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(Error::BadRequest("stack pattern cannot be empty".into()));
    }
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(Error::BadRequest("stack pattern is too long".into()));
    }
    if let Some(c) = pattern
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '*')))
    {
        return Err(Error::BadRequest(format!(
            "stack pattern contains invalid character '{c}'"
        )));
    }
    Ok(())
}
