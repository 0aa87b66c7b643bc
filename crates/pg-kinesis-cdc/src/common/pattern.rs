//! Pattern matching for table filtering
//!
//! Compiles the psql-style glob patterns accepted on the command line
//! (`*` matches any run, `?` matches a single character) into anchored
//! regular expressions. Every other character - including `.` and `$` -
//! is matched literally: the whole pattern is escaped first, then the
//! wildcard placeholders are substituted back in.

use regex::Regex;
use std::sync::Arc;

/// Error type for pattern operations
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("empty pattern")]
    EmptyPattern,
}

/// A compiled pattern matcher
///
/// Pre-compiles the glob to a regex for efficient repeated matching.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    /// Original pattern string (for display/debugging)
    pattern: String,
    /// Compiled regex (case-insensitive, anchored)
    regex: Regex,
    /// Whether this is a wildcard-only pattern (matches everything)
    is_wildcard: bool,
}

impl PatternMatcher {
    /// Compile a glob pattern.
    ///
    /// # Example
    ///
    /// ```rust
    /// use pg_kinesis_cdc::PatternMatcher;
    ///
    /// let matcher = PatternMatcher::new("public.*").unwrap();
    /// assert!(matcher.matches("public.users"));
    /// assert!(!matcher.matches("private.users"));
    /// ```
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::EmptyPattern);
        }

        let is_wildcard = pattern == "*";

        let regex = regex::RegexBuilder::new(&glob_to_regex(pattern))
            .case_insensitive(true)
            .build()?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            is_wildcard,
        })
    }

    /// Check if text matches the pattern
    #[inline]
    pub fn matches(&self, text: &str) -> bool {
        if self.is_wildcard {
            return true;
        }
        self.regex.is_match(text)
    }

    /// Get the original pattern string
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Check if this is a wildcard pattern (matches everything)
    pub fn is_wildcard(&self) -> bool {
        self.is_wildcard
    }
}

/// A set of patterns, matched as a union.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<PatternMatcher>,
    has_wildcard: bool,
}

impl PatternSet {
    /// Create an empty pattern set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pattern set from a list of glob patterns
    pub fn from_patterns(patterns: &[String]) -> Result<Self, PatternError> {
        let mut set = Self::new();
        for pattern in patterns {
            set.add(pattern)?;
        }
        Ok(set)
    }

    /// Add a glob pattern to the set
    pub fn add(&mut self, pattern: &str) -> Result<(), PatternError> {
        let matcher = PatternMatcher::new(pattern)?;
        if matcher.is_wildcard {
            self.has_wildcard = true;
        }
        self.patterns.push(matcher);
        Ok(())
    }

    /// Check if text matches any pattern in the set
    #[inline]
    pub fn matches(&self, text: &str) -> bool {
        if self.has_wildcard {
            return true;
        }
        self.patterns.iter().any(|p| p.matches(text))
    }

    /// Check if the set is empty
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Get the number of patterns in the set
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Iterate over the patterns
    pub fn iter(&self) -> impl Iterator<Item = &PatternMatcher> {
        self.patterns.iter()
    }
}

/// Thread-safe shared pattern set
pub type SharedPatternSet = Arc<PatternSet>;

/// Convert a glob pattern to an anchored regex.
///
/// Escapes the entire pattern first, then substitutes:
/// - `*` → `.*`
/// - `?` → `.`
fn glob_to_regex(pattern: &str) -> String {
    let escaped = regex::escape(pattern);
    let regex_pattern = escaped.replace(r"\*", ".*").replace(r"\?", ".");
    format!("^{}$", regex_pattern)
}
