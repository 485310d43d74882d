use regex::Regex;

/// The wildcard marker accepted by pattern invalidation.
pub const WILDCARD: char = '*';

/// A parsed invalidation pattern.
///
/// Only a trailing wildcard is meaningful: `"contact:*"` selects every key starting with `"contact:"`, anything
/// without a trailing wildcard selects exactly one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyPattern {
    Exact(String),
    Prefix(String),
}

impl KeyPattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix(WILDCARD) {
            Some(prefix) => Self::Prefix(prefix.to_string()),
            None => Self::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(k) => k == key,
            Self::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

/// Strips one trailing wildcard; the remainder is used as a plain prefix.
pub fn strip_wildcard(pattern: &str) -> &str {
    pattern.strip_suffix(WILDCARD).unwrap_or(pattern)
}

/// Translates `pattern`, namespaced with `prefix`, into an anchored regular expression over full storage keys.
///
/// Every regex metacharacter is escaped, then each wildcard becomes `.*`.
pub fn storage_regex(prefix: &str, pattern: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(&format!("{prefix}{pattern}"));
    let wildcard = regex::escape(&WILDCARD.to_string());
    Regex::new(&format!("^{}$", escaped.replace(&wildcard, ".*")))
}
