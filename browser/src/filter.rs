//! Field-match criteria applied to a server's info map

use regex::{Regex, RegexBuilder};
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Pattern {
    Regex(Regex),
    /// Fallback for values that are not valid regular expressions
    Literal(String),
}

impl Pattern {
    fn new(value: &str) -> Self {
        match RegexBuilder::new(value).case_insensitive(true).build() {
            Ok(regex) => Pattern::Regex(regex),
            Err(_) => Pattern::Literal(value.to_lowercase()),
        }
    }

    fn is_match(&self, text: &str) -> bool {
        match self {
            Pattern::Regex(regex) => regex.is_match(text),
            Pattern::Literal(literal) => text.to_lowercase().contains(literal.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
struct Criterion {
    key: String,
    value: String,
    pattern: Pattern,
}

/// Set of `key => pattern` criteria, any one of which admits a server
///
/// Values are matched case-insensitively as regular expressions, so
/// `gametype => "4"` admits `"4"` as well as `"14"`.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    criteria: Vec<Criterion>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl AsRef<str>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl AsRef<str>) {
        let value = value.as_ref();
        self.criteria.push(Criterion {
            key: key.into(),
            value: value.to_string(),
            pattern: Pattern::new(value),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    pub fn criteria(&self) -> impl Iterator<Item = (&str, &str)> {
        self.criteria
            .iter()
            .map(|c| (c.key.as_str(), c.value.as_str()))
    }

    /// True when the filter is empty or any criterion matches
    pub fn matches(&self, info: &HashMap<String, String>) -> bool {
        if self.is_empty() {
            return true;
        }
        self.criteria.iter().any(|criterion| {
            info.get(&criterion.key)
                .map_or(false, |value| criterion.pattern.is_match(value))
        })
    }
}

impl<K: Into<String>, V: AsRef<str>> FromIterator<(K, V)> for Filter {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut filter = Filter::new();
        for (key, value) in iter {
            filter.insert(key, value);
        }
        filter
    }
}

/// Parses a `KEY=VALUE` command line criterion
pub fn parse_criterion(text: &str) -> Result<(String, String), String> {
    match text.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", text)),
    }
}
