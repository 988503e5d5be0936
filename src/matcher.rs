//! Label matchers used to resolve queries to fingerprint sets.

use crate::error::{Result, StorageError};
use regex::Regex;

/// The kind of comparison a matcher applies to a label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Equal,
    NotEqual,
    RegexMatch,
    RegexNoMatch,
}

/// A predicate over the value of one label name.
///
/// Regex matchers are compiled anchored: the pattern must match the whole
/// label value, not a substring.
#[derive(Debug, Clone)]
pub struct LabelMatcher {
    pub match_type: MatchType,
    pub name: String,
    pub value: String,
    regex: Option<Regex>,
}

impl LabelMatcher {
    pub fn new(match_type: MatchType, name: &str, value: &str) -> Result<LabelMatcher> {
        let regex = match match_type {
            MatchType::RegexMatch | MatchType::RegexNoMatch => {
                let anchored = format!("^(?:{})$", value);
                Some(
                    Regex::new(&anchored)
                        .map_err(|e| StorageError::InvalidLabel(format!("{}: {}", name, e)))?,
                )
            }
            _ => None,
        };
        Ok(LabelMatcher {
            match_type,
            name: name.to_string(),
            value: value.to_string(),
            regex,
        })
    }

    /// Shorthand for an equality matcher, which can never fail to build.
    pub fn equal(name: &str, value: &str) -> LabelMatcher {
        LabelMatcher {
            match_type: MatchType::Equal,
            name: name.to_string(),
            value: value.to_string(),
            regex: None,
        }
    }

    /// Returns whether a label value satisfies this matcher.
    pub fn matches(&self, value: &str) -> bool {
        match self.match_type {
            MatchType::Equal => value == self.value,
            MatchType::NotEqual => value != self.value,
            MatchType::RegexMatch => self.regex.as_ref().map_or(false, |re| re.is_match(value)),
            MatchType::RegexNoMatch => self.regex.as_ref().map_or(false, |re| !re.is_match(value)),
        }
    }

    /// Filters a list of candidate label values down to the matching ones.
    pub fn filter(&self, values: Vec<String>) -> Vec<String> {
        values.into_iter().filter(|v| self.matches(v)).collect()
    }
}
