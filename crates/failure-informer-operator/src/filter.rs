//! Notifier filter matching
//!
//! A notifier's filters are regular expressions matched against an event's
//! reason. Every filter must match (AND semantics) and an empty filter list
//! matches nothing. A filter that does not compile is an error for that
//! notifier, never a silent non-match.

use crate::crd::Notifier;
use crate::error::{OperatorError, Result};
use kube::ResourceExt;
use regex::Regex;

/// A notifier's filters, compiled
#[derive(Debug, Clone)]
pub struct FilterSet {
    patterns: Vec<Regex>,
}

impl FilterSet {
    /// Compile every filter, failing on the first invalid one
    pub fn compile(notifier: &str, filters: &[String]) -> Result<Self> {
        let patterns = filters
            .iter()
            .map(|filter| {
                Regex::new(filter).map_err(|e| OperatorError::InvalidFilter {
                    notifier: notifier.to_string(),
                    pattern: filter.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Whether every pattern matches `reason`. Empty sets never match.
    pub fn matches(&self, reason: &str) -> bool {
        !self.patterns.is_empty() && self.patterns.iter().all(|p| p.is_match(reason))
    }

    /// Number of patterns
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the set has no patterns
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Match a filter list against a reason string
pub fn matches(notifier: &str, filters: &[String], reason: &str) -> Result<bool> {
    Ok(FilterSet::compile(notifier, filters)?.matches(reason))
}

/// Match a notifier's filters against a reason string
pub fn notifier_matches(notifier: &Notifier, reason: &str) -> Result<bool> {
    matches(&notifier.name_any(), notifier.filters(), reason)
}

/// Result of matching every notifier of a namespace against one reason
#[derive(Debug, Default)]
pub struct MatchReport<'a> {
    /// Notifiers whose full filter set matched
    pub matched: Vec<&'a Notifier>,
    /// Notifiers whose filters did not match
    pub unmatched: Vec<&'a Notifier>,
    /// Notifiers skipped because a filter is invalid
    pub invalid: Vec<(&'a Notifier, OperatorError)>,
}

/// Partition notifiers by whether they match `reason`.
///
/// An invalid notifier does not stop the others from being evaluated.
pub fn partition<'a>(notifiers: &'a [Notifier], reason: &str) -> MatchReport<'a> {
    let mut report = MatchReport::default();
    for notifier in notifiers {
        match notifier_matches(notifier, reason) {
            Ok(true) => report.matched.push(notifier),
            Ok(false) => report.unmatched.push(notifier),
            Err(e) => report.invalid.push((notifier, e)),
        }
    }
    report
}
