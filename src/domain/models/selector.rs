//! Wildcard selectors over feature-set references.
//!
//! Patterns accept `*` (any run of characters) and `?` (one character);
//! everything else matches literally.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::feature_set::FeatureSetRef;

/// Compile a wildcard pattern into an anchored regex.
pub fn wildcard_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
}

/// Match `value` against a wildcard pattern. Invalid patterns match nothing.
pub fn wildcard_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains(['*', '?']) {
        return pattern == value;
    }
    wildcard_regex(pattern).is_ok_and(|re| re.is_match(value))
}

/// Configured selector deciding which feature sets the controller manages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSetSelector {
    /// Exact project name, or `*` for every project.
    pub project: String,
    /// Feature-set name pattern.
    #[serde(default = "default_name_pattern")]
    pub name: String,
}

fn default_name_pattern() -> String {
    "*".to_string()
}

impl FeatureSetSelector {
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
        }
    }

    pub fn matches(&self, reference: &FeatureSetRef) -> bool {
        (self.project == "*" || self.project == reference.project)
            && wildcard_matches(&self.name, &reference.name)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.project.trim().is_empty() {
            return Err("Feature set selector project cannot be empty".to_string());
        }
        if self.project != "*" && self.project.contains(['*', '?']) {
            return Err(format!(
                "Feature set selector project '{}' must be exact or '*'",
                self.project
            ));
        }
        if self.name.trim().is_empty() {
            return Err("Feature set selector name cannot be empty".to_string());
        }
        wildcard_regex(&self.name)
            .map(|_| ())
            .map_err(|e| format!("Invalid name pattern '{}': {}", self.name, e))
    }
}
