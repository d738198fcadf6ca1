//! Environment configurations.
//!
//! An [`EnvironmentConfig`] is one exclusive execution target, for example a
//! provisioned cloud account. Several configs may advertise the same tags,
//! but each one stands for a physically distinct resource: at most one suite
//! runs against it at any instant.

pub mod locks;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A named, exclusive execution target advertising capability tags.
///
/// # Example
///
/// ```
/// use suitesched::EnvironmentConfig;
///
/// let config = EnvironmentConfig::new("aws-1", "aws-account-1")
///     .with_tags(["aws", "ubuntu"]);
///
/// assert!(config.has_tag("aws"));
/// assert_eq!(config.env, "aws-account-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EnvironmentConfig {
    /// Unique name suites refer to via `handler_configuration`.
    pub name: String,

    /// Identifier of the underlying exclusive resource.
    pub env: String,

    /// Capability tags offered by this environment.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl EnvironmentConfig {
    /// Creates a config with no tags.
    pub fn new(name: impl Into<String>, env: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            env: env.into(),
            tags: BTreeSet::new(),
        }
    }

    /// Adds a single capability tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Adds several capability tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Returns `true` if this config advertises `tag`.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Returns `true` if every tag in `required` is offered here.
    pub fn offers_all(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.tags)
    }

    /// Tags joined with commas, as exported to suite processes.
    pub fn tags_csv(&self) -> String {
        self.tags.iter().cloned().collect::<Vec<_>>().join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offers_all_superset() {
        let config = EnvironmentConfig::new("c1", "e1").with_tags(["a", "b", "c"]);
        let required: BTreeSet<String> = ["a", "c"].into_iter().map(String::from).collect();
        assert!(config.offers_all(&required));
    }

    #[test]
    fn test_offers_all_missing_tag() {
        let config = EnvironmentConfig::new("c1", "e1").with_tag("a");
        let required: BTreeSet<String> = ["a", "b"].into_iter().map(String::from).collect();
        assert!(!config.offers_all(&required));
    }

    #[test]
    fn test_tags_csv_sorted() {
        let config = EnvironmentConfig::new("c1", "e1").with_tags(["ubuntu", "aws"]);
        assert_eq!(config.tags_csv(), "aws,ubuntu");
    }
}
