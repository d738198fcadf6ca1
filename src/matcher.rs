//! Requirement matching.
//!
//! A suite declares exactly one [`Requirement`]: either the name of one
//! specific environment config, or a non-empty set of capability tags. The
//! [`ResourceMatcher`] maps a requirement to the configs able to satisfy it.
//! Matching is pure; it never looks at quarantine or run state.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::environment::EnvironmentConfig;

/// What a suite needs from an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    /// Pinned to one named environment config.
    Config(String),
    /// Any config offering all of these tags.
    Tags(BTreeSet<String>),
}

/// Errors building a [`Requirement`] from a suite descriptor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequirementError {
    /// Both `requires` and `handler_configuration` were given.
    #[error("suite declares both 'requires' and 'handler_configuration'")]
    Ambiguous,

    /// Neither `requires` nor `handler_configuration` was given.
    #[error("suite declares neither 'requires' nor 'handler_configuration'")]
    Missing,

    /// `requires` was given but empty.
    #[error("'requires' must name at least one tag")]
    EmptyTags,
}

impl Requirement {
    /// Requirement pinned to a named config.
    pub fn config(name: impl Into<String>) -> Self {
        Requirement::Config(name.into())
    }

    /// Requirement on a set of tags.
    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Requirement::Tags(tags.into_iter().map(Into::into).collect())
    }

    /// Builds a requirement from the two optional descriptor fields.
    ///
    /// Exactly one of them must be present, and a tag list must be non-empty.
    ///
    /// # Example
    ///
    /// ```
    /// use suitesched::matcher::{Requirement, RequirementError};
    ///
    /// let tags = vec!["aws".to_string()];
    /// assert_eq!(
    ///     Requirement::from_descriptor(Some(&tags), None),
    ///     Ok(Requirement::tags(["aws"]))
    /// );
    /// assert_eq!(
    ///     Requirement::from_descriptor(Some(&tags), Some("aws-1")),
    ///     Err(RequirementError::Ambiguous)
    /// );
    /// ```
    pub fn from_descriptor(
        requires: Option<&[String]>,
        handler_configuration: Option<&str>,
    ) -> Result<Self, RequirementError> {
        match (requires, handler_configuration) {
            (Some(_), Some(_)) => Err(RequirementError::Ambiguous),
            (None, None) => Err(RequirementError::Missing),
            (None, Some(name)) => Ok(Requirement::config(name)),
            (Some(tags), None) => {
                let requirement = Requirement::tags(tags.iter().cloned());
                requirement.validate()?;
                Ok(requirement)
            }
        }
    }

    /// Checks the requirement is well formed.
    pub fn validate(&self) -> Result<(), RequirementError> {
        match self {
            Requirement::Tags(tags) if tags.is_empty() => Err(RequirementError::EmptyTags),
            _ => Ok(()),
        }
    }

    /// Returns `true` for a requirement naming one specific config.
    pub fn is_pinned(&self) -> bool {
        matches!(self, Requirement::Config(_))
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Config(name) => write!(f, "handler_configuration={}", name),
            Requirement::Tags(tags) => {
                let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
                write!(f, "requires=[{}]", tags.join(", "))
            }
        }
    }
}

/// Resolves requirements against an environment config table.
///
/// Eligible configs are returned in table order. That order is stable for a
/// given table, but nothing beyond that is promised about which eligible
/// config a flexible suite ends up on.
///
/// # Example
///
/// ```
/// use suitesched::{EnvironmentConfig, Requirement, ResourceMatcher};
///
/// let table = vec![
///     EnvironmentConfig::new("config1", "env1_id").with_tag("env1"),
///     EnvironmentConfig::new("config2", "env2_id").with_tags(["env1", "env2"]),
/// ];
/// let matcher = ResourceMatcher::new(&table);
///
/// assert_eq!(matcher.eligible(&Requirement::tags(["env1"])), vec![0, 1]);
/// assert_eq!(matcher.eligible(&Requirement::config("config2")), vec![1]);
/// assert!(matcher.eligible(&Requirement::config("missing")).is_empty());
/// ```
pub struct ResourceMatcher<'a> {
    table: &'a [EnvironmentConfig],
}

impl<'a> ResourceMatcher<'a> {
    /// Creates a matcher over `table`.
    pub fn new(table: &'a [EnvironmentConfig]) -> Self {
        Self { table }
    }

    /// Indices into the table of every config satisfying `requirement`.
    pub fn eligible(&self, requirement: &Requirement) -> Vec<usize> {
        match requirement {
            Requirement::Config(name) => self
                .table
                .iter()
                .position(|c| &c.name == name)
                .into_iter()
                .collect(),
            Requirement::Tags(tags) => self
                .table
                .iter()
                .enumerate()
                .filter(|(_, c)| c.offers_all(tags))
                .map(|(i, _)| i)
                .collect(),
        }
    }

    /// Like [`eligible`](Self::eligible), but returns the configs.
    pub fn eligible_configs(&self, requirement: &Requirement) -> Vec<&'a EnvironmentConfig> {
        self.eligible(requirement)
            .into_iter()
            .map(|i| &self.table[i])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Vec<EnvironmentConfig> {
        vec![
            EnvironmentConfig::new("config1", "env1_id").with_tag("env1"),
            EnvironmentConfig::new("config2", "env2_id").with_tag("env2"),
            EnvironmentConfig::new("config3", "env3_id").with_tags(["env1", "env2"]),
        ]
    }

    #[test]
    fn test_tags_match_supersets_in_table_order() {
        let table = table();
        let matcher = ResourceMatcher::new(&table);
        assert_eq!(matcher.eligible(&Requirement::tags(["env1"])), vec![0, 2]);
        assert_eq!(matcher.eligible(&Requirement::tags(["env2"])), vec![1, 2]);
        assert_eq!(
            matcher.eligible(&Requirement::tags(["env1", "env2"])),
            vec![2]
        );
    }

    #[test]
    fn test_unknown_tag_matches_nothing() {
        let table = table();
        let matcher = ResourceMatcher::new(&table);
        assert!(matcher.eligible(&Requirement::tags(["aaa"])).is_empty());
    }

    #[test]
    fn test_explicit_config_ignores_tags() {
        let table = table();
        let matcher = ResourceMatcher::new(&table);
        let configs = matcher.eligible_configs(&Requirement::config("config2"));
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name, "config2");
    }

    #[test]
    fn test_from_descriptor_rejects_missing_and_empty() {
        assert_eq!(
            Requirement::from_descriptor(None, None),
            Err(RequirementError::Missing)
        );
        assert_eq!(
            Requirement::from_descriptor(Some(&[]), None),
            Err(RequirementError::EmptyTags)
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Requirement::tags(["b", "a"]).to_string(),
            "requires=[a, b]"
        );
        assert_eq!(
            Requirement::config("config1").to_string(),
            "handler_configuration=config1"
        );
    }
}
