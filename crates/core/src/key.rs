//! Resource keys: the unit of deduplication for the work queue.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A `{namespace, name}` pair identifying one reconciled resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    namespace: String,
    name: String,
}

impl ResourceKey {
    /// Create a new key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse a key in `namespace/name` form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] when the separator is missing or either
    /// half is empty.
    pub fn parse(input: &str) -> Result<Self> {
        let (namespace, name) = input
            .split_once('/')
            .ok_or_else(|| Error::invalid_key(input, "expected 'namespace/name'"))?;

        if namespace.is_empty() {
            return Err(Error::invalid_key(input, "namespace is empty"));
        }
        if name.is_empty() || name.contains('/') {
            return Err(Error::invalid_key(input, "name is empty or contains '/'"));
        }

        Ok(Self::new(namespace, name))
    }

    /// The namespace half of the key.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The name half of the key.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A sibling key in the same namespace.
    #[must_use]
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::new(self.namespace.clone(), name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ResourceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A request to reconcile one resource.
///
/// Carries only the key: the reconcile loop always re-reads current state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReconcileRequest {
    pub key: ResourceKey,
}

impl ReconcileRequest {
    /// Create a request for the given key.
    #[must_use]
    pub const fn new(key: ResourceKey) -> Self {
        Self { key }
    }
}

impl From<ResourceKey> for ReconcileRequest {
    fn from(key: ResourceKey) -> Self {
        Self::new(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_round_trips_through_parse() {
        let key = ResourceKey::new("default", "db-credentials");
        assert_eq!(key.to_string(), "default/db-credentials");
        assert_eq!(ResourceKey::parse("default/db-credentials"), Ok(key));
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        assert!(ResourceKey::parse("no-separator").is_err());
        assert!(ResourceKey::parse("/name").is_err());
        assert!(ResourceKey::parse("ns/").is_err());
        assert!(ResourceKey::parse("ns/a/b").is_err());
    }

    #[test]
    fn test_sibling_keeps_namespace() {
        let key = ResourceKey::new("team-a", "source");
        let target = key.sibling("target");
        assert_eq!(target.namespace(), "team-a");
        assert_eq!(target.name(), "target");
    }
}
