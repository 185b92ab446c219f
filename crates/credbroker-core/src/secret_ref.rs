//! Composite `(namespace, name)` secret references.

use std::fmt;

pub const DEFAULT_NAMESPACE: &str = "default";

pub fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// A parsed secret reference: `"ns::name"` or bare `"name"` (→ `default`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

impl SecretRef {
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parses `"ns::name"` or `"name"`. Fails on an empty name or a
    /// namespace/name containing `::` beyond the single separator.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let parts: Vec<&str> = raw.splitn(2, "::").collect();
        let (namespace, name) = match parts.as_slice() {
            [name] => (DEFAULT_NAMESPACE, *name),
            [namespace, name] => (*namespace, *name),
            _ => unreachable!("splitn(2, ..) yields at most 2 parts"),
        };

        if namespace.is_empty() || name.is_empty() {
            return Err(format!("invalid secret reference: {raw:?}"));
        }

        Ok(Self::new(namespace, name))
    }

    /// The storage key this reference maps to: `"namespace::name"`.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}::{}", self.namespace, self.name)
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.namespace, self.name)
    }
}
