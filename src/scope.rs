//! Registry token scopes.

use std::collections::BTreeSet;
use std::fmt;

/// An ordered, deduplicated set of token scopes.
///
/// Scopes accumulate as a request is retried through the auth layer; the set
/// keeps union semantics well defined and renders space-joined, the separator
/// the token endpoint expects for multiple scopes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScopeSet {
    scopes: BTreeSet<String>,
}

impl ScopeSet {
    /// Creates an empty scope set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The pull scope for a repository, `repository:<locator>:pull`.
    pub fn repository_pull(locator: &str) -> Self {
        let mut set = Self::new();
        set.add(format!("repository:{locator}:pull"));
        set
    }

    /// Adds a scope to the set.
    pub fn add(&mut self, scope: String) {
        if !scope.is_empty() {
            self.scopes.insert(scope);
        }
    }

    /// Merges another set into this one.
    pub fn extend(&mut self, other: &ScopeSet) {
        self.scopes.extend(other.scopes.iter().cloned());
    }

    /// Iterates the scopes in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.scopes.iter().map(|s| s.as_str())
    }

    /// True when the set holds no scope.
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for scope in &self.scopes {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(scope)?;
            first = false;
        }
        Ok(())
    }
}
