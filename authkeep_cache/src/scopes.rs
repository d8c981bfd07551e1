//! Normalized scope sets

use std::{collections::btree_set, collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

/// Scopes that the identity provider grants implicitly and which never
/// participate in access token lookups
pub const RESERVED_SCOPES: [&str; 3] = ["openid", "profile", "offline_access"];

/// A normalized, order-insensitive set of OAuth2 scopes
///
/// Scopes are trimmed and lower-cased on insertion, so two sets built from
/// the same scopes in any order and any casing compare equal and render the
/// same [`joined`][ScopeSet::joined] string.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ScopeSet(BTreeSet<String>);

impl ScopeSet {
    /// Produces an empty scope set
    #[inline]
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Parses a whitespace-delimited scope string
    pub fn parse(scopes: &str) -> Self {
        scopes.split_whitespace().collect()
    }

    /// Adds a scope to the set, normalizing it first
    ///
    /// Blank scopes are ignored.
    pub fn insert(&mut self, scope: &str) {
        let scope = scope.trim();
        if !scope.is_empty() {
            self.0.insert(scope.to_lowercase());
        }
    }

    /// Whether the set contains the given scope, ignoring case
    pub fn contains(&self, scope: &str) -> bool {
        self.0.contains(&scope.trim().to_lowercase())
    }

    /// The number of distinct scopes
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the normalized scopes in sorted order
    #[inline]
    pub fn iter(&self) -> btree_set::Iter<'_, String> {
        self.0.iter()
    }

    /// Whether every scope in `other` is also in this set
    pub fn is_superset(&self, other: &ScopeSet) -> bool {
        self.0.is_superset(&other.0)
    }

    /// Whether the two sets share at least one scope
    pub fn intersects(&self, other: &ScopeSet) -> bool {
        !self.0.is_disjoint(&other.0)
    }

    /// A copy of this set without the reserved OpenID Connect scopes
    pub fn without_reserved(&self) -> Self {
        Self(
            self.0
                .iter()
                .filter(|s| !RESERVED_SCOPES.contains(&s.as_str()))
                .cloned()
                .collect(),
        )
    }

    /// A copy of this set with the reserved OpenID Connect scopes added
    pub fn with_reserved(&self) -> Self {
        let mut scopes = self.clone();
        for reserved in RESERVED_SCOPES {
            scopes.insert(reserved);
        }
        scopes
    }

    /// The canonical string form: normalized scopes, sorted, space-joined
    pub fn joined(&self) -> String {
        let mut out = String::new();
        for (idx, scope) in self.0.iter().enumerate() {
            if idx > 0 {
                out.push(' ');
            }
            out.push_str(scope);
        }
        out
    }
}

impl<'a> FromIterator<&'a str> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl<'a> Extend<&'a str> for ScopeSet {
    fn extend<I: IntoIterator<Item = &'a str>>(&mut self, iter: I) {
        for scope in iter {
            self.insert(scope);
        }
    }
}

impl<'a> IntoIterator for &'a ScopeSet {
    type Item = &'a String;
    type IntoIter = btree_set::Iter<'a, String>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl From<String> for ScopeSet {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<ScopeSet> for String {
    fn from(s: ScopeSet) -> Self {
        s.joined()
    }
}

impl fmt::Debug for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.iter()).finish()
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined())
    }
}
