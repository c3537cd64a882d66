//! Attribute identifiers and attribute vectors.
//!
//! An attribute is one observable surface point, named `"<Object>.<member>"`.
//! A vector is the deduplicated set of attributes one script has touched;
//! its normalized form (sorted, trimmed, empties dropped, `|`-joined) is the
//! key used by the entropy dataset.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Separator used in normalized vector keys.
pub const VECTOR_SEPARATOR: char = '|';

/// One monitored surface point, e.g. `navigator.userAgent`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeId(String);

impl AttributeId {
    /// Build an id from an object name and a member name.
    pub fn new(object: &str, member: &str) -> Self {
        Self(format!("{}.{}", object.trim(), member.trim()))
    }

    /// Parse an already-joined id. Surrounding whitespace is trimmed.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Object part (`navigator` for `navigator.userAgent`).
    pub fn object(&self) -> &str {
        self.0.split_once('.').map(|(o, _)| o).unwrap_or(&self.0)
    }

    /// Member part (`userAgent` for `navigator.userAgent`).
    pub fn member(&self) -> &str {
        self.0.split_once('.').map(|(_, m)| m).unwrap_or("")
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AttributeId {
    fn from(raw: &str) -> Self {
        Self(raw.trim().to_string())
    }
}

/// Unordered, deduplicated set of attributes.
///
/// Backed by a `BTreeSet`, so iteration order is already the normalized order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeVector {
    attributes: BTreeSet<AttributeId>,
}

impl AttributeVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `|`-separated vector string in any order, with any duplicates.
    pub fn parse(raw: &str) -> Self {
        raw.split(VECTOR_SEPARATOR)
            .filter_map(AttributeId::parse)
            .collect()
    }

    /// Insert an attribute. Returns `true` if it was not present yet.
    pub fn insert(&mut self, attribute: AttributeId) -> bool {
        self.attributes.insert(attribute)
    }

    pub fn contains(&self, attribute: &AttributeId) -> bool {
        self.attributes.contains(attribute)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttributeId> {
        self.attributes.iter()
    }

    /// Whether every attribute of `self` is also in `other`.
    pub fn is_subset(&self, other: &AttributeVector) -> bool {
        self.attributes.is_subset(&other.attributes)
    }

    /// The canonical key: sorted and joined by `|`.
    pub fn normalized(&self) -> String {
        let mut out = String::new();
        for (i, attr) in self.attributes.iter().enumerate() {
            if i > 0 {
                out.push(VECTOR_SEPARATOR);
            }
            out.push_str(attr.as_str());
        }
        out
    }
}

impl FromIterator<AttributeId> for AttributeVector {
    fn from_iter<T: IntoIterator<Item = AttributeId>>(iter: T) -> Self {
        Self {
            attributes: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for AttributeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized())
    }
}

/// Normalize a raw vector string without building a vector first.
pub fn normalize_key(raw: &str) -> String {
    AttributeVector::parse(raw).normalized()
}
