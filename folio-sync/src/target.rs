//! Target identity for update logs and shared documents.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash::fnv1a_32;

/// Identity tying a set of update-log rows and one CRDT document together.
///
/// An ordered tuple of strings; two keys denote the same target iff they
/// are equal part by part. Typical shapes are `(entity_type, entity_id)`,
/// `(object_id, field_key)` and `(document_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetKey(Vec<String>);

impl TargetKey {
    /// Build a key from any sequence of parts.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// `(entity_type, entity_id)` key.
    pub fn entity(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self(vec![entity_type.into(), entity_id.into()])
    }

    /// Key for a standalone document.
    pub fn document(document_id: impl Into<String>) -> Self {
        Self(vec![document_id.into()])
    }

    /// Key for a whole object.
    pub fn object(object_id: impl Into<String>) -> Self {
        Self(vec![object_id.into()])
    }

    /// Key for one rich-text field of an object.
    pub fn object_field(object_id: impl Into<String>, field_key: impl Into<String>) -> Self {
        Self(vec![object_id.into(), field_key.into()])
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Parts joined with `:`.
    pub fn joined(&self) -> String {
        self.0.join(":")
    }

    /// Advisory lock id for this target.
    ///
    /// Distinct targets may share a lock id; that only serializes them.
    pub fn lock_id(&self) -> u32 {
        // ("a:b") and ("a", "b") must not share material.
        let mut material = String::new();
        for part in &self.0 {
            material.push_str(&part.chars().count().to_string());
            material.push('#');
            material.push_str(part);
        }
        fnv1a_32(&material)
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_fieldwise_equality() {
        let a = TargetKey::entity("note", "42");
        let b = TargetKey::new(["note", "42"]);
        assert_eq!(a, b);
        assert_ne!(a, TargetKey::entity("note", "43"));
        assert_ne!(TargetKey::new(["a:b"]), TargetKey::new(["a", "b"]));
    }

    #[test]
    fn test_display_joins_parts() {
        assert_eq!(TargetKey::object_field("obj", "body").to_string(), "obj:body");
        assert_eq!(TargetKey::document("d1").to_string(), "d1");
    }

    #[test]
    fn test_usable_as_map_key() {
        let mut map = HashMap::new();
        map.insert(TargetKey::entity("note", "1"), 1);
        map.insert(TargetKey::entity("note", "1"), 2);
        assert_eq!(map.len(), 1);
        assert_eq!(map[&TargetKey::new(["note", "1"])], 2);
    }

    #[test]
    fn test_lock_id_is_stable() {
        let key = TargetKey::entity("note", "1");
        assert_eq!(key.lock_id(), key.clone().lock_id());
        assert_ne!(TargetKey::new(["a:b"]).lock_id(), TargetKey::new(["a", "b"]).lock_id());
    }
}
