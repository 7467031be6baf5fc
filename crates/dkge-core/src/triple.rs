//! Id-encoded triples.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dense entity id in `[0, n_entities)`.
pub type EntityId = u32;

/// Dense relation id in `[0, n_relations)`.
pub type RelationId = u32;

/// A `(head, relation, tail)` fact with dense integer ids.
///
/// Triples are immutable once loaded; every component of the system
/// (shards, batches, the evaluation graph) refers to them by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Triple {
    /// Head entity.
    pub head: EntityId,
    /// Relation.
    pub relation: RelationId,
    /// Tail entity.
    pub tail: EntityId,
}

impl Triple {
    /// Create a new triple.
    pub const fn new(head: EntityId, relation: RelationId, tail: EntityId) -> Self {
        Self {
            head,
            relation,
            tail,
        }
    }

    /// Replace the head, keeping relation and tail.
    pub const fn with_head(self, head: EntityId) -> Self {
        Self { head, ..self }
    }

    /// Replace the tail, keeping head and relation.
    pub const fn with_tail(self, tail: EntityId) -> Self {
        Self { tail, ..self }
    }
}

impl From<(EntityId, RelationId, EntityId)> for Triple {
    fn from((head, relation, tail): (EntityId, RelationId, EntityId)) -> Self {
        Self::new(head, relation, tail)
    }
}

impl fmt::Display for Triple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.head, self.relation, self.tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_helpers() {
        let t = Triple::new(1, 2, 3);
        assert_eq!(t.with_head(9), Triple::new(9, 2, 3));
        assert_eq!(t.with_tail(9), Triple::new(1, 2, 9));
    }

    #[test]
    fn test_display() {
        assert_eq!(Triple::from((0, 1, 2)).to_string(), "(0, 1, 2)");
    }
}
