//! Unique identifier types for engine entities
//!
//! All IDs use UUID v7 for time-sortable ordering, enabling efficient
//! chronological queries over compilation and cycle histories.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a view definition
///
/// Uses UUID v7 for time-based sorting. A view definition keeps its
/// identity across updates; a recompilation does not change the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewDefinitionId(Uuid);

impl ViewDefinitionId {
    /// Create a new ViewDefinitionId with current timestamp
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create from existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ViewDefinitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ViewDefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one computation cycle
///
/// Uses UUID v7 so cycles sort in execution order across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CycleId(Uuid);

impl CycleId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CycleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_definition_id_creation() {
        let id1 = ViewDefinitionId::new();
        let id2 = ViewDefinitionId::new();
        assert_ne!(id1, id2, "ViewDefinitionIds should be unique");
    }

    #[test]
    fn test_view_definition_id_serialization() {
        let id = ViewDefinitionId::new();
        let json = serde_json::to_string(&id).unwrap();
        let deserialized: ViewDefinitionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);
    }

    #[test]
    fn test_cycle_id_creation() {
        let id1 = CycleId::new();
        let id2 = CycleId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_cycle_id_serialization() {
        let id = CycleId::new();
        let json = serde_json::to_string(&id).unwrap();
        let deserialized: CycleId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);
    }
}
