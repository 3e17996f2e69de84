//! Projection identity and the update notification pushed to clients

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method name used for projection update broadcasts
pub const PROJECTION_UPDATED: &str = "ProjectionUpdated";

/// Identifies one projection instance (projection type + entity id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectionKey {
    pub projection_type: String,
    pub entity_id: String,
}

impl ProjectionKey {
    pub fn new(projection_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            projection_type: projection_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Broadcast group that receives updates for this projection instance
    pub fn group_name(&self) -> String {
        group_name(&self.projection_type, &self.entity_id)
    }
}

impl std::fmt::Display for ProjectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.projection_type, self.entity_id)
    }
}

/// Broadcast group name for a projection instance
pub fn group_name(projection_type: &str, entity_id: &str) -> String {
    format!("projection:{}:{}", projection_type, entity_id)
}

/// Notification that a projection instance has a new version
///
/// On the wire this is three positional arguments:
/// `[projection_type, entity_id, new_version]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionUpdated {
    pub projection_type: String,
    pub entity_id: String,
    pub new_version: u64,
}

impl ProjectionUpdated {
    pub fn new(
        projection_type: impl Into<String>,
        entity_id: impl Into<String>,
        new_version: u64,
    ) -> Self {
        Self {
            projection_type: projection_type.into(),
            entity_id: entity_id.into(),
            new_version,
        }
    }

    pub fn key(&self) -> ProjectionKey {
        ProjectionKey::new(self.projection_type.clone(), self.entity_id.clone())
    }

    /// Positional broadcast arguments
    pub fn to_args(&self) -> Vec<Value> {
        vec![
            Value::from(self.projection_type.clone()),
            Value::from(self.entity_id.clone()),
            Value::from(self.new_version),
        ]
    }

    /// Parse positional broadcast arguments
    ///
    /// Returns `None` if the arguments don't have the expected shape.
    pub fn from_args(args: &[Value]) -> Option<Self> {
        match args {
            [projection_type, entity_id, version] => Some(Self {
                projection_type: projection_type.as_str()?.to_string(),
                entity_id: entity_id.as_str()?.to_string(),
                new_version: version.as_u64()?,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_group_name() {
        assert_eq!(group_name("OrderView", "o-1"), "projection:OrderView:o-1");
        assert_eq!(
            ProjectionKey::new("OrderView", "o-1").group_name(),
            "projection:OrderView:o-1"
        );
    }

    #[test]
    fn test_args_shape() {
        let update = ProjectionUpdated::new("OrderView", "o-1", 7);
        assert_eq!(update.to_args(), vec![json!("OrderView"), json!("o-1"), json!(7)]);
        assert_eq!(ProjectionUpdated::from_args(&update.to_args()), Some(update));
    }

    #[test]
    fn test_from_malformed_args() {
        assert!(ProjectionUpdated::from_args(&[]).is_none());
        assert!(ProjectionUpdated::from_args(&[json!("a"), json!("b")]).is_none());
        assert!(ProjectionUpdated::from_args(&[json!("a"), json!("b"), json!("c")]).is_none());
        assert!(ProjectionUpdated::from_args(&[json!(1), json!("b"), json!(2)]).is_none());
    }
}
