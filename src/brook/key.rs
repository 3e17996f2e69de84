//! Brook identity and position types
//!
//! A brook is identified by its name plus the entity id whose events it
//! holds. Positions are monotonic markers of progress within one brook.

use std::cmp::Ordering;

/// Unique identifier for a brook (brook name + entity id)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrookKey {
    /// Brook name (e.g., "orders")
    pub brook_name: String,
    /// Entity id within the brook (e.g., "o-1")
    pub entity_id: String,
}

impl BrookKey {
    /// Create a new brook key
    pub fn new(brook_name: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            brook_name: brook_name.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl std::fmt::Display for BrookKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.brook_name, self.entity_id)
    }
}

/// Position within a brook
///
/// `Position::NOT_SET` means the brook has never been written. Any set
/// position is newer than `NOT_SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Position(Option<u64>);

impl Position {
    /// Position of a brook with no events
    pub const NOT_SET: Position = Position(None);

    /// Create a set position
    pub const fn new(value: u64) -> Self {
        Self(Some(value))
    }

    /// Raw value, `None` when not set
    pub fn value(&self) -> Option<u64> {
        self.0
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    /// Strictly newer than `other`
    pub fn is_newer_than(&self, other: &Position) -> bool {
        match (self.0, other.0) {
            (Some(a), Some(b)) => a > b,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

impl From<u64> for Position {
    fn from(value: u64) -> Self {
        Position::new(value)
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    // NOT_SET sorts before every set position
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{}", v),
            None => write!(f, "not-set"),
        }
    }
}

/// Event emitted by a brook position stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionAdvanced {
    /// Brook that advanced
    pub brook_key: BrookKey,
    /// Position it advanced to
    pub new_position: Position,
}

impl PositionAdvanced {
    pub fn new(brook_key: BrookKey, new_position: impl Into<Position>) -> Self {
        Self {
            brook_key,
            new_position: new_position.into(),
        }
    }
}
