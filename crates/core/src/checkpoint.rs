//! Durable subscription cursor.

use serde::{Deserialize, Serialize};

/// The last successfully processed position for a subscription.
///
/// An absent position means "start from the beginning".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub position: Option<u64>,
}

impl Checkpoint {
    pub fn new(id: impl Into<String>, position: Option<u64>) -> Self {
        Self {
            id: id.into(),
            position,
        }
    }

    /// A checkpoint that has never been stored.
    pub fn empty(id: impl Into<String>) -> Self {
        Self::new(id, None)
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_none()
    }

    /// Merge with another value for the same id, keeping the furthest position.
    pub fn furthest(self, other: Option<u64>) -> Self {
        let position = match (self.position, other) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        Self { id: self.id, position }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn furthest_keeps_max() {
        assert_eq!(Checkpoint::new("s", Some(3)).furthest(Some(1)).position, Some(3));
        assert_eq!(Checkpoint::new("s", Some(3)).furthest(Some(9)).position, Some(9));
        assert_eq!(Checkpoint::empty("s").furthest(Some(2)).position, Some(2));
        assert_eq!(Checkpoint::empty("s").furthest(None).position, None);
    }
}
