//! Request priorities and the HTTP/2 dependency tree built from them.
//!
//! The tree is a single chain: every stream depends exclusively on the
//! stream just before it in (priority, creation) order. That keeps the
//! wire representation equivalent to strict priority scheduling.

pub mod legacy;

use super::stream::StreamId;
use legacy::{SpdyPriority, NUM_SPDY_PRIORITIES};
use std::collections::HashMap;

/// Caller-facing request priority, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum RequestPriority {
    Throttled = 0,
    Idle = 1,
    Lowest = 2,
    #[default]
    Low = 3,
    Medium = 4,
    Highest = 5,
}

impl RequestPriority {
    pub const MINIMUM: RequestPriority = RequestPriority::Throttled;
    pub const MAXIMUM: RequestPriority = RequestPriority::Highest;

    /// Number of distinct priorities
    pub const COUNT: usize = 6;

    /// All priorities, most urgent first
    pub const HIGHEST_FIRST: [RequestPriority; Self::COUNT] = [
        RequestPriority::Highest,
        RequestPriority::Medium,
        RequestPriority::Low,
        RequestPriority::Lowest,
        RequestPriority::Idle,
        RequestPriority::Throttled,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RequestPriority::Throttled),
            1 => Some(RequestPriority::Idle),
            2 => Some(RequestPriority::Lowest),
            3 => Some(RequestPriority::Low),
            4 => Some(RequestPriority::Medium),
            5 => Some(RequestPriority::Highest),
            _ => None,
        }
    }

    /// Index for per-priority tables
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            RequestPriority::Throttled => "THROTTLED",
            RequestPriority::Idle => "IDLE",
            RequestPriority::Lowest => "LOWEST",
            RequestPriority::Low => "LOW",
            RequestPriority::Medium => "MEDIUM",
            RequestPriority::Highest => "HIGHEST",
        }
    }
}

/// New parent for a stream, to be sent in a PRIORITY frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyUpdate {
    pub id: StreamId,
    pub parent_stream_id: StreamId,
    pub exclusive: bool,
}

/// Total order of open streams by SPDY priority
#[derive(Debug, Default)]
pub struct PriorityTree {
    buckets: [Vec<StreamId>; NUM_SPDY_PRIORITIES],
    priorities: HashMap<StreamId, SpdyPriority>,
}

impl PriorityTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.priorities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.priorities.is_empty()
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.priorities.contains_key(&id)
    }

    /// Register a stream and return its (parent, exclusive) dependency.
    ///
    /// The parent is the last stream whose priority is at least as urgent,
    /// or the root (0).
    pub fn on_stream_creation(&mut self, id: StreamId, priority: SpdyPriority) -> (StreamId, bool) {
        let priority = priority.min(legacy::LOWEST_SPDY_PRIORITY);
        let parent = self.last_at_or_above(priority).unwrap_or(0);
        self.buckets[priority as usize].push(id);
        self.priorities.insert(id, priority);
        (parent, true)
    }

    /// Move a stream to a new priority. Returns the dependency changes to
    /// put on the wire, in order.
    pub fn on_stream_update(&mut self, id: StreamId, new_priority: SpdyPriority) -> Vec<DependencyUpdate> {
        let new_priority = new_priority.min(legacy::LOWEST_SPDY_PRIORITY);
        let Some(&old_priority) = self.priorities.get(&id) else {
            return Vec::new();
        };
        if old_priority == new_priority {
            return Vec::new();
        }

        let mut updates = Vec::with_capacity(2);

        // Whoever hung below us takes our old place in the chain.
        if let Some(child) = self.child_of(id) {
            updates.push(DependencyUpdate {
                id: child,
                parent_stream_id: self.parent_of(id).unwrap_or(0),
                exclusive: true,
            });
        }

        self.remove_from_bucket(id, old_priority);
        let parent = self.last_at_or_above(new_priority).unwrap_or(0);
        self.buckets[new_priority as usize].push(id);
        self.priorities.insert(id, new_priority);

        updates.push(DependencyUpdate {
            id,
            parent_stream_id: parent,
            exclusive: true,
        });
        updates
    }

    /// Forget a stream. Its children implicitly move up to its parent.
    pub fn on_stream_destruction(&mut self, id: StreamId) {
        if let Some(priority) = self.priorities.remove(&id) {
            self.remove_from_bucket(id, priority);
        }
    }

    /// Stream this one currently depends on, `None` for the root
    pub fn parent_of(&self, id: StreamId) -> Option<StreamId> {
        let priority = *self.priorities.get(&id)?;
        let bucket = &self.buckets[priority as usize];
        let pos = bucket.iter().position(|&s| s == id)?;
        if pos > 0 {
            return Some(bucket[pos - 1]);
        }
        (0..priority)
            .rev()
            .find_map(|p| self.buckets[p as usize].last().copied())
    }

    /// Stream that depends on this one, if any
    pub fn child_of(&self, id: StreamId) -> Option<StreamId> {
        let priority = *self.priorities.get(&id)?;
        let bucket = &self.buckets[priority as usize];
        let pos = bucket.iter().position(|&s| s == id)?;
        if let Some(&next) = bucket.get(pos + 1) {
            return Some(next);
        }
        (priority as usize + 1..NUM_SPDY_PRIORITIES).find_map(|p| self.buckets[p].first().copied())
    }

    fn last_at_or_above(&self, priority: SpdyPriority) -> Option<StreamId> {
        (0..=priority)
            .rev()
            .find_map(|p| self.buckets[p as usize].last().copied())
    }

    fn remove_from_bucket(&mut self, id: StreamId, priority: SpdyPriority) {
        self.buckets[priority as usize].retain(|&s| s != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_priority_order() {
        assert!(RequestPriority::Highest > RequestPriority::Medium);
        assert!(RequestPriority::Throttled < RequestPriority::Idle);
        assert_eq!(RequestPriority::HIGHEST_FIRST[0], RequestPriority::MAXIMUM);
        assert_eq!(RequestPriority::default(), RequestPriority::Low);
        assert_eq!(RequestPriority::from_u8(4), Some(RequestPriority::Medium));
        assert_eq!(RequestPriority::from_u8(6), None);
    }

    #[test]
    fn test_creation_builds_chain() {
        let mut tree = PriorityTree::new();
        assert_eq!(tree.on_stream_creation(1, 2), (0, true));
        assert_eq!(tree.on_stream_creation(3, 2), (1, true));
        // More urgent than everything: depends on the root
        assert_eq!(tree.on_stream_creation(5, 0), (0, true));
        // Goes after the last stream at or above priority 4
        assert_eq!(tree.on_stream_creation(7, 4), (3, true));
        // Priority 1 slots in under stream 5
        assert_eq!(tree.on_stream_creation(9, 1), (5, true));
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn test_parent_and_child() {
        let mut tree = PriorityTree::new();
        tree.on_stream_creation(1, 0);
        tree.on_stream_creation(3, 3);
        tree.on_stream_creation(5, 3);

        assert_eq!(tree.parent_of(1), None);
        assert_eq!(tree.parent_of(3), Some(1));
        assert_eq!(tree.child_of(1), Some(3));
        assert_eq!(tree.child_of(3), Some(5));
        assert_eq!(tree.child_of(5), None);
    }

    #[test]
    fn test_destruction() {
        let mut tree = PriorityTree::new();
        tree.on_stream_creation(1, 3);
        tree.on_stream_creation(3, 3);
        tree.on_stream_destruction(1);
        tree.on_stream_destruction(1);

        assert!(!tree.contains(1));
        assert_eq!(tree.parent_of(3), None);
        assert_eq!(tree.on_stream_creation(5, 3), (3, true));
    }

    #[test]
    fn test_update_to_lower_priority() {
        let mut tree = PriorityTree::new();
        tree.on_stream_creation(1, 0);
        tree.on_stream_creation(3, 1);
        tree.on_stream_creation(5, 2);

        let updates = tree.on_stream_update(3, 3);
        assert_eq!(
            updates,
            vec![
                DependencyUpdate {
                    id: 5,
                    parent_stream_id: 1,
                    exclusive: true
                },
                DependencyUpdate {
                    id: 3,
                    parent_stream_id: 5,
                    exclusive: true
                },
            ]
        );
        assert_eq!(tree.child_of(5), Some(3));
    }

    #[test]
    fn test_update_to_higher_priority() {
        let mut tree = PriorityTree::new();
        tree.on_stream_creation(1, 0);
        tree.on_stream_creation(3, 1);
        tree.on_stream_creation(5, 4);

        let updates = tree.on_stream_update(5, 0);
        assert_eq!(
            updates,
            vec![DependencyUpdate {
                id: 5,
                parent_stream_id: 1,
                exclusive: true
            }]
        );
        assert_eq!(tree.child_of(5), Some(3));
    }

    #[test]
    fn test_update_noop() {
        let mut tree = PriorityTree::new();
        tree.on_stream_creation(1, 2);
        assert!(tree.on_stream_update(1, 2).is_empty());
        assert!(tree.on_stream_update(99, 0).is_empty());
    }
}
