use std::collections::{BTreeMap, HashMap};

use model::ChunkPartLocation;

/// FIFO of chunk parts awaiting repair with logarithmic removal and
/// resumable iteration by sequence number.
#[derive(Debug, Clone)]
pub struct RepairQueue {
    entries: BTreeMap<i64, ChunkPartLocation>,
    positions: HashMap<ChunkPartLocation, i64>,
    next_back: i64,
    next_front: i64,
}

impl RepairQueue {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            positions: HashMap::new(),
            next_back: 0,
            next_front: -1,
        }
    }

    /// Appends the entry unless it is already queued.
    pub fn push_back(&mut self, location: ChunkPartLocation) -> bool {
        if self.positions.contains_key(&location) {
            return false;
        }
        let seq = self.next_back;
        self.next_back += 1;
        self.entries.insert(seq, location);
        self.positions.insert(location, seq);
        true
    }

    /// Moves the entry to the head of the queue.
    pub fn push_front(&mut self, location: ChunkPartLocation) {
        self.remove(location);
        let seq = self.next_front;
        self.next_front -= 1;
        self.entries.insert(seq, location);
        self.positions.insert(location, seq);
    }

    pub fn remove(&mut self, location: ChunkPartLocation) -> bool {
        match self.positions.remove(&location) {
            Some(seq) => {
                self.entries.remove(&seq);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, location: ChunkPartLocation) -> bool {
        self.positions.contains_key(&location)
    }

    /// First entry strictly after `cursor`, or the head when there is none.
    pub fn next_after(&self, cursor: Option<i64>) -> Option<(i64, ChunkPartLocation)> {
        let mut range = match cursor {
            Some(seq) => self.entries.range(seq + 1..),
            None => self.entries.range(..),
        };
        range.next().map(|(seq, location)| (*seq, *location))
    }

    pub fn front(&self) -> Option<ChunkPartLocation> {
        self.entries.values().next().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.positions.clear();
    }
}

impl Default for RepairQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{ChunkId, MediumIndex, ReplicaIndex};

    fn location() -> ChunkPartLocation {
        ChunkPartLocation {
            chunk: ChunkId::new(),
            replica_index: ReplicaIndex::GENERIC,
            medium: MediumIndex(0),
        }
    }

    #[test]
    fn test_fifo_order_and_dedup() {
        let mut queue = RepairQueue::new();
        let (a, b) = (location(), location());
        assert!(queue.push_back(a));
        assert!(queue.push_back(b));
        assert!(!queue.push_back(a));
        assert_eq!(queue.len(), 2);

        let (seq, first) = queue.next_after(None).unwrap();
        assert_eq!(first, a);
        assert_eq!(queue.next_after(Some(seq)).map(|(_, l)| l), Some(b));
    }

    #[test]
    fn test_push_front_and_remove() {
        let mut queue = RepairQueue::new();
        let (a, b) = (location(), location());
        queue.push_back(a);
        queue.push_back(b);
        queue.push_front(b);
        assert_eq!(queue.front(), Some(b));
        assert_eq!(queue.len(), 2);

        assert!(queue.remove(b));
        assert!(!queue.contains(b));
        assert_eq!(queue.front(), Some(a));
    }
}
