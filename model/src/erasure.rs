use serde::{Deserialize, Serialize};

use crate::{ReplicaIndex, REPLICA_INDEX_BOUND};

/// Erasure codecs known to the cell.
///
/// Only the part layout and the repairability predicate matter to the
/// control plane; encoding itself happens on storage nodes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErasureCodec {
    #[default]
    None,
    ReedSolomon3_3,
    ReedSolomon6_3,
    ReedSolomon10_4,
}

impl ErasureCodec {
    pub fn is_erasure(self) -> bool {
        self != ErasureCodec::None
    }

    pub fn data_part_count(self) -> usize {
        match self {
            ErasureCodec::None => 1,
            ErasureCodec::ReedSolomon3_3 => 3,
            ErasureCodec::ReedSolomon6_3 => 6,
            ErasureCodec::ReedSolomon10_4 => 10,
        }
    }

    pub fn parity_part_count(self) -> usize {
        match self {
            ErasureCodec::None => 0,
            ErasureCodec::ReedSolomon3_3 => 3,
            ErasureCodec::ReedSolomon6_3 => 3,
            ErasureCodec::ReedSolomon10_4 => 4,
        }
    }

    pub fn total_part_count(self) -> usize {
        self.data_part_count() + self.parity_part_count()
    }

    /// Number of parts that may be lost with repair still guaranteed.
    pub fn guaranteed_repairable_part_count(self) -> usize {
        self.parity_part_count()
    }

    pub fn can_repair(self, erased: &PartIndexSet) -> bool {
        if erased.iter().any(|index| index.as_usize() >= self.total_part_count()) {
            return false;
        }
        erased.len() <= self.guaranteed_repairable_part_count()
    }

    pub fn data_parts(self) -> PartIndexSet {
        PartIndexSet::range(0, self.data_part_count())
    }

    pub fn parity_parts(self) -> PartIndexSet {
        PartIndexSet::range(self.data_part_count(), self.total_part_count())
    }

    pub fn is_data_part(self, index: ReplicaIndex) -> bool {
        index.as_usize() < self.data_part_count()
    }
}

/// Bitset of erasure part indexes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PartIndexSet(u32);

impl PartIndexSet {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn range(begin: usize, end: usize) -> Self {
        (begin..end.min(REPLICA_INDEX_BOUND))
            .map(|index| ReplicaIndex(index as u8))
            .collect()
    }

    pub fn insert(&mut self, index: ReplicaIndex) {
        self.0 |= 1u32 << index.0;
    }

    pub fn remove(&mut self, index: ReplicaIndex) {
        self.0 &= !(1u32 << index.0);
    }

    pub fn contains(&self, index: ReplicaIndex) -> bool {
        self.0 & (1u32 << index.0) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn intersection(self, other: PartIndexSet) -> PartIndexSet {
        PartIndexSet(self.0 & other.0)
    }

    pub fn union(self, other: PartIndexSet) -> PartIndexSet {
        PartIndexSet(self.0 | other.0)
    }

    pub fn intersects(&self, other: &PartIndexSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = ReplicaIndex> + '_ {
        (0..REPLICA_INDEX_BOUND as u8)
            .map(ReplicaIndex)
            .filter(move |index| self.contains(*index))
    }

    /// Set with every bit up to the replica index bound.
    pub fn full() -> Self {
        Self(u32::MAX)
    }
}

impl FromIterator<ReplicaIndex> for PartIndexSet {
    fn from_iter<I: IntoIterator<Item = ReplicaIndex>>(iter: I) -> Self {
        let mut set = PartIndexSet::new();
        for index in iter {
            set.insert(index);
        }
        set
    }
}
