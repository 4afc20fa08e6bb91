use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};
use uuid::Uuid;

use crate::MAX_MEDIUM_COUNT;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(ChunkId);
uuid_id!(ChunkListId);
uuid_id!(ChunkViewId);
uuid_id!(DynamicStoreId);
uuid_id!(JobId);
uuid_id!(TransactionId);

impl ChunkId {
    /// Stable 64-bit digest of the id, used to seed per-chunk orderings.
    pub fn hash64(&self) -> u64 {
        let bytes = self.0.as_bytes();
        let (hi, lo) = bytes.split_at(8);
        let hi = u64::from_le_bytes(hi.try_into().unwrap_or([0; 8]));
        let lo = u64::from_le_bytes(lo.try_into().unwrap_or([0; 8]));
        hi ^ lo.rotate_left(17)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellTag(pub u16);

impl fmt::Display for CellTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RackIndex(pub u16);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataCenterId(pub u16);

/// Index of a medium; kept distinct from [`ReplicaIndex`] so the two never mix.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MediumIndex(pub u8);

impl MediumIndex {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MediumIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Erasure part index, or [`ReplicaIndex::GENERIC`] for regular chunks.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicaIndex(pub u8);

impl ReplicaIndex {
    pub const GENERIC: ReplicaIndex = ReplicaIndex(0);

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ReplicaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A chunk together with one of its replica indexes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkPartRef {
    pub chunk: ChunkId,
    pub replica_index: ReplicaIndex,
}

impl ChunkPartRef {
    pub fn new(chunk: ChunkId, replica_index: ReplicaIndex) -> Self {
        Self { chunk, replica_index }
    }

    pub fn on_medium(self, medium: MediumIndex) -> ChunkPartLocation {
        ChunkPartLocation {
            chunk: self.chunk,
            replica_index: self.replica_index,
            medium,
        }
    }
}

/// A chunk part pinned to a medium.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkPartLocation {
    pub chunk: ChunkId,
    pub replica_index: ReplicaIndex,
    pub medium: MediumIndex,
}

impl ChunkPartLocation {
    pub fn part(self) -> ChunkPartRef {
        ChunkPartRef::new(self.chunk, self.replica_index)
    }
}

/// Bitset over medium indexes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MediumSet(u64);

impl MediumSet {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn single(medium: MediumIndex) -> Self {
        let mut set = Self::new();
        set.insert(medium);
        set
    }

    pub fn insert(&mut self, medium: MediumIndex) {
        self.0 |= 1u64 << medium.0;
    }

    pub fn remove(&mut self, medium: MediumIndex) {
        self.0 &= !(1u64 << medium.0);
    }

    pub fn contains(&self, medium: MediumIndex) -> bool {
        self.0 & (1u64 << medium.0) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn union(self, other: MediumSet) -> MediumSet {
        MediumSet(self.0 | other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = MediumIndex> + '_ {
        (0..MAX_MEDIUM_COUNT as u8)
            .map(MediumIndex)
            .filter(move |medium| self.contains(*medium))
    }
}

impl FromIterator<MediumIndex> for MediumSet {
    fn from_iter<I: IntoIterator<Item = MediumIndex>>(iter: I) -> Self {
        let mut set = MediumSet::new();
        for medium in iter {
            set.insert(medium);
        }
        set
    }
}

/// Fixed-capacity per-medium array addressed by [`MediumIndex`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediumMap<T> {
    slots: Vec<T>,
}

impl<T: Default> Default for MediumMap<T> {
    fn default() -> Self {
        Self {
            slots: (0..MAX_MEDIUM_COUNT).map(|_| T::default()).collect(),
        }
    }
}

impl<T> MediumMap<T> {
    pub fn iter(&self) -> impl Iterator<Item = (MediumIndex, &T)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, value)| (MediumIndex(index as u8), value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (MediumIndex, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .map(|(index, value)| (MediumIndex(index as u8), value))
    }
}

impl<T> Index<MediumIndex> for MediumMap<T> {
    type Output = T;

    fn index(&self, medium: MediumIndex) -> &T {
        &self.slots[medium.as_usize()]
    }
}

impl<T> IndexMut<MediumIndex> for MediumMap<T> {
    fn index_mut(&mut self, medium: MediumIndex) -> &mut T {
        &mut self.slots[medium.as_usize()]
    }
}
