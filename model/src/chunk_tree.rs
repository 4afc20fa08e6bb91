use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{AddAssign, Mul, SubAssign};

use crate::{AccountId, ChunkId, ChunkListId, ChunkViewId, DynamicStoreId, Replication};

/// Reference to any node of the chunk tree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChunkTreeRef {
    Chunk(ChunkId),
    ChunkList(ChunkListId),
    ChunkView(ChunkViewId),
    DynamicStore(DynamicStoreId),
}

impl ChunkTreeRef {
    pub fn as_chunk_list(&self) -> Option<ChunkListId> {
        match self {
            ChunkTreeRef::ChunkList(id) => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkTreeStatistics {
    pub row_count: i64,
    pub chunk_count: i64,
    pub chunk_list_count: i64,
    pub data_size: i64,
    pub disk_space: i64,
}

impl AddAssign for ChunkTreeStatistics {
    fn add_assign(&mut self, rhs: Self) {
        self.row_count += rhs.row_count;
        self.chunk_count += rhs.chunk_count;
        self.chunk_list_count += rhs.chunk_list_count;
        self.data_size += rhs.data_size;
        self.disk_space += rhs.disk_space;
    }
}

impl SubAssign for ChunkTreeStatistics {
    fn sub_assign(&mut self, rhs: Self) {
        self.row_count -= rhs.row_count;
        self.chunk_count -= rhs.chunk_count;
        self.chunk_list_count -= rhs.chunk_list_count;
        self.data_size -= rhs.data_size;
        self.disk_space -= rhs.disk_space;
    }
}

impl Mul<i64> for ChunkTreeStatistics {
    type Output = ChunkTreeStatistics;

    fn mul(self, rhs: i64) -> Self::Output {
        ChunkTreeStatistics {
            row_count: self.row_count * rhs,
            chunk_count: self.chunk_count * rhs,
            chunk_list_count: self.chunk_list_count * rhs,
            data_size: self.data_size * rhs,
            disk_space: self.disk_space * rhs,
        }
    }
}

impl ChunkTreeStatistics {
    pub fn is_zero(&self) -> bool {
        *self == ChunkTreeStatistics::default()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChunkListKind {
    Static,
    JournalRoot,
    SortedDynamicTablet,
    OrderedDynamicTablet,
}

/// An object (file, table, journal) owning a chunk list, with the
/// replication settings it imposes on everything below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkOwner {
    pub name: String,
    pub account: AccountId,
    pub replication: Replication,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkList {
    pub id: ChunkListId,
    pub kind: ChunkListKind,
    /// `None` marks a trimmed slot.
    pub children: Vec<Option<ChunkTreeRef>>,
    pub parents: BTreeMap<ChunkListId, u32>,
    pub statistics: ChunkTreeStatistics,
    pub owners: Vec<ChunkOwner>,
}

impl ChunkList {
    pub fn new(id: ChunkListId, kind: ChunkListKind) -> Self {
        Self {
            id,
            kind,
            children: Vec::new(),
            parents: BTreeMap::new(),
            statistics: ChunkTreeStatistics {
                chunk_list_count: 1,
                ..ChunkTreeStatistics::default()
            },
            owners: Vec::new(),
        }
    }

    pub fn child_refs(&self) -> impl Iterator<Item = ChunkTreeRef> + '_ {
        self.children.iter().filter_map(|child| *child)
    }
}

/// A row-range slice over a single chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkView {
    pub id: ChunkViewId,
    pub chunk: ChunkId,
    pub lower_row: Option<i64>,
    pub upper_row: Option<i64>,
    pub parents: BTreeMap<ChunkListId, u32>,
}

impl ChunkView {
    /// Narrows the underlying chunk statistics to the view's row range.
    pub fn statistics(&self, chunk: &ChunkTreeStatistics) -> ChunkTreeStatistics {
        let lower = self.lower_row.unwrap_or(0).clamp(0, chunk.row_count);
        let upper = self.upper_row.unwrap_or(chunk.row_count).clamp(lower, chunk.row_count);
        ChunkTreeStatistics {
            row_count: upper - lower,
            ..*chunk
        }
    }
}

/// Placeholder for an in-memory dynamic table store; contributes no data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicStore {
    pub id: DynamicStoreId,
    pub parents: BTreeMap<ChunkListId, u32>,
}

pub(crate) fn add_edge(parents: &mut BTreeMap<ChunkListId, u32>, parent: ChunkListId) {
    *parents.entry(parent).or_insert(0) += 1;
}

pub(crate) fn remove_edge(parents: &mut BTreeMap<ChunkListId, u32>, parent: ChunkListId) -> bool {
    match parents.get_mut(&parent) {
        Some(count) if *count > 1 => {
            *count -= 1;
            true
        }
        Some(_) => {
            parents.remove(&parent);
            true
        }
        None => false,
    }
}
