mod chunk;
mod chunk_tree;
mod erasure;
mod ids;
mod medium;
mod node;
mod requisition;
mod snapshot;
mod store;

pub use chunk::{Chunk, ChunkInfo, ChunkKind, ChunkReplica, ReplicaState, ScanKind};
pub use chunk_tree::{
    ChunkList, ChunkListKind, ChunkOwner, ChunkTreeRef, ChunkTreeStatistics, ChunkView, DynamicStore,
};
pub use erasure::{ErasureCodec, PartIndexSet};
pub use ids::{
    AccountId, CellTag, ChunkId, ChunkListId, ChunkPartLocation, ChunkPartRef, ChunkViewId,
    DataCenterId, DynamicStoreId, JobId, MediumIndex, MediumMap, MediumSet, NodeId, RackIndex,
    ReplicaIndex, TransactionId,
};
pub use medium::{Medium, MediumConfig, MAX_MEDIUM_PRIORITY};
pub use node::{
    DataCenter, Node, NodeDirectory, NodeMediumStatistics, NodeResources, NodeState, Rack,
};
pub use requisition::{
    EphemeralRequisitionRegistry, Replication, ReplicationPolicy, Requisition, RequisitionEntry,
    RequisitionIndex, RequisitionRegistry,
};
pub use snapshot::{decode_snapshot, encode_snapshot, read_snapshot, write_snapshot};
pub use store::{ChunkStore, CreateChunkSpec, DEFAULT_MEDIUM_NAME};

/// Upper bound on the number of media a cell may define.
pub const MAX_MEDIUM_COUNT: usize = 64;

/// Upper bound on replica indexes; erasure part indexes live below it.
pub const REPLICA_INDEX_BOUND: usize = 32;

pub const MAX_REPLICATION_FACTOR: u8 = 20;

/// Number of replication queue priority tiers per node.
pub const REPLICATION_PRIORITY_COUNT: usize = 3;

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No such chunk: {0}")]
    NoSuchChunk(ChunkId),

    #[error("No such chunk list: {0}")]
    NoSuchChunkList(ChunkListId),

    #[error("No such chunk view: {0}")]
    NoSuchChunkView(ChunkViewId),

    #[error("No such dynamic store: {0}")]
    NoSuchDynamicStore(DynamicStoreId),

    #[error("No such medium: {0}")]
    NoSuchMedium(String),

    #[error("No such node: {0}")]
    NoSuchNode(NodeId),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid medium name: {0}")]
    InvalidMediumName(String),

    #[error("Invalid medium priority {priority}: must be in range [0, {max}]")]
    InvalidMediumPriority { priority: u8, max: u8 },

    #[error("Too many media: limit is {0}")]
    TooManyMedia(usize),

    #[error("Invalid replication factor: {0}")]
    InvalidReplicationFactor(String),

    #[error("Invalid quorum: {0}")]
    InvalidQuorum(String),

    #[error("Chunk {0} is not confirmed")]
    ChunkNotConfirmed(ChunkId),

    #[error("Chunk {0} is not a journal chunk")]
    NotJournalChunk(ChunkId),

    #[error("Chunk tree {0:?} is still referenced")]
    ChunkTreeInUse(ChunkTreeRef),

    #[error("Invalid chunk tree: {0}")]
    InvalidChunkTree(String),

    #[error("Statistics mismatch in chunk list {list}: expected {expected:?}, actual {actual:?}")]
    StatisticsMismatch {
        list: ChunkListId,
        expected: ChunkTreeStatistics,
        actual: ChunkTreeStatistics,
    },

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for ModelError {
    fn from(err: bincode::Error) -> Self {
        ModelError::Serialization(err.to_string())
    }
}
