use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    AccountId, CellTag, ChunkId, ChunkTreeRef, ChunkTreeStatistics, ErasureCodec, JobId,
    MediumIndex, NodeId, ReplicaIndex, RequisitionIndex, TransactionId,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChunkKind {
    Blob,
    Journal,
}

/// Replica state as reported by the node. Blob replicas are always
/// `Generic`; journal replicas move from `Active` to `Unsealed` or `Sealed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReplicaState {
    Generic,
    Active,
    Unsealed,
    Sealed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkReplica {
    pub node: NodeId,
    pub replica_index: ReplicaIndex,
    pub medium: MediumIndex,
    pub state: ReplicaState,
}

impl ChunkReplica {
    pub fn new(node: NodeId, replica_index: ReplicaIndex, medium: MediumIndex, state: ReplicaState) -> Self {
        Self {
            node,
            replica_index,
            medium,
            state,
        }
    }

    pub fn generic(node: NodeId, medium: MediumIndex) -> Self {
        Self::new(node, ReplicaIndex::GENERIC, medium, ReplicaState::Generic)
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.state, ReplicaState::Generic | ReplicaState::Sealed)
    }

    fn same_location(&self, other: &ChunkReplica) -> bool {
        self.node == other.node && self.replica_index == other.replica_index && self.medium == other.medium
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ScanKind {
    Refresh,
    RequisitionUpdate,
}

impl ScanKind {
    fn slot(self) -> usize {
        match self {
            ScanKind::Refresh => 0,
            ScanKind::RequisitionUpdate => 1,
        }
    }
}

/// Sizes reported when a chunk is confirmed or sealed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkInfo {
    pub row_count: i64,
    pub data_size: i64,
    pub disk_space: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub kind: ChunkKind,
    pub erasure_codec: ErasureCodec,
    pub read_quorum: u8,
    pub write_quorum: u8,
    pub confirmed: bool,
    pub sealed: bool,
    pub disk_size_final: bool,
    pub info: ChunkInfo,
    pub stored_replicas: Vec<ChunkReplica>,
    pub cached_replicas: Vec<ChunkReplica>,
    pub local_requisition: RequisitionIndex,
    pub external_requisitions: BTreeMap<CellTag, RequisitionIndex>,
    pub native_cell: CellTag,
    /// Chunk lists and chunk views referencing this chunk, with multiplicity.
    pub parents: BTreeMap<ChunkTreeRef, u32>,
    pub staging_transaction: Option<TransactionId>,
    pub staging_account: Option<AccountId>,
    pub endorsement_required: bool,
    pub endorsement_node: Option<NodeId>,
    pub consistent_placement_hash: Option<u64>,
    /// Journal chunks become sealable once the writer is done with them.
    pub sealable: bool,

    #[serde(skip)]
    pub job: Option<JobId>,
    #[serde(skip)]
    scan_epochs: [u64; 2],
    #[serde(skip)]
    pub part_loss_time: Option<DateTime<Utc>>,
}

impl Chunk {
    pub fn new(id: ChunkId, kind: ChunkKind, erasure_codec: ErasureCodec, native_cell: CellTag) -> Self {
        Self {
            id,
            kind,
            erasure_codec,
            read_quorum: 0,
            write_quorum: 0,
            confirmed: false,
            sealed: false,
            disk_size_final: false,
            info: ChunkInfo::default(),
            stored_replicas: Vec::new(),
            cached_replicas: Vec::new(),
            local_requisition: RequisitionIndex::EMPTY,
            external_requisitions: BTreeMap::new(),
            native_cell,
            parents: BTreeMap::new(),
            staging_transaction: None,
            staging_account: None,
            endorsement_required: false,
            endorsement_node: None,
            consistent_placement_hash: None,
            sealable: false,
            job: None,
            scan_epochs: [0; 2],
            part_loss_time: None,
        }
    }

    pub fn is_erasure(&self) -> bool {
        self.erasure_codec.is_erasure()
    }

    pub fn is_journal(&self) -> bool {
        self.kind == ChunkKind::Journal
    }

    pub fn is_blob(&self) -> bool {
        self.kind == ChunkKind::Blob
    }

    /// Blob chunks are sealed as soon as they are confirmed.
    pub fn is_sealed(&self) -> bool {
        match self.kind {
            ChunkKind::Blob => self.confirmed,
            ChunkKind::Journal => self.sealed,
        }
    }

    pub fn is_staged(&self) -> bool {
        self.staging_transaction.is_some()
    }

    pub fn statistics(&self) -> ChunkTreeStatistics {
        ChunkTreeStatistics {
            row_count: self.info.row_count,
            chunk_count: 1,
            chunk_list_count: 0,
            data_size: self.info.data_size,
            disk_space: self.info.disk_space,
        }
    }

    /// Adds a replica, replacing the state of an existing one at the same
    /// location. Returns false if nothing changed.
    pub fn add_replica(&mut self, replica: ChunkReplica, cached: bool) -> bool {
        let replicas = if cached {
            &mut self.cached_replicas
        } else {
            &mut self.stored_replicas
        };
        if let Some(existing) = replicas.iter_mut().find(|r| r.same_location(&replica)) {
            if existing.state == replica.state {
                return false;
            }
            existing.state = replica.state;
            return true;
        }
        replicas.push(replica);
        true
    }

    pub fn remove_replica(
        &mut self,
        node: NodeId,
        replica_index: ReplicaIndex,
        medium: MediumIndex,
        cached: bool,
    ) -> Option<ChunkReplica> {
        let replicas = if cached {
            &mut self.cached_replicas
        } else {
            &mut self.stored_replicas
        };
        let position = replicas
            .iter()
            .position(|r| r.node == node && r.replica_index == replica_index && r.medium == medium)?;
        Some(replicas.swap_remove(position))
    }

    pub fn replicas_on(&self, medium: MediumIndex) -> impl Iterator<Item = &ChunkReplica> {
        self.stored_replicas.iter().filter(move |r| r.medium == medium)
    }

    pub fn has_replica_on(&self, node: NodeId) -> bool {
        self.stored_replicas.iter().any(|r| r.node == node)
    }

    pub fn has_sealed_replica(&self) -> bool {
        self.stored_replicas.iter().any(|r| r.is_sealed())
    }

    pub fn add_parent(&mut self, parent: ChunkTreeRef) {
        *self.parents.entry(parent).or_insert(0) += 1;
    }

    pub fn remove_parent(&mut self, parent: ChunkTreeRef) -> bool {
        match self.parents.get_mut(&parent) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.parents.remove(&parent);
                true
            }
            None => false,
        }
    }

    /// Every requisition index the chunk holds: local first, then imports.
    pub fn requisition_indexes(&self) -> impl Iterator<Item = RequisitionIndex> + '_ {
        std::iter::once(self.local_requisition).chain(self.external_requisitions.values().copied())
    }

    pub fn scan_flag(&self, kind: ScanKind, epoch: u64) -> bool {
        self.scan_epochs[kind.slot()] == epoch
    }

    pub fn set_scan_flag(&mut self, kind: ScanKind, epoch: u64) {
        self.scan_epochs[kind.slot()] = epoch;
    }

    pub fn clear_scan_flag(&mut self, kind: ScanKind) {
        self.scan_epochs[kind.slot()] = 0;
    }
}
