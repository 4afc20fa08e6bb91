use serde::{Deserialize, Serialize};

use model::{
    CellTag, ChunkId, ChunkInfo, ChunkKind, ChunkListId, ChunkListKind, ChunkOwner, ChunkReplica,
    ChunkTreeRef, CreateChunkSpec, ErasureCodec, JobId, MediumIndex, NodeId, NodeResources,
    ReplicaIndex, ReplicaState, Requisition,
};

use crate::health::{HealthSet, HealthSummary};
use crate::job::{JobError, JobState, JobType};
use crate::status::ChunkStatistics;

fn generic_state() -> ReplicaState {
    ReplicaState::Generic
}

fn generic_index() -> ReplicaIndex {
    ReplicaIndex::GENERIC
}

/// Limits assumed for nodes that do not report their own; all-zero limits
/// would keep the node out of every job.
fn default_resource_limits() -> NodeResources {
    NodeResources {
        replication_slots: 8,
        replication_data_size: 1 << 30,
        repair_slots: 4,
        repair_data_size: 1 << 30,
        removal_slots: 64,
        seal_slots: 16,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub address: String,
    #[serde(default)]
    pub rack: Option<String>,
    #[serde(default)]
    pub data_center: Option<String>,
    /// Tokens the node contributes to the consistent placement ring; zero
    /// picks the configured default.
    #[serde(default)]
    pub consistent_placement_token_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeResponse {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MediumReport {
    pub medium: MediumIndex,
    pub total_space: i64,
    pub used_space: i64,
    #[serde(default)]
    pub session_count: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ReplicaReport {
    pub chunk_id: ChunkId,
    #[serde(default = "generic_index")]
    pub replica_index: ReplicaIndex,
    pub medium: MediumIndex,
    #[serde(default = "generic_state")]
    pub state: ReplicaState,
    #[serde(default)]
    pub cached: bool,
}

impl ReplicaReport {
    pub fn generic(chunk_id: ChunkId, medium: MediumIndex) -> Self {
        Self {
            chunk_id,
            replica_index: ReplicaIndex::GENERIC,
            medium,
            state: ReplicaState::Generic,
            cached: false,
        }
    }
}

/// First heartbeat after registration: the complete replica inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullHeartbeatRequest {
    pub node_id: NodeId,
    #[serde(default)]
    pub media: Vec<MediumReport>,
    #[serde(default)]
    pub replicas: Vec<ReplicaReport>,
    #[serde(default = "default_resource_limits")]
    pub resource_limits: NodeResources,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FullHeartbeatResponse {
    /// Chunks this node should announce to its peers.
    pub announce_replicas: Vec<ChunkId>,
    /// Reported replicas of chunks the master does not know; the node
    /// deletes them.
    pub unknown_chunks: Vec<ChunkId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatusReport {
    pub job_id: JobId,
    pub state: JobState,
    #[serde(default)]
    pub error: Option<JobError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalHeartbeatRequest {
    pub node_id: NodeId,
    #[serde(default)]
    pub media: Vec<MediumReport>,
    #[serde(default)]
    pub added_replicas: Vec<ReplicaReport>,
    #[serde(default)]
    pub removed_replicas: Vec<ReplicaReport>,
    #[serde(default)]
    pub jobs: Vec<JobStatusReport>,
    #[serde(default)]
    pub resource_limits: Option<NodeResources>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobTarget {
    pub node_id: NodeId,
    pub address: String,
    pub replica_index: ReplicaIndex,
    pub medium: MediumIndex,
}

/// Everything a node needs to run one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSpec {
    pub job_id: JobId,
    pub job_type: JobType,
    pub chunk_id: ChunkId,
    pub replica_index: ReplicaIndex,
    pub medium: MediumIndex,
    #[serde(default)]
    pub targets: Vec<JobTarget>,
    #[serde(default)]
    pub erased_parts: Vec<ReplicaIndex>,
    #[serde(default)]
    pub row_count: Option<i64>,
    #[serde(default)]
    pub decommission: bool,
    #[serde(default)]
    pub data_size: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncrementalHeartbeatResponse {
    pub jobs_to_start: Vec<JobSpec>,
    pub jobs_to_abort: Vec<JobId>,
    pub jobs_to_remove: Vec<JobId>,
    pub announce_replicas: Vec<ChunkId>,
    pub disable_write_sessions: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateWriteTargetsRequest {
    pub chunk_id: ChunkId,
    pub medium: String,
    pub desired_count: usize,
    pub min_count: usize,
    #[serde(default)]
    pub replication_factor_override: Option<u8>,
    #[serde(default)]
    pub forbidden_addresses: Vec<String>,
    #[serde(default)]
    pub preferred_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WriteTarget {
    pub node_id: NodeId,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateWriteTargetsResponse {
    pub targets: Vec<WriteTarget>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConfirmedReplica {
    pub node_id: NodeId,
    #[serde(default = "generic_index")]
    pub replica_index: ReplicaIndex,
    pub medium: MediumIndex,
    #[serde(default = "generic_state")]
    pub state: ReplicaState,
}

/// One mutation of a chunk tree batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchSubrequest {
    CreateChunk(CreateChunkSpec),
    ConfirmChunk {
        chunk_id: ChunkId,
        info: ChunkInfo,
        #[serde(default)]
        replicas: Vec<ConfirmedReplica>,
    },
    SealChunk {
        chunk_id: ChunkId,
        row_count: i64,
    },
    /// Hands an unsealed journal chunk over to the background sealer.
    MarkSealable {
        chunk_id: ChunkId,
    },
    CreateChunkLists {
        kind: ChunkListKind,
        count: usize,
    },
    UnstageChunkTree {
        root: ChunkTreeRef,
        #[serde(default)]
        recursive: bool,
    },
    AttachChunkTrees {
        parent: ChunkListId,
        children: Vec<ChunkTreeRef>,
    },
    DetachChunkTree {
        parent: ChunkListId,
        child: ChunkTreeRef,
    },
    SetOwner {
        chunk_list: ChunkListId,
        owner: ChunkOwner,
    },
    RemoveOwner {
        chunk_list: ChunkListId,
        name: String,
    },
    DestroyChunk {
        chunk_id: ChunkId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub subrequests: Vec<BatchSubrequest>,
}

/// Outcome of one subrequest; failures do not abort the rest of the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchSubresponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<ChunkId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunk_list_ids: Vec<ChunkListId>,
}

impl BatchSubresponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            ok: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub subresponses: Vec<BatchSubresponse>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RequisitionUpdate {
    pub chunk_id: ChunkId,
    /// Index into the request's dictionary.
    pub requisition_index: u32,
}

/// Requisition changes computed by `cell_tag` for chunks it references,
/// with a request-local dictionary of the requisitions involved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequisitionUpdateRequest {
    pub cell_tag: CellTag,
    pub updates: Vec<RequisitionUpdate>,
    pub dictionary: Vec<(u32, Requisition)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequisitionUpdateResponse {
    pub applied: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkStatusView {
    pub chunk_id: ChunkId,
    pub kind: ChunkKind,
    pub erasure_codec: ErasureCodec,
    pub confirmed: bool,
    pub sealed: bool,
    pub native_cell: CellTag,
    pub replicas: Vec<ChunkReplica>,
    pub requisition: Requisition,
    pub statistics: ChunkStatistics,
    pub job: Option<JobId>,
    pub health_sets: Vec<HealthSet>,
}

/// An abandoned journal chunk awaiting a quorum query and seal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SealCandidate {
    pub chunk_id: ChunkId,
    pub read_quorum: u8,
    pub replicas: Vec<WriteTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NodeAdminRequest {
    SetRack {
        #[serde(default)]
        rack: Option<String>,
        #[serde(default)]
        data_center: Option<String>,
    },
    SetDecommissioned {
        decommissioned: bool,
    },
    SetWriteSessionsDisabled {
        disabled: bool,
    },
    /// Takes the node offline and forgets its replicas.
    Unregister,
    /// Unregisters the node and drops it from the directory.
    Dispose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    pub node_id: NodeId,
    pub address: String,
    pub state: model::NodeState,
    pub rack: Option<String>,
    pub data_center: Option<String>,
    pub decommissioned: bool,
    pub disable_write_sessions: bool,
    pub replica_count: usize,
    pub running_jobs: usize,
    pub removal_queue_size: usize,
    pub replication_queue_size: usize,
    pub seal_queue_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorStatus {
    pub leading: bool,
    pub enabled: Option<bool>,
    pub epoch: u64,
    pub chunk_count: usize,
    pub online_node_count: usize,
    pub refresh_queue_size: usize,
    pub requisition_update_queue_size: usize,
    pub running_jobs: usize,
    pub active_traversals: usize,
    pub health: HealthSummary,
}
