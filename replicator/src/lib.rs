mod automaton;
mod balancer;
mod clock;
mod cluster;
mod handle;
mod health;
mod job;
mod job_tracker;
mod messages;
mod repair_queue;
mod replicator;
mod scanner;
mod status;

pub use automaton::ChunkAutomaton;
pub use balancer::DecayingMaxMinBalancer;
pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::Cluster;
pub use handle::{
    AutomatonHandle, CellForwarder, Collaborators, JournalQuorumQuerier, PrimaryStateSource,
};
pub use health::{ChunkHealthSets, HealthSet, HealthSummary, OldestPartMissingChunks};
pub use job::{Job, JobError, JobErrorCode, JobState, JobType};
pub use job_tracker::{JobReconciliation, JobTracker};
pub use messages::*;
pub use repair_queue::RepairQueue;
pub use replicator::{ChunkReplicator, RepairQueueKind};
pub use scanner::ChunkScanner;
pub use status::{
    aggregated_replication, compute_chunk_statistics, ChunkStatistics, ChunkStatus,
    CrossMediumChunkStatus, MediumStatistics,
};

use model::{ChunkId, JobId, NodeId};
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, ReplicatorError>;

#[derive(Debug, thiserror::Error)]
pub enum ReplicatorError {
    #[error("Model error: {0}")]
    Model(#[from] model::ModelError),

    #[error("Placement error: {0}")]
    Placement(#[from] placement::PlacementError),

    #[error("Not leading: mutations are only accepted by the active master")]
    NotLeader,

    #[error("No such node: {0}")]
    NoSuchNode(NodeId),

    #[error("No such chunk: {0}")]
    NoSuchChunk(ChunkId),

    #[error("No such job: {0}")]
    NoSuchJob(JobId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not enough write targets: found {found}, need {needed}")]
    NotEnoughTargets { found: usize, needed: usize },

    #[error("Quorum query failed: {0}")]
    QuorumQuery(String),

    #[error("Forwarding to cell {0} failed: {1}")]
    Forwarding(model::CellTag, String),

    #[error("Automaton stopped")]
    Stopped,
}

/// Capacity of traffic between two data centers, by name. A missing name
/// stands for nodes without a data center.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterDcEdgeCapacity {
    pub src: Option<String>,
    pub dst: Option<String>,
    pub capacity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterDcLimits {
    /// Concurrent cross data center jobs allowed on an edge without an
    /// explicit capacity.
    #[serde(default = "default_inter_dc_capacity")]
    pub default_capacity: i64,
    #[serde(default)]
    pub capacities: Vec<InterDcEdgeCapacity>,
}

impl Default for InterDcLimits {
    fn default() -> Self {
        Self {
            default_capacity: default_inter_dc_capacity(),
            capacities: Vec::new(),
        }
    }
}

fn default_inter_dc_capacity() -> i64 {
    64
}

/// Dynamic replicator configuration. Durations are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicatorConfig {
    #[serde(default = "default_true")]
    pub enable_replicator: bool,
    #[serde(default = "default_true")]
    pub enable_refresh: bool,
    #[serde(default = "default_true")]
    pub enable_requisition_update: bool,
    #[serde(default = "default_true")]
    pub enable_replication: bool,
    #[serde(default = "default_true")]
    pub enable_removal: bool,
    #[serde(default = "default_true")]
    pub enable_repair: bool,
    #[serde(default = "default_true")]
    pub enable_balancing: bool,
    #[serde(default = "default_true")]
    pub enable_sealing: bool,

    #[serde(default = "default_max_chunks_per_scan")]
    pub max_blob_chunks_per_refresh: usize,
    #[serde(default = "default_max_time_per_scan_ms")]
    pub max_time_per_blob_refresh_ms: u64,
    #[serde(default = "default_max_chunks_per_scan")]
    pub max_journal_chunks_per_refresh: usize,
    #[serde(default = "default_max_time_per_scan_ms")]
    pub max_time_per_journal_refresh_ms: u64,
    #[serde(default = "default_max_chunks_per_scan")]
    pub max_blob_chunks_per_requisition_update: usize,
    #[serde(default = "default_max_time_per_scan_ms")]
    pub max_time_per_blob_requisition_update_ms: u64,
    #[serde(default = "default_max_chunks_per_scan")]
    pub max_journal_chunks_per_requisition_update: usize,
    #[serde(default = "default_max_time_per_scan_ms")]
    pub max_time_per_journal_requisition_update_ms: u64,

    #[serde(default = "default_refresh_period_ms")]
    pub refresh_period_ms: u64,
    #[serde(default = "default_requisition_update_period_ms")]
    pub requisition_update_period_ms: u64,
    /// Delay before a chunk touched by a replica change is refreshed.
    #[serde(default = "default_chunk_refresh_delay_ms")]
    pub chunk_refresh_delay_ms: u64,
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
    #[serde(default = "default_health_check_period_ms")]
    pub health_check_period_ms: u64,
    #[serde(default = "default_seal_scan_period_ms")]
    pub seal_scan_period_ms: u64,
    #[serde(default = "default_max_chunks_per_seal_scan")]
    pub max_chunks_per_seal_scan: usize,
    #[serde(default = "default_finished_traversal_flush_period_ms")]
    pub finished_traversal_flush_period_ms: u64,
    #[serde(default = "default_max_chunks_per_traversal_step")]
    pub max_chunks_per_traversal_step: usize,

    #[serde(default = "default_max_misscheduled_jobs")]
    pub max_misscheduled_replication_jobs_per_heartbeat: usize,
    #[serde(default = "default_max_misscheduled_jobs")]
    pub max_misscheduled_repair_jobs_per_heartbeat: usize,
    #[serde(default = "default_max_misscheduled_jobs")]
    pub max_misscheduled_removal_jobs_per_heartbeat: usize,
    #[serde(default = "default_max_misscheduled_jobs")]
    pub max_misscheduled_seal_jobs_per_heartbeat: usize,

    /// Nodes filled above this fraction of a medium shed replicas to
    /// emptier nodes.
    #[serde(default = "default_min_balancing_fill_factor")]
    pub min_balancing_fill_factor: f64,
    /// Minimal fill factor gap between source and target for a balancing move.
    #[serde(default = "default_min_balancing_fill_factor_diff")]
    pub min_balancing_fill_factor_diff: f64,
    #[serde(default = "default_max_balancing_jobs_per_heartbeat")]
    pub max_balancing_jobs_per_heartbeat: usize,

    #[serde(default = "default_repair_balancer_half_life_ms")]
    pub repair_balancer_half_life_ms: u64,

    #[serde(default = "default_safe_online_node_count")]
    pub safe_online_node_count: usize,
    #[serde(default = "default_safe_lost_chunk_count")]
    pub safe_lost_chunk_count: usize,
    #[serde(default = "default_safe_lost_chunk_fraction")]
    pub safe_lost_chunk_fraction: f64,

    #[serde(default = "default_max_oldest_part_missing_chunks")]
    pub max_oldest_part_missing_chunks: usize,

    #[serde(default)]
    pub inter_dc_limits: InterDcLimits,

    /// Lets repair place two parts of one erasure chunk on the same node.
    #[serde(default)]
    pub allow_multiple_erasure_parts_per_node: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_chunks_per_scan() -> usize {
    10_000
}

fn default_max_time_per_scan_ms() -> u64 {
    100
}

fn default_refresh_period_ms() -> u64 {
    100
}

fn default_requisition_update_period_ms() -> u64 {
    1_000
}

fn default_chunk_refresh_delay_ms() -> u64 {
    30_000
}

fn default_job_timeout_ms() -> u64 {
    300_000
}

fn default_health_check_period_ms() -> u64 {
    10_000
}

fn default_seal_scan_period_ms() -> u64 {
    1_000
}

fn default_max_chunks_per_seal_scan() -> usize {
    100
}

fn default_finished_traversal_flush_period_ms() -> u64 {
    1_000
}

fn default_max_chunks_per_traversal_step() -> usize {
    1_000
}

fn default_max_misscheduled_jobs() -> usize {
    128
}

fn default_min_balancing_fill_factor() -> f64 {
    0.85
}

fn default_min_balancing_fill_factor_diff() -> f64 {
    0.2
}

fn default_max_balancing_jobs_per_heartbeat() -> usize {
    8
}

fn default_repair_balancer_half_life_ms() -> u64 {
    60_000
}

fn default_safe_online_node_count() -> usize {
    0
}

fn default_safe_lost_chunk_count() -> usize {
    1_000
}

fn default_safe_lost_chunk_fraction() -> f64 {
    0.5
}

fn default_max_oldest_part_missing_chunks() -> usize {
    100
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            enable_replicator: true,
            enable_refresh: true,
            enable_requisition_update: true,
            enable_replication: true,
            enable_removal: true,
            enable_repair: true,
            enable_balancing: true,
            enable_sealing: true,
            max_blob_chunks_per_refresh: default_max_chunks_per_scan(),
            max_time_per_blob_refresh_ms: default_max_time_per_scan_ms(),
            max_journal_chunks_per_refresh: default_max_chunks_per_scan(),
            max_time_per_journal_refresh_ms: default_max_time_per_scan_ms(),
            max_blob_chunks_per_requisition_update: default_max_chunks_per_scan(),
            max_time_per_blob_requisition_update_ms: default_max_time_per_scan_ms(),
            max_journal_chunks_per_requisition_update: default_max_chunks_per_scan(),
            max_time_per_journal_requisition_update_ms: default_max_time_per_scan_ms(),
            refresh_period_ms: default_refresh_period_ms(),
            requisition_update_period_ms: default_requisition_update_period_ms(),
            chunk_refresh_delay_ms: default_chunk_refresh_delay_ms(),
            job_timeout_ms: default_job_timeout_ms(),
            health_check_period_ms: default_health_check_period_ms(),
            seal_scan_period_ms: default_seal_scan_period_ms(),
            max_chunks_per_seal_scan: default_max_chunks_per_seal_scan(),
            finished_traversal_flush_period_ms: default_finished_traversal_flush_period_ms(),
            max_chunks_per_traversal_step: default_max_chunks_per_traversal_step(),
            max_misscheduled_replication_jobs_per_heartbeat: default_max_misscheduled_jobs(),
            max_misscheduled_repair_jobs_per_heartbeat: default_max_misscheduled_jobs(),
            max_misscheduled_removal_jobs_per_heartbeat: default_max_misscheduled_jobs(),
            max_misscheduled_seal_jobs_per_heartbeat: default_max_misscheduled_jobs(),
            min_balancing_fill_factor: default_min_balancing_fill_factor(),
            min_balancing_fill_factor_diff: default_min_balancing_fill_factor_diff(),
            max_balancing_jobs_per_heartbeat: default_max_balancing_jobs_per_heartbeat(),
            repair_balancer_half_life_ms: default_repair_balancer_half_life_ms(),
            safe_online_node_count: default_safe_online_node_count(),
            safe_lost_chunk_count: default_safe_lost_chunk_count(),
            safe_lost_chunk_fraction: default_safe_lost_chunk_fraction(),
            max_oldest_part_missing_chunks: default_max_oldest_part_missing_chunks(),
            inter_dc_limits: InterDcLimits::default(),
            allow_multiple_erasure_parts_per_node: false,
        }
    }
}

impl ReplicatorConfig {
    pub fn job_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.job_timeout_ms as i64)
    }

    pub fn chunk_refresh_delay(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.chunk_refresh_delay_ms as i64)
    }
}
