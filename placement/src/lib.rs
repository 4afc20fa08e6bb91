mod consistent;
mod placement;

pub use consistent::{ConsistentReplicaPlacement, NodeInvalidityReasons};
pub use placement::{AllocationRequest, ChunkPlacement};

use model::{MediumIndex, NodeId};
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, PlacementError>;

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("No such medium: {0}")]
    NoSuchMedium(MediumIndex),

    #[error("No such node: {0}")]
    NoSuchNode(NodeId),

    #[error("Invalid allocation request: {0}")]
    InvalidRequest(String),

    #[error("Not enough write targets on medium {medium}: needed {needed}, found {found}")]
    NotEnoughTargets {
        medium: MediumIndex,
        needed: usize,
        found: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Hard cap on replicas of one chunk in one rack, on top of the
    /// per-chunk limit derived from its replication settings.
    #[serde(default = "default_max_replicas_per_rack")]
    pub max_replicas_per_rack: usize,
    #[serde(default = "default_max_replicas_per_data_center")]
    pub max_replicas_per_data_center: usize,
    #[serde(default)]
    pub enable_data_center_awareness: bool,
    #[serde(default = "default_max_write_sessions_per_node")]
    pub max_write_sessions_per_node: u32,
    /// Load factor penalty per queued write session or replication entry.
    #[serde(default = "default_load_factor_queue_weight")]
    pub load_factor_queue_weight: f64,
    #[serde(default = "default_consistent_placement_token_count")]
    pub consistent_placement_token_count: u32,
    #[serde(default = "default_true")]
    pub enable_consistent_placement: bool,
}

fn default_max_replicas_per_rack() -> usize {
    64
}

fn default_max_replicas_per_data_center() -> usize {
    64
}

fn default_max_write_sessions_per_node() -> u32 {
    128
}

fn default_load_factor_queue_weight() -> f64 {
    0.01
}

fn default_consistent_placement_token_count() -> u32 {
    16
}

fn default_true() -> bool {
    true
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            max_replicas_per_rack: default_max_replicas_per_rack(),
            max_replicas_per_data_center: default_max_replicas_per_data_center(),
            enable_data_center_awareness: false,
            max_write_sessions_per_node: default_max_write_sessions_per_node(),
            load_factor_queue_weight: default_load_factor_queue_weight(),
            consistent_placement_token_count: default_consistent_placement_token_count(),
            enable_consistent_placement: true,
        }
    }
}
