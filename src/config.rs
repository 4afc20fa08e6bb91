use model::{CellTag, MediumConfig};
use placement::PlacementConfig;
use replicator::ReplicatorConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{MasterError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediumDefinition {
    pub name: String,
    #[serde(default)]
    pub config: MediumConfig,
}

/// Another cell's master, reached for requisition update forwarding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerCell {
    pub cell_tag: CellTag,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
    #[serde(default = "default_cell_tag")]
    pub cell_tag: CellTag,
    /// Base URL of the primary cell's master; unset on the primary itself.
    #[serde(default)]
    pub primary_url: Option<String>,
    #[serde(default)]
    pub peer_cells: Vec<PeerCell>,
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    #[serde(default = "default_snapshot_period_ms")]
    pub snapshot_period_ms: u64,
    /// Media created at startup when missing; "default" always exists.
    #[serde(default)]
    pub media: Vec<MediumDefinition>,
    /// Per-request timeout for calls to storage nodes and peer masters.
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,

    #[serde(default = "default_max_replicas_per_rack")]
    pub max_replicas_per_rack: usize,
    #[serde(default = "default_max_replicas_per_data_center")]
    pub max_replicas_per_data_center: usize,
    #[serde(default)]
    pub enable_data_center_awareness: bool,
    #[serde(default = "default_max_write_sessions_per_node")]
    pub max_write_sessions_per_node: u32,
    #[serde(default = "default_load_factor_queue_weight")]
    pub load_factor_queue_weight: f64,
    #[serde(default = "default_consistent_placement_token_count")]
    pub consistent_placement_token_count: u32,
    #[serde(default = "default_true")]
    pub enable_consistent_placement: bool,

    #[serde(default)]
    pub replicator: ReplicatorConfig,
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9013))
}

fn default_cell_tag() -> CellTag {
    CellTag(1)
}

fn default_snapshot_period_ms() -> u64 {
    60_000
}

fn default_remote_timeout_ms() -> u64 {
    5_000
}

fn default_max_replicas_per_rack() -> usize {
    PlacementConfig::default().max_replicas_per_rack
}

fn default_max_replicas_per_data_center() -> usize {
    PlacementConfig::default().max_replicas_per_data_center
}

fn default_max_write_sessions_per_node() -> u32 {
    PlacementConfig::default().max_write_sessions_per_node
}

fn default_load_factor_queue_weight() -> f64 {
    PlacementConfig::default().load_factor_queue_weight
}

fn default_consistent_placement_token_count() -> u32 {
    PlacementConfig::default().consistent_placement_token_count
}

fn default_true() -> bool {
    true
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            cell_tag: default_cell_tag(),
            primary_url: None,
            peer_cells: Vec::new(),
            snapshot_path: None,
            snapshot_period_ms: default_snapshot_period_ms(),
            media: Vec::new(),
            remote_timeout_ms: default_remote_timeout_ms(),
            max_replicas_per_rack: default_max_replicas_per_rack(),
            max_replicas_per_data_center: default_max_replicas_per_data_center(),
            enable_data_center_awareness: false,
            max_write_sessions_per_node: default_max_write_sessions_per_node(),
            load_factor_queue_weight: default_load_factor_queue_weight(),
            consistent_placement_token_count: default_consistent_placement_token_count(),
            enable_consistent_placement: true,
            replicator: ReplicatorConfig::default(),
        }
    }
}

impl MasterConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        let config: MasterConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_replicas_per_rack == 0 {
            return Err(MasterError::InvalidConfig(
                "max_replicas_per_rack must be positive".to_string(),
            ));
        }
        if self.max_replicas_per_data_center == 0 {
            return Err(MasterError::InvalidConfig(
                "max_replicas_per_data_center must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.replicator.safe_lost_chunk_fraction) {
            return Err(MasterError::InvalidConfig(format!(
                "safe_lost_chunk_fraction {} is outside [0, 1]",
                self.replicator.safe_lost_chunk_fraction
            )));
        }
        if self.peer_cells.iter().any(|peer| peer.cell_tag == self.cell_tag) {
            return Err(MasterError::InvalidConfig(format!(
                "cell {} lists itself as a peer",
                self.cell_tag
            )));
        }
        Ok(())
    }

    pub fn is_primary(&self) -> bool {
        self.primary_url.is_none()
    }
}

impl From<&MasterConfig> for PlacementConfig {
    fn from(config: &MasterConfig) -> Self {
        PlacementConfig {
            max_replicas_per_rack: config.max_replicas_per_rack,
            max_replicas_per_data_center: config.max_replicas_per_data_center,
            enable_data_center_awareness: config.enable_data_center_awareness,
            max_write_sessions_per_node: config.max_write_sessions_per_node,
            load_factor_queue_weight: config.load_factor_queue_weight,
            consistent_placement_token_count: config.consistent_placement_token_count,
            enable_consistent_placement: config.enable_consistent_placement,
        }
    }
}

impl From<&MasterConfig> for ReplicatorConfig {
    fn from(config: &MasterConfig) -> Self {
        config.replicator.clone()
    }
}

impl From<&MasterConfig> for api::Config {
    fn from(config: &MasterConfig) -> Self {
        api::Config {
            bind_address: config.bind_address,
        }
    }
}
