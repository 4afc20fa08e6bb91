use std::collections::{BTreeMap, BTreeSet};

use model::{
    Chunk, ChunkPartRef, DataCenterId, Medium, MediumIndex, Node, NodeDirectory, NodeId, RackIndex,
    ReplicaIndex,
};

use crate::{PlacementConfig, PlacementError, Result};

/// Parameters of a single write target allocation.
#[derive(Debug, Clone, Default)]
pub struct AllocationRequest {
    pub desired_count: usize,
    pub min_count: usize,
    pub replication_factor_override: Option<u8>,
    pub forbidden_nodes: BTreeSet<NodeId>,
    pub preferred_node: Option<NodeId>,
}

impl AllocationRequest {
    pub fn new(desired_count: usize, min_count: usize) -> Self {
        Self {
            desired_count,
            min_count,
            ..Self::default()
        }
    }

    pub fn forbid(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.forbidden_nodes.extend(nodes);
        self
    }

    pub fn prefer(mut self, node: Option<NodeId>) -> Self {
        self.preferred_node = node;
        self
    }
}

fn factor_key(factor: f64) -> u64 {
    (factor.max(0.0) * 1_000_000.0) as u64
}

#[derive(Debug, Clone, Copy, Default)]
struct NodeKeys {
    fill: Option<u64>,
    load: Option<u64>,
}

/// Per-medium ordering of eligible nodes by fill factor (balancing and
/// removal) and by load factor (write placement).
#[derive(Debug, Default)]
pub struct ChunkPlacement {
    config: PlacementConfig,
    fill_factor_index: BTreeMap<MediumIndex, BTreeSet<(u64, NodeId)>>,
    load_factor_index: BTreeMap<MediumIndex, BTreeSet<(u64, NodeId)>>,
    node_keys: BTreeMap<NodeId, BTreeMap<MediumIndex, NodeKeys>>,
}

impl ChunkPlacement {
    pub fn new(config: PlacementConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: PlacementConfig) {
        self.config = config;
    }

    fn is_valid_balancing_target(node: &Node, medium: &Medium) -> bool {
        node.is_online()
            && node.reported_heartbeat
            && !node.decommissioned
            && node.media.get(&medium.index).map(|m| m.total_space > 0).unwrap_or(false)
    }

    /// Whether new replicas on `medium` may be written to `node`.
    pub fn is_valid_write_target(&self, node: &Node, medium: &Medium) -> bool {
        Self::is_valid_balancing_target(node, medium)
            && !node.disable_write_sessions
            && node.has_space(medium.index)
    }

    fn has_free_session(&self, node: &Node, medium: MediumIndex) -> bool {
        node.media
            .get(&medium)
            .map(|m| m.session_count < self.config.max_write_sessions_per_node)
            .unwrap_or(false)
    }

    /// Re-keys the node in every per-medium index after a heartbeat or a
    /// state change.
    pub fn on_node_updated(&mut self, node: &Node, media: &[Medium]) {
        self.on_node_removed(node.id);

        let mut keys = BTreeMap::new();
        for medium in media {
            if !node.media.contains_key(&medium.index) {
                continue;
            }
            let mut entry = NodeKeys::default();
            if Self::is_valid_balancing_target(node, medium) {
                if let Some(fill) = node.fill_factor(medium.index) {
                    let key = factor_key(fill);
                    self.fill_factor_index.entry(medium.index).or_default().insert((key, node.id));
                    entry.fill = Some(key);
                }
            }
            if self.is_valid_write_target(node, medium) {
                if let Some(load) = node.load_factor(medium.index, self.config.load_factor_queue_weight) {
                    let key = factor_key(load);
                    self.load_factor_index.entry(medium.index).or_default().insert((key, node.id));
                    entry.load = Some(key);
                }
            }
            if entry.fill.is_some() || entry.load.is_some() {
                keys.insert(medium.index, entry);
            }
        }
        if !keys.is_empty() {
            self.node_keys.insert(node.id, keys);
        }
    }

    pub fn on_node_removed(&mut self, node: NodeId) {
        let Some(keys) = self.node_keys.remove(&node) else {
            return;
        };
        for (medium, entry) in keys {
            if let Some(fill) = entry.fill {
                if let Some(index) = self.fill_factor_index.get_mut(&medium) {
                    index.remove(&(fill, node));
                }
            }
            if let Some(load) = entry.load {
                if let Some(index) = self.load_factor_index.get_mut(&medium) {
                    index.remove(&(load, node));
                }
            }
        }
    }

    /// Nodes eligible for writes on the medium, least loaded first.
    pub fn write_candidates(&self, medium: MediumIndex) -> impl Iterator<Item = NodeId> + '_ {
        self.load_factor_index
            .get(&medium)
            .into_iter()
            .flat_map(|index| index.iter().map(|(_, node)| *node))
    }

    /// Per-rack replica cap for the chunk on a medium.
    pub fn max_replicas_per_rack(&self, chunk: &Chunk, replication_factor: u8, override_factor: Option<u8>) -> usize {
        let limit = if chunk.is_erasure() {
            chunk.erasure_codec.guaranteed_repairable_part_count()
        } else if chunk.is_journal() {
            let min_quorum = chunk.read_quorum.min(chunk.write_quorum) as usize;
            min_quorum.saturating_sub(1).max(1)
        } else if let Some(factor) = override_factor {
            factor as usize
        } else {
            (replication_factor as usize).saturating_sub(1).max(1)
        };
        limit.min(self.config.max_replicas_per_rack).max(1)
    }

    /// Per-data-center replica cap, or `None` when data center awareness
    /// is disabled.
    pub fn max_replicas_per_data_center(
        &self,
        nodes: &NodeDirectory,
        chunk: &Chunk,
        replication_factor: u8,
    ) -> Option<usize> {
        if !self.config.enable_data_center_awareness {
            return None;
        }
        let live_data_centers: BTreeSet<DataCenterId> = nodes
            .nodes()
            .filter(|node| node.is_online())
            .filter_map(|node| nodes.data_center_of(node.id))
            .collect();
        let data_center_count = live_data_centers.len().max(1);
        let total = if chunk.is_erasure() {
            chunk.erasure_codec.total_part_count()
        } else {
            replication_factor as usize
        };
        let limit = total.div_ceil(data_center_count).max(1);
        Some(limit.min(self.config.max_replicas_per_data_center))
    }

    /// Picks up to `desired_count` targets for new replicas of the chunk.
    /// An empty result means fewer than `min_count` eligible nodes were
    /// found; callers retry later.
    pub fn allocate_write_targets(
        &self,
        nodes: &NodeDirectory,
        medium: &Medium,
        chunk: &Chunk,
        replication_factor: u8,
        request: &AllocationRequest,
    ) -> Result<Vec<NodeId>> {
        if request.desired_count == 0 || request.min_count > request.desired_count {
            return Err(PlacementError::InvalidRequest(format!(
                "desired count {} and min count {} are inconsistent",
                request.desired_count, request.min_count
            )));
        }

        let max_per_rack = self.max_replicas_per_rack(chunk, replication_factor, request.replication_factor_override);
        let max_per_data_center = self.max_replicas_per_data_center(nodes, chunk, replication_factor);
        let mut collector = TargetCollector::new(nodes, chunk, medium.index, max_per_rack, max_per_data_center);
        collector.forbidden.extend(request.forbidden_nodes.iter().copied());

        if let Some(preferred) = request.preferred_node {
            if let Some(node) = nodes.node(preferred) {
                if self.is_valid_write_target(node, medium) && collector.accepts(preferred, true) {
                    collector.add(preferred);
                }
            }
        }

        for enforce_caps in [true, false] {
            for candidate in self.write_candidates(medium.index) {
                if collector.targets.len() >= request.desired_count {
                    break;
                }
                let Some(node) = nodes.node(candidate) else {
                    continue;
                };
                if !self.has_free_session(node, medium.index) {
                    continue;
                }
                if collector.accepts(candidate, enforce_caps) {
                    collector.add(candidate);
                }
            }
            if collector.targets.len() >= request.min_count {
                break;
            }
        }

        if collector.targets.len() < request.min_count {
            tracing::debug!(
                "Not enough write targets for chunk {} on medium {}: found {}, need {}",
                chunk.id,
                medium.index,
                collector.targets.len(),
                request.min_count
            );
            return Ok(Vec::new());
        }
        Ok(collector.targets)
    }

    /// Chooses which replica of a part to drop: a replica in an overflowing
    /// rack first, then the most filled node, ties going to the smallest id.
    pub fn get_removal_target(
        &self,
        nodes: &NodeDirectory,
        chunk: &Chunk,
        medium: MediumIndex,
        replica_index: ReplicaIndex,
        replication_factor: u8,
    ) -> Option<NodeId> {
        let candidates: Vec<NodeId> = chunk
            .replicas_on(medium)
            .filter(|replica| replica.replica_index == replica_index)
            .map(|replica| replica.node)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let max_per_rack = self.max_replicas_per_rack(chunk, replication_factor, None);
        let mut per_rack: BTreeMap<RackIndex, usize> = BTreeMap::new();
        for replica in chunk.replicas_on(medium) {
            if let Some(rack) = nodes.rack_of(replica.node) {
                *per_rack.entry(rack).or_insert(0) += 1;
            }
        }
        let overflowing: Vec<NodeId> = candidates
            .iter()
            .copied()
            .filter(|node| {
                nodes
                    .rack_of(*node)
                    .map(|rack| per_rack.get(&rack).copied().unwrap_or(0) > max_per_rack)
                    .unwrap_or(false)
            })
            .collect();
        let pool = if overflowing.is_empty() { candidates } else { overflowing };

        pool.into_iter().max_by(|a, b| {
            let fill = |id: &NodeId| {
                nodes
                    .node(*id)
                    .and_then(|node| node.fill_factor(medium))
                    .map(factor_key)
                    .unwrap_or(0)
            };
            fill(a).cmp(&fill(b)).then_with(|| b.cmp(a))
        })
    }

    /// Whether any node on the medium is filled below `max_fill_factor`.
    pub fn has_balancing_targets(&self, medium: MediumIndex, max_fill_factor: f64) -> bool {
        self.fill_factor_index
            .get(&medium)
            .and_then(|index| index.iter().next())
            .map(|(fill, _)| *fill < factor_key(max_fill_factor))
            .unwrap_or(false)
    }

    /// Least filled node that could take a replica of the chunk, if its
    /// fill factor is below `max_fill_factor`.
    pub fn allocate_balancing_target(
        &self,
        nodes: &NodeDirectory,
        medium: &Medium,
        chunk: &Chunk,
        replication_factor: u8,
        max_fill_factor: f64,
    ) -> Option<NodeId> {
        let max_key = factor_key(max_fill_factor);
        let max_per_rack = self.max_replicas_per_rack(chunk, replication_factor, None);
        let max_per_data_center = self.max_replicas_per_data_center(nodes, chunk, replication_factor);
        let collector = TargetCollector::new(nodes, chunk, medium.index, max_per_rack, max_per_data_center);

        let index = self.fill_factor_index.get(&medium.index)?;
        for (fill, candidate) in index {
            if *fill >= max_key {
                break;
            }
            let Some(node) = nodes.node(*candidate) else {
                continue;
            };
            if self.is_valid_write_target(node, medium) && collector.accepts(*candidate, true) {
                return Some(*candidate);
            }
        }
        None
    }

    /// Parts stored on `source` that could be moved off the medium.
    pub fn get_balancing_chunks(&self, source: &Node, medium: MediumIndex, max_count: usize) -> Vec<ChunkPartRef> {
        source.replicas_on(medium).take(max_count).copied().collect()
    }
}

/// Accumulates targets while tracking rack and data center occupancy of
/// the chunk's existing and newly chosen replicas.
struct TargetCollector<'a> {
    nodes: &'a NodeDirectory,
    max_per_rack: usize,
    max_per_data_center: Option<usize>,
    per_rack: BTreeMap<RackIndex, usize>,
    per_data_center: BTreeMap<DataCenterId, usize>,
    forbidden: BTreeSet<NodeId>,
    targets: Vec<NodeId>,
}

impl<'a> TargetCollector<'a> {
    fn new(
        nodes: &'a NodeDirectory,
        chunk: &Chunk,
        medium: MediumIndex,
        max_per_rack: usize,
        max_per_data_center: Option<usize>,
    ) -> Self {
        let mut collector = Self {
            nodes,
            max_per_rack,
            max_per_data_center,
            per_rack: BTreeMap::new(),
            per_data_center: BTreeMap::new(),
            forbidden: BTreeSet::new(),
            targets: Vec::new(),
        };
        for replica in &chunk.stored_replicas {
            collector.forbidden.insert(replica.node);
            if replica.medium == medium {
                collector.count(replica.node);
            }
        }
        collector
    }

    fn count(&mut self, node: NodeId) {
        if let Some(rack) = self.nodes.rack_of(node) {
            *self.per_rack.entry(rack).or_insert(0) += 1;
        }
        if let Some(data_center) = self.nodes.data_center_of(node) {
            *self.per_data_center.entry(data_center).or_insert(0) += 1;
        }
    }

    fn accepts(&self, node: NodeId, enforce_caps: bool) -> bool {
        if self.forbidden.contains(&node) || self.targets.contains(&node) {
            return false;
        }
        if !enforce_caps {
            return true;
        }
        if let Some(rack) = self.nodes.rack_of(node) {
            if self.per_rack.get(&rack).copied().unwrap_or(0) >= self.max_per_rack {
                return false;
            }
        }
        if let (Some(limit), Some(data_center)) = (self.max_per_data_center, self.nodes.data_center_of(node)) {
            if self.per_data_center.get(&data_center).copied().unwrap_or(0) >= limit {
                return false;
            }
        }
        true
    }

    fn add(&mut self, node: NodeId) {
        self.count(node);
        self.targets.push(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{
        CellTag, ChunkId, ChunkKind, ChunkReplica, ErasureCodec, MediumConfig, NodeMediumStatistics,
        NodeState,
    };

    fn medium() -> Medium {
        Medium::new(MediumIndex(0), "default", MediumConfig::default()).unwrap()
    }

    fn cluster(racks: &[&str], used: &[i64]) -> NodeDirectory {
        let mut nodes = NodeDirectory::new();
        for (i, rack) in racks.iter().enumerate() {
            let id = nodes.register_node(&format!("node-{}:9012", i));
            let rack = nodes.get_or_create_rack(rack, None);
            nodes.set_node_rack(id, Some(rack)).unwrap();
            let node = nodes.node_mut(id).unwrap();
            node.state = NodeState::Online;
            node.reported_heartbeat = true;
            node.media.insert(
                MediumIndex(0),
                NodeMediumStatistics {
                    total_space: 1000,
                    used_space: used[i],
                    session_count: 0,
                },
            );
        }
        nodes
    }

    fn placement_for(nodes: &NodeDirectory) -> ChunkPlacement {
        let mut placement = ChunkPlacement::new(PlacementConfig::default());
        for node in nodes.nodes() {
            placement.on_node_updated(node, &[medium()]);
        }
        placement
    }

    fn blob() -> Chunk {
        Chunk::new(ChunkId::new(), ChunkKind::Blob, ErasureCodec::None, CellTag(1))
    }

    #[test]
    fn test_allocation_prefers_least_loaded_nodes() {
        let nodes = cluster(&["a", "b", "c", "d"], &[900, 100, 500, 200]);
        let placement = placement_for(&nodes);
        let targets = placement
            .allocate_write_targets(&nodes, &medium(), &blob(), 3, &AllocationRequest::new(2, 2))
            .unwrap();
        assert_eq!(targets, vec![NodeId(2), NodeId(4)]);
    }

    #[test]
    fn test_allocation_honors_rack_cap() {
        // Rack cap for factor 3 is 2; rack "a" already holds two replicas.
        let nodes = cluster(&["a", "a", "a", "b"], &[100, 100, 100, 900]);
        let placement = placement_for(&nodes);
        let mut chunk = blob();
        chunk.add_replica(ChunkReplica::generic(NodeId(1), MediumIndex(0)), false);
        chunk.add_replica(ChunkReplica::generic(NodeId(2), MediumIndex(0)), false);
        let targets = placement
            .allocate_write_targets(&nodes, &medium(), &chunk, 3, &AllocationRequest::new(1, 1))
            .unwrap();
        assert_eq!(targets, vec![NodeId(4)]);
    }

    #[test]
    fn test_allocation_falls_back_without_caps_to_reach_minimum() {
        let nodes = cluster(&["a", "a", "a"], &[100, 200, 300]);
        let placement = placement_for(&nodes);
        let targets = placement
            .allocate_write_targets(&nodes, &medium(), &blob(), 3, &AllocationRequest::new(3, 3))
            .unwrap();
        assert_eq!(targets.len(), 3);
    }

    #[test]
    fn test_allocation_below_minimum_is_empty() {
        let nodes = cluster(&["a", "b"], &[100, 200]);
        let placement = placement_for(&nodes);
        let request = AllocationRequest::new(3, 3).forbid([NodeId(1)]);
        let targets = placement
            .allocate_write_targets(&nodes, &medium(), &blob(), 3, &request)
            .unwrap();
        assert!(targets.is_empty());
        assert!(placement
            .allocate_write_targets(&nodes, &medium(), &blob(), 3, &AllocationRequest::new(1, 2))
            .is_err());
    }

    #[test]
    fn test_preferred_node_goes_first() {
        let nodes = cluster(&["a", "b", "c"], &[100, 200, 800]);
        let placement = placement_for(&nodes);
        let request = AllocationRequest::new(2, 1).prefer(Some(NodeId(3)));
        let targets = placement
            .allocate_write_targets(&nodes, &medium(), &blob(), 3, &request)
            .unwrap();
        assert_eq!(targets, vec![NodeId(3), NodeId(1)]);
    }

    #[test]
    fn test_decommissioned_and_full_nodes_are_skipped() {
        let mut nodes = cluster(&["a", "b", "c"], &[100, 1000, 300]);
        nodes.node_mut(NodeId(1)).unwrap().decommissioned = true;
        let placement = placement_for(&nodes);
        let targets = placement
            .allocate_write_targets(&nodes, &medium(), &blob(), 3, &AllocationRequest::new(3, 1))
            .unwrap();
        assert_eq!(targets, vec![NodeId(3)]);
    }

    #[test]
    fn test_node_removed_from_indexes() {
        let nodes = cluster(&["a", "b"], &[100, 200]);
        let mut placement = placement_for(&nodes);
        placement.on_node_removed(NodeId(1));
        assert_eq!(placement.write_candidates(MediumIndex(0)).collect::<Vec<_>>(), vec![NodeId(2)]);
    }

    #[test]
    fn test_removal_target_prefers_overflowing_rack_then_fill() {
        let nodes = cluster(&["a", "a", "b", "c"], &[100, 200, 900, 800]);
        let mut chunk = blob();
        for id in 1..=4 {
            chunk.add_replica(ChunkReplica::generic(NodeId(id), MediumIndex(0)), false);
        }
        let placement = placement_for(&nodes);
        // Factor 2 allows one replica per rack; rack "a" overflows.
        let target = placement.get_removal_target(&nodes, &chunk, MediumIndex(0), ReplicaIndex::GENERIC, 2);
        assert_eq!(target, Some(NodeId(2)));
        // Factor 4 allows three per rack, so the fullest node is chosen.
        let target = placement.get_removal_target(&nodes, &chunk, MediumIndex(0), ReplicaIndex::GENERIC, 4);
        assert_eq!(target, Some(NodeId(3)));
    }

    #[test]
    fn test_removal_tie_breaks_on_smallest_node_id() {
        let nodes = cluster(&["a", "b", "c"], &[500, 500, 500]);
        let mut chunk = blob();
        for id in [3, 2] {
            chunk.add_replica(ChunkReplica::generic(NodeId(id), MediumIndex(0)), false);
        }
        let placement = placement_for(&nodes);
        let target = placement.get_removal_target(&nodes, &chunk, MediumIndex(0), ReplicaIndex::GENERIC, 3);
        assert_eq!(target, Some(NodeId(2)));
    }

    #[test]
    fn test_rack_limits_by_chunk_kind() {
        let placement = ChunkPlacement::new(PlacementConfig::default());
        assert_eq!(placement.max_replicas_per_rack(&blob(), 3, None), 2);
        assert_eq!(placement.max_replicas_per_rack(&blob(), 1, None), 1);
        assert_eq!(placement.max_replicas_per_rack(&blob(), 3, Some(3)), 3);

        let erasure = Chunk::new(ChunkId::new(), ChunkKind::Blob, ErasureCodec::ReedSolomon6_3, CellTag(1));
        assert_eq!(placement.max_replicas_per_rack(&erasure, 1, None), 3);

        let mut journal = Chunk::new(ChunkId::new(), ChunkKind::Journal, ErasureCodec::None, CellTag(1));
        journal.read_quorum = 2;
        journal.write_quorum = 2;
        assert_eq!(placement.max_replicas_per_rack(&journal, 3, None), 1);
    }

    #[test]
    fn test_data_center_cap() {
        let mut nodes = cluster(&["a", "b", "c", "d"], &[100, 110, 120, 900]);
        for (id, rack, dc) in [(1, "a", "dc1"), (2, "b", "dc1"), (3, "c", "dc1"), (4, "d", "dc2")] {
            let rack = nodes.get_or_create_rack(rack, Some(dc));
            nodes.set_node_rack(NodeId(id), Some(rack)).unwrap();
        }
        let mut config = PlacementConfig::default();
        config.enable_data_center_awareness = true;
        let mut placement = ChunkPlacement::new(config);
        for node in nodes.nodes() {
            placement.on_node_updated(node, &[medium()]);
        }
        assert_eq!(placement.max_replicas_per_data_center(&nodes, &blob(), 4), Some(2));
        let targets = placement
            .allocate_write_targets(&nodes, &medium(), &blob(), 4, &AllocationRequest::new(3, 3))
            .unwrap();
        assert_eq!(targets, vec![NodeId(1), NodeId(2), NodeId(4)]);
    }

    #[test]
    fn test_balancing_target_respects_fill_threshold() {
        let nodes = cluster(&["a", "b", "c"], &[900, 300, 100]);
        let placement = placement_for(&nodes);
        let mut chunk = blob();
        chunk.add_replica(ChunkReplica::generic(NodeId(1), MediumIndex(0)), false);
        assert!(placement.has_balancing_targets(MediumIndex(0), 0.5));
        assert!(!placement.has_balancing_targets(MediumIndex(0), 0.05));
        assert_eq!(
            placement.allocate_balancing_target(&nodes, &medium(), &chunk, 3, 0.5),
            Some(NodeId(3))
        );
        assert_eq!(placement.allocate_balancing_target(&nodes, &medium(), &chunk, 3, 0.05), None);
    }
}
