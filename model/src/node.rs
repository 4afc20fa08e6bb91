use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Add, AddAssign, Sub, SubAssign};

use crate::{
    ChunkId, ChunkPartLocation, ChunkPartRef, ChunkReplica, DataCenterId, JobId, MediumIndex,
    MediumSet, ModelError, NodeId, RackIndex, Result, REPLICATION_PRIORITY_COUNT,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    Registered,
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeMediumStatistics {
    pub total_space: i64,
    pub used_space: i64,
    pub session_count: u32,
}

/// Job slots and byte budgets of a node.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeResources {
    pub replication_slots: i32,
    pub replication_data_size: i64,
    pub repair_slots: i32,
    pub repair_data_size: i64,
    pub removal_slots: i32,
    pub seal_slots: i32,
}

impl AddAssign for NodeResources {
    fn add_assign(&mut self, rhs: Self) {
        self.replication_slots += rhs.replication_slots;
        self.replication_data_size += rhs.replication_data_size;
        self.repair_slots += rhs.repair_slots;
        self.repair_data_size += rhs.repair_data_size;
        self.removal_slots += rhs.removal_slots;
        self.seal_slots += rhs.seal_slots;
    }
}

impl SubAssign for NodeResources {
    fn sub_assign(&mut self, rhs: Self) {
        self.replication_slots -= rhs.replication_slots;
        self.replication_data_size -= rhs.replication_data_size;
        self.repair_slots -= rhs.repair_slots;
        self.repair_data_size -= rhs.repair_data_size;
        self.removal_slots -= rhs.removal_slots;
        self.seal_slots -= rhs.seal_slots;
    }
}

impl Add for NodeResources {
    type Output = NodeResources;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl Sub for NodeResources {
    type Output = NodeResources;

    fn sub(mut self, rhs: Self) -> Self::Output {
        self -= rhs;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rack {
    pub index: RackIndex,
    pub name: String,
    pub data_center: Option<DataCenterId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataCenter {
    pub id: DataCenterId,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub address: String,
    pub rack: Option<RackIndex>,
    pub state: NodeState,
    pub decommissioned: bool,
    pub disable_write_sessions: bool,
    pub reported_heartbeat: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub media: BTreeMap<MediumIndex, NodeMediumStatistics>,
    pub resource_limits: NodeResources,
    pub resource_usage: NodeResources,
    pub consistent_placement_token_count: u32,
    replicas: BTreeMap<MediumIndex, BTreeSet<ChunkPartRef>>,
    cached_replicas: BTreeMap<MediumIndex, BTreeSet<ChunkPartRef>>,
    /// Replicas to drop, keyed by part, with the media to drop them from.
    pub removal_queue: BTreeMap<ChunkPartRef, MediumSet>,
    /// Source parts on this node, with the media they should be copied to.
    pub replication_queues: Vec<BTreeMap<ChunkPartLocation, MediumSet>>,
    pub seal_queue: BTreeSet<ChunkPartLocation>,
    pub jobs: BTreeSet<JobId>,
    pub pending_endorsements: BTreeSet<ChunkId>,
}

impl Node {
    pub fn new(id: NodeId, address: String) -> Self {
        Self {
            id,
            address,
            rack: None,
            state: NodeState::Registered,
            decommissioned: false,
            disable_write_sessions: false,
            reported_heartbeat: false,
            last_heartbeat: None,
            media: BTreeMap::new(),
            resource_limits: NodeResources::default(),
            resource_usage: NodeResources::default(),
            consistent_placement_token_count: 0,
            replicas: BTreeMap::new(),
            cached_replicas: BTreeMap::new(),
            removal_queue: BTreeMap::new(),
            replication_queues: vec![BTreeMap::new(); REPLICATION_PRIORITY_COUNT],
            seal_queue: BTreeSet::new(),
            jobs: BTreeSet::new(),
            pending_endorsements: BTreeSet::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == NodeState::Online
    }

    pub fn fill_factor(&self, medium: MediumIndex) -> Option<f64> {
        let stats = self.media.get(&medium)?;
        if stats.total_space <= 0 {
            return None;
        }
        Some(stats.used_space as f64 / stats.total_space as f64)
    }

    /// Fill factor inflated by the number of open write sessions and
    /// queued replication work.
    pub fn load_factor(&self, medium: MediumIndex, queue_weight: f64) -> Option<f64> {
        let fill = self.fill_factor(medium)?;
        let sessions = self.media.get(&medium).map(|m| m.session_count).unwrap_or(0) as usize;
        let depth = sessions + self.replication_queue_depth();
        Some(fill + depth as f64 * queue_weight)
    }

    pub fn has_space(&self, medium: MediumIndex) -> bool {
        self.media
            .get(&medium)
            .map(|m| m.used_space < m.total_space)
            .unwrap_or(false)
    }

    pub fn add_replica(&mut self, replica: &ChunkReplica, chunk: ChunkId, cached: bool) -> bool {
        let replicas = if cached {
            &mut self.cached_replicas
        } else {
            &mut self.replicas
        };
        replicas
            .entry(replica.medium)
            .or_default()
            .insert(ChunkPartRef::new(chunk, replica.replica_index))
    }

    pub fn remove_replica(&mut self, location: ChunkPartLocation, cached: bool) -> bool {
        let replicas = if cached {
            &mut self.cached_replicas
        } else {
            &mut self.replicas
        };
        let removed = replicas
            .get_mut(&location.medium)
            .map(|set| set.remove(&location.part()))
            .unwrap_or(false);
        if removed && !cached {
            self.remove_from_removal_queue(location.part(), location.medium);
        }
        removed
    }

    pub fn has_replica(&self, location: ChunkPartLocation) -> bool {
        self.replicas
            .get(&location.medium)
            .map(|set| set.contains(&location.part()))
            .unwrap_or(false)
    }

    pub fn replicas(&self) -> impl Iterator<Item = ChunkPartLocation> + '_ {
        self.replicas
            .iter()
            .flat_map(|(medium, parts)| parts.iter().map(move |part| part.on_medium(*medium)))
    }

    pub fn replicas_on(&self, medium: MediumIndex) -> impl Iterator<Item = &ChunkPartRef> {
        self.replicas.get(&medium).into_iter().flatten()
    }

    pub fn cached_replicas(&self) -> impl Iterator<Item = ChunkPartLocation> + '_ {
        self.cached_replicas
            .iter()
            .flat_map(|(medium, parts)| parts.iter().map(move |part| part.on_medium(*medium)))
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.values().map(|set| set.len()).sum()
    }

    pub fn clear_replicas(&mut self) {
        self.replicas.clear();
        self.cached_replicas.clear();
    }

    pub fn add_to_removal_queue(&mut self, part: ChunkPartRef, medium: MediumIndex) {
        self.removal_queue.entry(part).or_default().insert(medium);
    }

    pub fn remove_from_removal_queue(&mut self, part: ChunkPartRef, medium: MediumIndex) {
        if let Some(media) = self.removal_queue.get_mut(&part) {
            media.remove(medium);
            if media.is_empty() {
                self.removal_queue.remove(&part);
            }
        }
    }

    pub fn add_to_replication_queue(&mut self, priority: usize, source: ChunkPartLocation, target_media: MediumSet) {
        let priority = priority.min(REPLICATION_PRIORITY_COUNT - 1);
        let entry = self.replication_queues[priority].entry(source).or_default();
        *entry = entry.union(target_media);
    }

    pub fn add_to_seal_queue(&mut self, location: ChunkPartLocation) {
        self.seal_queue.insert(location);
    }

    /// Drops every queue entry that refers to the chunk.
    pub fn remove_chunk_from_queues(&mut self, chunk: ChunkId) {
        self.removal_queue.retain(|part, _| part.chunk != chunk);
        for queue in &mut self.replication_queues {
            queue.retain(|location, _| location.chunk != chunk);
        }
        self.seal_queue.retain(|location| location.chunk != chunk);
        self.pending_endorsements.remove(&chunk);
    }

    pub fn clear_queues(&mut self) {
        self.removal_queue.clear();
        for queue in &mut self.replication_queues {
            queue.clear();
        }
        self.seal_queue.clear();
    }

    pub fn replication_queue_depth(&self) -> usize {
        self.replication_queues.iter().map(|queue| queue.len()).sum()
    }
}

/// Registry of storage nodes and their rack/data center topology.
#[derive(Debug, Clone, Default)]
pub struct NodeDirectory {
    nodes: BTreeMap<NodeId, Node>,
    node_by_address: BTreeMap<String, NodeId>,
    racks: Vec<Rack>,
    data_centers: Vec<DataCenter>,
    next_node_id: u32,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self {
            next_node_id: 1,
            ..Self::default()
        }
    }

    /// Registers a node by address, reusing the id of a previously known one.
    pub fn register_node(&mut self, address: &str) -> NodeId {
        if let Some(id) = self.node_by_address.get(address) {
            return *id;
        }
        let id = NodeId(self.next_node_id.max(1));
        self.next_node_id = id.0 + 1;
        self.nodes.insert(id, Node::new(id, address.to_string()));
        self.node_by_address.insert(address.to_string(), id);
        tracing::info!("Node registered: {} ({})", id, address);
        id
    }

    /// Removes a node entirely; callers unwind its replicas first.
    pub fn remove_node(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        self.node_by_address.remove(&node.address);
        Some(node)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn get(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(&id).ok_or(ModelError::NoSuchNode(id))
    }

    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(&id).ok_or(ModelError::NoSuchNode(id))
    }

    pub fn find_by_address(&self, address: &str) -> Option<&Node> {
        self.node_by_address.get(address).and_then(|id| self.nodes.get(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn online_node_count(&self) -> usize {
        self.nodes.values().filter(|node| node.is_online()).count()
    }

    pub fn get_or_create_data_center(&mut self, name: &str) -> DataCenterId {
        if let Some(dc) = self.data_centers.iter().find(|dc| dc.name == name) {
            return dc.id;
        }
        let id = DataCenterId(self.data_centers.len() as u16);
        self.data_centers.push(DataCenter {
            id,
            name: name.to_string(),
        });
        id
    }

    pub fn get_or_create_rack(&mut self, name: &str, data_center: Option<&str>) -> RackIndex {
        let data_center = data_center.map(|dc| self.get_or_create_data_center(dc));
        if let Some(rack) = self.racks.iter_mut().find(|rack| rack.name == name) {
            if data_center.is_some() {
                rack.data_center = data_center;
            }
            return rack.index;
        }
        let index = RackIndex(self.racks.len() as u16);
        self.racks.push(Rack {
            index,
            name: name.to_string(),
            data_center,
        });
        index
    }

    pub fn set_node_rack(&mut self, id: NodeId, rack: Option<RackIndex>) -> Result<()> {
        self.get_mut(id)?.rack = rack;
        Ok(())
    }

    pub fn rack(&self, index: RackIndex) -> Option<&Rack> {
        self.racks.get(index.0 as usize)
    }

    pub fn data_center(&self, id: DataCenterId) -> Option<&DataCenter> {
        self.data_centers.get(id.0 as usize)
    }

    pub fn rack_of(&self, id: NodeId) -> Option<RackIndex> {
        self.nodes.get(&id).and_then(|node| node.rack)
    }

    pub fn data_center_of(&self, id: NodeId) -> Option<DataCenterId> {
        self.rack_of(id)
            .and_then(|rack| self.rack(rack))
            .and_then(|rack| rack.data_center)
    }

    pub fn data_centers(&self) -> &[DataCenter] {
        &self.data_centers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ReplicaIndex, ReplicaState};

    #[test]
    fn test_register_node_reuses_id_for_known_address() {
        let mut directory = NodeDirectory::new();
        let a = directory.register_node("n1:9012");
        let b = directory.register_node("n2:9012");
        assert_ne!(a, b);
        assert_eq!(directory.register_node("n1:9012"), a);
    }

    #[test]
    fn test_rack_topology() {
        let mut directory = NodeDirectory::new();
        let node = directory.register_node("n1:9012");
        let rack = directory.get_or_create_rack("r1", Some("dc-east"));
        directory.set_node_rack(node, Some(rack)).unwrap();
        assert_eq!(directory.rack_of(node), Some(rack));
        let dc = directory.data_center_of(node).unwrap();
        assert_eq!(directory.data_center(dc).unwrap().name, "dc-east");
        assert_eq!(directory.get_or_create_rack("r1", None), rack);
    }

    #[test]
    fn test_fill_and_load_factor() {
        let mut node = Node::new(NodeId(1), "n1".to_string());
        node.media.insert(
            MediumIndex(0),
            NodeMediumStatistics {
                total_space: 100,
                used_space: 25,
                session_count: 2,
            },
        );
        assert_eq!(node.fill_factor(MediumIndex(0)), Some(0.25));
        let load = node.load_factor(MediumIndex(0), 0.1).unwrap();
        assert!((load - 0.45).abs() < 1e-9);
        assert_eq!(node.fill_factor(MediumIndex(1)), None);
    }

    #[test]
    fn test_queues_drop_destroyed_chunk() {
        let mut node = Node::new(NodeId(1), "n1".to_string());
        let chunk = ChunkId::new();
        let part = ChunkPartRef::new(chunk, ReplicaIndex::GENERIC);
        node.add_to_removal_queue(part, MediumIndex(0));
        node.add_to_replication_queue(7, part.on_medium(MediumIndex(0)), MediumSet::single(MediumIndex(1)));
        node.add_to_seal_queue(part.on_medium(MediumIndex(0)));
        assert_eq!(node.replication_queues[REPLICATION_PRIORITY_COUNT - 1].len(), 1);
        node.remove_chunk_from_queues(chunk);
        assert!(node.removal_queue.is_empty());
        assert_eq!(node.replication_queue_depth(), 0);
        assert!(node.seal_queue.is_empty());
    }

    #[test]
    fn test_removing_replica_clears_removal_entry() {
        let mut node = Node::new(NodeId(1), "n1".to_string());
        let chunk = ChunkId::new();
        let replica = ChunkReplica::new(NodeId(1), ReplicaIndex::GENERIC, MediumIndex(0), ReplicaState::Generic);
        assert!(node.add_replica(&replica, chunk, false));
        let location = ChunkPartRef::new(chunk, ReplicaIndex::GENERIC).on_medium(MediumIndex(0));
        node.add_to_removal_queue(location.part(), MediumIndex(0));
        assert!(node.remove_replica(location, false));
        assert!(node.removal_queue.is_empty());
        assert_eq!(node.replica_count(), 0);
    }
}
