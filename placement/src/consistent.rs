use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use model::{ChunkId, Medium, MediumIndex, Node, NodeId};
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Why a node is currently excluded from consistent placement rings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct NodeInvalidityReasons: u8 {
        const DECOMMISSIONED          = 0b0001;
        const WRITE_SESSIONS_DISABLED = 0b0010;
        const NO_HEARTBEAT            = 0b0100;
    }
}

impl NodeInvalidityReasons {
    pub fn of(node: &Node) -> Self {
        let mut reasons = Self::empty();
        reasons.set(Self::DECOMMISSIONED, node.decommissioned);
        reasons.set(Self::WRITE_SESSIONS_DISABLED, node.disable_write_sessions);
        reasons.set(Self::NO_HEARTBEAT, !node.reported_heartbeat);
        reasons
    }
}

#[derive(Debug, Clone)]
struct RingMember {
    media: BTreeSet<MediumIndex>,
    token_count: u32,
    reasons: NodeInvalidityReasons,
}

#[derive(Debug, Clone, Copy)]
struct RegisteredChunk {
    position: u64,
    replica_count: usize,
}

type Ring = BTreeMap<u64, NodeId>;

/// Hash ring placement for chunks opted into consistent replica placement.
/// Targets depend only on ring membership and token counts, so topology
/// changes only move chunks whose ring neighborhood actually changed.
#[derive(Debug, Default)]
pub struct ConsistentReplicaPlacement {
    default_token_count: u32,
    members: BTreeMap<NodeId, RingMember>,
    rings: BTreeMap<MediumIndex, Ring>,
    chunks: BTreeMap<(ChunkId, MediumIndex), RegisteredChunk>,
    chunks_by_position: BTreeMap<MediumIndex, BTreeMap<u64, BTreeSet<ChunkId>>>,
    targets: BTreeMap<(ChunkId, MediumIndex), Vec<NodeId>>,
    chunks_by_node: BTreeMap<NodeId, BTreeSet<(ChunkId, MediumIndex)>>,
}

fn token_position(node: NodeId, medium: MediumIndex, token: u32) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&node.0.to_le_bytes());
    hasher.update(&[medium.0]);
    hasher.update(&token.to_le_bytes());
    first_u64(hasher.finalize())
}

fn chunk_position(hash: u64, medium: MediumIndex) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&hash.to_le_bytes());
    hasher.update(&[medium.0]);
    first_u64(hasher.finalize())
}

fn first_u64(hash: blake3::Hash) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Walks the ring clockwise from `position` collecting distinct nodes.
fn ring_targets(ring: &Ring, position: u64, count: usize) -> Vec<NodeId> {
    let mut targets = Vec::with_capacity(count);
    for (_, node) in ring.range(position..).chain(ring.range(..position)) {
        if targets.len() == count {
            break;
        }
        if !targets.contains(node) {
            targets.push(*node);
        }
    }
    targets
}

impl ConsistentReplicaPlacement {
    pub fn new(default_token_count: u32) -> Self {
        Self {
            default_token_count: default_token_count.max(1),
            ..Self::default()
        }
    }

    pub fn is_member(&self, node: NodeId) -> bool {
        self.members.contains_key(&node)
    }

    fn is_valid(&self, node: NodeId) -> bool {
        self.members
            .get(&node)
            .map(|member| member.reasons.is_empty())
            .unwrap_or(false)
    }

    /// Adds a node to the rings of the non-cache media it serves. Returns
    /// the chunks whose targets changed.
    pub fn add_node(&mut self, node: &Node, media: &[Medium]) -> Vec<ChunkId> {
        let node_media: BTreeSet<MediumIndex> = media
            .iter()
            .filter(|medium| !medium.cache && node.media.contains_key(&medium.index))
            .map(|medium| medium.index)
            .collect();
        let token_count = if node.consistent_placement_token_count > 0 {
            node.consistent_placement_token_count
        } else {
            self.default_token_count
        };

        let mut affected = self.remove_node(node.id);
        self.members.insert(
            node.id,
            RingMember {
                media: node_media,
                token_count,
                reasons: NodeInvalidityReasons::of(node),
            },
        );
        affected.extend(self.insert_tokens(node.id));
        finish(affected)
    }

    pub fn remove_node(&mut self, node: NodeId) -> Vec<ChunkId> {
        let mut affected = self.remove_tokens(node);
        self.members.remove(&node);
        self.chunks_by_node.remove(&node);
        affected.sort();
        affected.dedup();
        affected
    }

    pub fn update_node_token_count(&mut self, node: NodeId, token_count: u32) -> Vec<ChunkId> {
        let token_count = if token_count > 0 { token_count } else { self.default_token_count };
        match self.members.get(&node) {
            Some(member) if member.token_count != token_count => {}
            _ => return Vec::new(),
        }
        let mut affected = self.remove_tokens(node);
        if let Some(member) = self.members.get_mut(&node) {
            member.token_count = token_count;
        }
        affected.extend(self.insert_tokens(node));
        finish(affected)
    }

    /// Sets or clears one invalidity reason. The node leaves the rings when
    /// its first reason appears and rejoins once the last one clears.
    pub fn set_node_validity(&mut self, node: NodeId, reason: NodeInvalidityReasons, invalid: bool) -> Vec<ChunkId> {
        let Some(member) = self.members.get_mut(&node) else {
            return Vec::new();
        };
        let was_valid = member.reasons.is_empty();
        member.reasons.set(reason, invalid);
        let is_valid = member.reasons.is_empty();
        match (was_valid, is_valid) {
            (true, false) => finish(self.remove_tokens(node)),
            (false, true) => finish(self.insert_tokens(node)),
            _ => Vec::new(),
        }
    }

    pub fn register_chunk(&mut self, chunk: ChunkId, hash: u64, medium: MediumIndex, replica_count: usize) {
        self.unregister_chunk_medium(chunk, medium);
        let position = chunk_position(hash, medium);
        self.chunks.insert((chunk, medium), RegisteredChunk { position, replica_count });
        self.chunks_by_position
            .entry(medium)
            .or_default()
            .entry(position)
            .or_default()
            .insert(chunk);
        self.refresh_targets(chunk, medium);
    }

    pub fn unregister_chunk(&mut self, chunk: ChunkId) {
        let media: Vec<MediumIndex> = self
            .chunks
            .range((chunk, MediumIndex(0))..=(chunk, MediumIndex(u8::MAX)))
            .map(|((_, medium), _)| *medium)
            .collect();
        for medium in media {
            self.unregister_chunk_medium(chunk, medium);
        }
    }

    fn unregister_chunk_medium(&mut self, chunk: ChunkId, medium: MediumIndex) {
        let Some(registered) = self.chunks.remove(&(chunk, medium)) else {
            return;
        };
        if let Some(by_position) = self.chunks_by_position.get_mut(&medium) {
            if let Some(set) = by_position.get_mut(&registered.position) {
                set.remove(&chunk);
                if set.is_empty() {
                    by_position.remove(&registered.position);
                }
            }
        }
        self.set_cached_targets(chunk, medium, Vec::new());
    }

    /// Pure function of current ring membership.
    pub fn get_write_targets(&self, hash: u64, medium: MediumIndex, replica_count: usize) -> Vec<NodeId> {
        match self.rings.get(&medium) {
            Some(ring) => ring_targets(ring, chunk_position(hash, medium), replica_count),
            None => Vec::new(),
        }
    }

    /// Targets computed at the last topology change for a registered chunk.
    pub fn cached_targets(&self, chunk: ChunkId, medium: MediumIndex) -> Option<&[NodeId]> {
        self.targets.get(&(chunk, medium)).map(Vec::as_slice)
    }

    pub fn registered_chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn insert_tokens(&mut self, node: NodeId) -> Vec<ChunkId> {
        if !self.is_valid(node) {
            return Vec::new();
        }
        let Some(member) = self.members.get(&node) else {
            return Vec::new();
        };
        let media: Vec<MediumIndex> = member.media.iter().copied().collect();
        let token_count = member.token_count;

        let mut candidates = BTreeSet::new();
        for medium in media {
            let positions: Vec<u64> = (0..token_count).map(|i| token_position(node, medium, i)).collect();
            for position in &positions {
                candidates.extend(self.chunks_preceding(medium, *position, node));
            }
            let ring = self.rings.entry(medium).or_default();
            for position in positions {
                ring.insert(position, node);
            }
        }
        self.refresh_candidates(candidates)
    }

    fn remove_tokens(&mut self, node: NodeId) -> Vec<ChunkId> {
        let Some(member) = self.members.get(&node) else {
            return Vec::new();
        };
        let media: Vec<MediumIndex> = member.media.iter().copied().collect();
        for medium in media {
            if let Some(ring) = self.rings.get_mut(&medium) {
                ring.retain(|_, owner| *owner != node);
            }
        }
        let candidates = self.chunks_by_node.get(&node).cloned().unwrap_or_default();
        self.refresh_candidates(candidates)
    }

    /// Chunks whose clockwise walk could reach `position` before collecting
    /// a full target set from other nodes.
    fn chunks_preceding(&self, medium: MediumIndex, position: u64, node: NodeId) -> Vec<(ChunkId, MediumIndex)> {
        let Some(by_position) = self.chunks_by_position.get(&medium) else {
            return Vec::new();
        };
        let max_count = by_position
            .values()
            .flatten()
            .filter_map(|chunk| self.chunks.get(&(*chunk, medium)))
            .map(|registered| registered.replica_count)
            .max()
            .unwrap_or(0);
        let ring = self.rings.get(&medium);

        let mut seen = BTreeSet::new();
        let mut boundary = None;
        if let Some(ring) = ring {
            let counterclockwise = ring
                .range(..position)
                .rev()
                .chain(ring.range((Bound::Excluded(position), Bound::Unbounded)).rev());
            for (token, owner) in counterclockwise {
                if *owner == node {
                    continue;
                }
                seen.insert(*owner);
                if seen.len() >= max_count {
                    boundary = Some(*token);
                    break;
                }
            }
        }

        match boundary {
            None => chunks_in(by_position.iter(), medium),
            Some(boundary) if boundary < position => chunks_in(
                by_position.range((Bound::Excluded(boundary), Bound::Included(position))),
                medium,
            ),
            Some(boundary) => {
                let mut result =
                    chunks_in(by_position.range((Bound::Excluded(boundary), Bound::Unbounded)), medium);
                result.extend(chunks_in(by_position.range(..=position), medium));
                result
            }
        }
    }

    fn refresh_candidates(&mut self, candidates: impl IntoIterator<Item = (ChunkId, MediumIndex)>) -> Vec<ChunkId> {
        candidates
            .into_iter()
            .filter(|(chunk, medium)| self.refresh_targets(*chunk, *medium))
            .map(|(chunk, _)| chunk)
            .collect()
    }

    /// Recomputes and caches the chunk's targets; returns true if they changed.
    fn refresh_targets(&mut self, chunk: ChunkId, medium: MediumIndex) -> bool {
        let Some(registered) = self.chunks.get(&(chunk, medium)).copied() else {
            return false;
        };
        let targets = match self.rings.get(&medium) {
            Some(ring) => ring_targets(ring, registered.position, registered.replica_count),
            None => Vec::new(),
        };
        self.set_cached_targets(chunk, medium, targets)
    }

    fn set_cached_targets(&mut self, chunk: ChunkId, medium: MediumIndex, targets: Vec<NodeId>) -> bool {
        let key = (chunk, medium);
        let old = self.targets.remove(&key).unwrap_or_default();
        if old == targets {
            if !old.is_empty() {
                self.targets.insert(key, old);
            }
            return false;
        }
        for node in &old {
            if let Some(set) = self.chunks_by_node.get_mut(node) {
                set.remove(&key);
            }
        }
        for node in &targets {
            self.chunks_by_node.entry(*node).or_default().insert(key);
        }
        if !targets.is_empty() {
            self.targets.insert(key, targets);
        }
        true
    }
}

fn chunks_in<'a>(
    positions: impl Iterator<Item = (&'a u64, &'a BTreeSet<ChunkId>)>,
    medium: MediumIndex,
) -> Vec<(ChunkId, MediumIndex)> {
    positions
        .flat_map(|(_, chunks)| chunks.iter().map(move |chunk| (*chunk, medium)))
        .collect()
}

fn finish(mut affected: Vec<ChunkId>) -> Vec<ChunkId> {
    affected.sort();
    affected.dedup();
    affected
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{MediumConfig, NodeMediumStatistics, NodeState};
    use proptest::prelude::*;

    fn media() -> Vec<Medium> {
        vec![Medium::new(MediumIndex(0), "default", MediumConfig::default()).unwrap()]
    }

    fn node(id: u32) -> Node {
        let mut node = Node::new(NodeId(id), format!("node-{}:9012", id));
        node.state = NodeState::Online;
        node.reported_heartbeat = true;
        node.media.insert(
            MediumIndex(0),
            NodeMediumStatistics {
                total_space: 1000,
                used_space: 0,
                session_count: 0,
            },
        );
        node
    }

    fn placement_with(node_count: u32) -> ConsistentReplicaPlacement {
        let mut placement = ConsistentReplicaPlacement::new(8);
        for id in 1..=node_count {
            placement.add_node(&node(id), &media());
        }
        placement
    }

    #[test]
    fn test_targets_are_distinct_and_deterministic() {
        let placement = placement_with(5);
        let targets = placement.get_write_targets(42, MediumIndex(0), 3);
        assert_eq!(targets.len(), 3);
        let unique: BTreeSet<_> = targets.iter().collect();
        assert_eq!(unique.len(), 3);

        let same = placement_with(5).get_write_targets(42, MediumIndex(0), 3);
        assert_eq!(targets, same);
    }

    #[test]
    fn test_small_ring_returns_every_node() {
        let placement = placement_with(2);
        assert_eq!(placement.get_write_targets(7, MediumIndex(0), 3).len(), 2);
        assert!(placement.get_write_targets(7, MediumIndex(1), 3).is_empty());
    }

    #[test]
    fn test_invalid_node_leaves_ring() {
        let mut placement = placement_with(3);
        let chunk = ChunkId::new();
        placement.register_chunk(chunk, 99, MediumIndex(0), 3);
        assert_eq!(placement.cached_targets(chunk, MediumIndex(0)).unwrap().len(), 3);

        let affected = placement.set_node_validity(NodeId(2), NodeInvalidityReasons::DECOMMISSIONED, true);
        assert_eq!(affected, vec![chunk]);
        assert!(!placement.get_write_targets(99, MediumIndex(0), 3).contains(&NodeId(2)));

        // A second reason keeps the node out; clearing one of two is a no-op.
        placement.set_node_validity(NodeId(2), NodeInvalidityReasons::NO_HEARTBEAT, true);
        let affected = placement.set_node_validity(NodeId(2), NodeInvalidityReasons::DECOMMISSIONED, false);
        assert!(affected.is_empty());
        let affected = placement.set_node_validity(NodeId(2), NodeInvalidityReasons::NO_HEARTBEAT, false);
        assert_eq!(affected, vec![chunk]);
        assert!(placement.get_write_targets(99, MediumIndex(0), 3).contains(&NodeId(2)));
    }

    #[test]
    fn test_unregister_forgets_chunk() {
        let mut placement = placement_with(3);
        let chunk = ChunkId::new();
        placement.register_chunk(chunk, 5, MediumIndex(0), 2);
        placement.unregister_chunk(chunk);
        assert_eq!(placement.registered_chunk_count(), 0);
        assert!(placement.cached_targets(chunk, MediumIndex(0)).is_none());
        assert!(placement.remove_node(NodeId(1)).is_empty());
    }

    proptest! {
        #[test]
        fn prop_add_reports_exactly_changed_chunks(hashes in proptest::collection::vec(any::<u64>(), 1..40), new_node in 6u32..12) {
            let mut placement = placement_with(5);
            let chunks: Vec<(ChunkId, u64)> = hashes.iter().map(|hash| (ChunkId::new(), *hash)).collect();
            for (chunk, hash) in &chunks {
                placement.register_chunk(*chunk, *hash, MediumIndex(0), 3);
            }
            let before: BTreeMap<ChunkId, Vec<NodeId>> = chunks
                .iter()
                .map(|(chunk, hash)| (*chunk, placement.get_write_targets(*hash, MediumIndex(0), 3)))
                .collect();

            let affected: BTreeSet<ChunkId> = placement.add_node(&node(new_node), &media()).into_iter().collect();
            for (chunk, hash) in &chunks {
                let after = placement.get_write_targets(*hash, MediumIndex(0), 3);
                prop_assert_eq!(affected.contains(chunk), before[chunk] != after);
                prop_assert_eq!(placement.cached_targets(*chunk, MediumIndex(0)).map(|t| t.to_vec()), Some(after));
            }
        }

        #[test]
        fn prop_remove_then_add_restores_targets(hashes in proptest::collection::vec(any::<u64>(), 1..40), victim in 1u32..=5) {
            let mut placement = placement_with(5);
            let before: Vec<Vec<NodeId>> = hashes
                .iter()
                .map(|hash| placement.get_write_targets(*hash, MediumIndex(0), 3))
                .collect();
            placement.remove_node(NodeId(victim));
            placement.add_node(&node(victim), &media());
            let after: Vec<Vec<NodeId>> = hashes
                .iter()
                .map(|hash| placement.get_write_targets(*hash, MediumIndex(0), 3))
                .collect();
            prop_assert_eq!(before, after);
        }
    }
}
