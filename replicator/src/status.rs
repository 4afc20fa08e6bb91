use std::collections::{BTreeMap, BTreeSet};

use model::{
    Chunk, ChunkReplica, ChunkStore, Medium, MediumIndex, NodeId, PartIndexSet, RackIndex,
    ReplicaIndex, Replication, ReplicationPolicy, REPLICA_INDEX_BOUND,
};
use serde::{Deserialize, Serialize};

use crate::{Cluster, ReplicatorConfig};

bitflags::bitflags! {
    /// Health of a chunk on one medium.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct ChunkStatus: u16 {
        const OVERREPLICATED        = 1 << 0;
        const UNDERREPLICATED       = 1 << 1;
        const LOST                  = 1 << 2;
        const DATA_MISSING          = 1 << 3;
        const PARITY_MISSING        = 1 << 4;
        const SEALED_MISSING        = 1 << 5;
        const UNSAFELY_PLACED       = 1 << 6;
        const DATA_DECOMMISSIONED   = 1 << 7;
        const PARITY_DECOMMISSIONED = 1 << 8;
        const INCONSISTENTLY_PLACED = 1 << 9;
    }
}

bitflags::bitflags! {
    /// Health of a chunk across all media that carry it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct CrossMediumChunkStatus: u16 {
        const LOST             = 1 << 0;
        const MEDIUM_WISE_LOST = 1 << 1;
        const DEFICIENT        = 1 << 2;
        const DATA_MISSING     = 1 << 3;
        const PARITY_MISSING   = 1 << 4;
        const PRECARIOUS       = 1 << 5;
        const QUORUM_MISSING   = 1 << 6;
        const SEALED           = 1 << 7;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediumStatistics {
    pub status: ChunkStatus,
    /// Live replicas per replica index.
    pub replica_count: [u8; REPLICA_INDEX_BOUND],
    pub decommissioned_replica_count: [u8; REPLICA_INDEX_BOUND],
    /// Exact replicas to drop.
    pub decommissioned_removal_replicas: Vec<ChunkReplica>,
    /// Indexes with one surplus replica; placement picks which one goes.
    pub balancing_removal_indexes: Vec<ReplicaIndex>,
    pub replication_indexes: Vec<ReplicaIndex>,
    /// Erasure parts with no copy at all on this medium.
    pub erased_parts: PartIndexSet,
}

impl MediumStatistics {
    fn add_replication_index(&mut self, index: ReplicaIndex) {
        if !self.replication_indexes.contains(&index) {
            self.replication_indexes.push(index);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkStatistics {
    pub status: CrossMediumChunkStatus,
    pub per_medium: BTreeMap<MediumIndex, MediumStatistics>,
}

/// The chunk's requested replication with per-medium caps applied. Media
/// that hold replicas but are not requested get an explicit zero factor so
/// their replicas are removed.
pub fn aggregated_replication(store: &ChunkStore, chunk: &Chunk) -> Replication {
    let requested = store.chunk_requisition(chunk).to_replication();
    let mut replication = Replication::new(requested.is_vital());
    for (index, policy) in requested.iter() {
        let Some(medium) = store.medium(index) else {
            tracing::error!("Invariant violation: chunk {} requests unknown medium {}", chunk.id, index);
            continue;
        };
        let factor = policy.replication_factor.min(medium.max_replication_factor);
        replication.set(index, ReplicationPolicy::new(factor, policy.data_parts_only));
    }
    for replica in &chunk.stored_replicas {
        if !replication.contains(replica.medium) {
            replication.set_zero(replica.medium);
        }
    }
    replication
}

/// Number of physical replicas a policy asks for.
fn physical_replica_count(chunk: &Chunk, policy: ReplicationPolicy) -> usize {
    if chunk.is_erasure() {
        if policy.data_parts_only {
            chunk.erasure_codec.data_part_count()
        } else {
            chunk.erasure_codec.total_part_count()
        }
    } else {
        policy.replication_factor as usize
    }
}

/// Designated nodes per medium for a chunk placed by consistent hashing.
fn consistent_placement_nodes(
    cluster: &Cluster,
    chunk: &Chunk,
    replication: &Replication,
) -> BTreeMap<MediumIndex, Vec<NodeId>> {
    let mut result = BTreeMap::new();
    let Some(hash) = chunk.consistent_placement_hash else {
        return result;
    };
    if !cluster.placement.config().enable_consistent_placement {
        return result;
    }
    for (index, policy) in replication.iter() {
        if policy.replication_factor == 0 {
            continue;
        }
        match cluster.store.medium(index) {
            Some(medium) if !medium.cache => {}
            _ => continue,
        }
        let count = physical_replica_count(chunk, policy);
        let targets = cluster.consistent_placement.get_write_targets(hash, index, count);
        if !targets.is_empty() {
            result.insert(index, targets);
        }
    }
    result
}

fn is_decommissioned(cluster: &Cluster, node: NodeId) -> bool {
    cluster.nodes.node(node).map(|node| node.decommissioned).unwrap_or(true)
}

pub fn compute_chunk_statistics(cluster: &Cluster, config: &ReplicatorConfig, chunk: &Chunk) -> ChunkStatistics {
    let replication = aggregated_replication(&cluster.store, chunk);
    let consistent_nodes = consistent_placement_nodes(cluster, chunk, &replication);
    let mut statistics = if chunk.is_erasure() {
        compute_erasure_statistics(cluster, config, chunk, &replication, &consistent_nodes)
    } else {
        compute_regular_statistics(cluster, chunk, &replication, &consistent_nodes)
    };
    if chunk.is_journal() && chunk.is_sealed() {
        statistics.status |= CrossMediumChunkStatus::SEALED;
    }
    statistics
}

fn compute_regular_statistics(
    cluster: &Cluster,
    chunk: &Chunk,
    replication: &Replication,
    consistent_nodes: &BTreeMap<MediumIndex, Vec<NodeId>>,
) -> ChunkStatistics {
    let mut result = ChunkStatistics::default();
    let has_sealed_replica = chunk.has_sealed_replica();
    let mut total_replica_count = 0usize;

    for (index, policy) in replication.iter() {
        let Some(medium) = cluster.store.medium(index) else {
            continue;
        };
        if medium.cache {
            continue;
        }
        let statistics = compute_regular_medium_statistics(
            cluster,
            chunk,
            medium,
            policy.replication_factor,
            has_sealed_replica,
            consistent_nodes.get(&index).map(Vec::as_slice),
        );
        total_replica_count +=
            statistics.replica_count[0] as usize + statistics.decommissioned_replica_count[0] as usize;
        result.per_medium.insert(index, statistics);
    }

    let mut present_on_some_medium = false;
    let mut all_present_media_transient = true;
    let mut all_media_transient = true;
    let mut deficient = false;
    let mut lost_media = Vec::new();
    for (index, statistics) in &result.per_medium {
        let transient = cluster.store.medium(*index).map(|m| m.transient).unwrap_or(false);
        if !transient {
            all_media_transient = false;
        }
        if statistics.status.contains(ChunkStatus::LOST) {
            lost_media.push(*index);
        } else {
            present_on_some_medium = true;
            if !transient {
                all_present_media_transient = false;
            }
        }
        if statistics
            .status
            .intersects(ChunkStatus::UNDERREPLICATED | ChunkStatus::SEALED_MISSING)
        {
            deficient = true;
        }
    }

    if chunk.is_journal() && total_replica_count < chunk.read_quorum as usize && !has_sealed_replica {
        result.status |= CrossMediumChunkStatus::QUORUM_MISSING;
    }

    if !present_on_some_medium {
        result.status |= CrossMediumChunkStatus::LOST;
    } else if replication.is_vital() && all_present_media_transient && !all_media_transient {
        result.status |= CrossMediumChunkStatus::PRECARIOUS;
    }

    if present_on_some_medium && !lost_media.is_empty() {
        result.status |= CrossMediumChunkStatus::MEDIUM_WISE_LOST;
        for index in lost_media {
            if let Some(statistics) = result.per_medium.get_mut(&index) {
                statistics.status |= ChunkStatus::UNDERREPLICATED;
                if has_sealed_replica {
                    statistics.add_replication_index(ReplicaIndex::GENERIC);
                }
            }
        }
    } else if deficient {
        result.status |= CrossMediumChunkStatus::DEFICIENT;
    }

    result
}

fn compute_regular_medium_statistics(
    cluster: &Cluster,
    chunk: &Chunk,
    medium: &Medium,
    replication_factor: u8,
    has_sealed_replica: bool,
    consistent_nodes: Option<&[NodeId]>,
) -> MediumStatistics {
    let mut result = MediumStatistics::default();
    let max_replicas_per_rack = cluster.placement.max_replicas_per_rack(chunk, replication_factor, None);

    let mut replica_count = 0usize;
    let mut decommissioned_replicas = Vec::new();
    let mut sealed_on_medium = 0usize;
    let mut unsealed_on_medium = 0usize;
    let mut per_rack: BTreeMap<RackIndex, usize> = BTreeMap::new();
    let mut unsafely_placed = false;
    let mut inconsistent_replica = None;

    for replica in chunk.replicas_on(medium.index) {
        if replica.is_sealed() {
            sealed_on_medium += 1;
        } else {
            unsealed_on_medium += 1;
        }
        if is_decommissioned(cluster, replica.node) {
            decommissioned_replicas.push(*replica);
        } else {
            replica_count += 1;
        }
        if let Some(rack) = cluster.nodes.rack_of(replica.node) {
            let count = per_rack.entry(rack).or_insert(0);
            *count += 1;
            if *count > max_replicas_per_rack {
                unsafely_placed = true;
            }
        }
        if let Some(nodes) = consistent_nodes {
            if inconsistent_replica.is_none() && !nodes.contains(&replica.node) {
                inconsistent_replica = Some(*replica);
            }
        }
    }

    let designated_node_missing = consistent_nodes
        .map(|nodes| nodes.iter().any(|node| !chunk.replicas_on(medium.index).any(|r| r.node == *node)))
        .unwrap_or(false);
    let inconsistently_placed = inconsistent_replica.is_some() || designated_node_missing;

    let decommissioned_count = decommissioned_replicas.len();
    let replication_factor = replication_factor as usize;
    result.replica_count[0] = replica_count.min(u8::MAX as usize) as u8;
    result.decommissioned_replica_count[0] = decommissioned_count.min(u8::MAX as usize) as u8;

    if replica_count + decommissioned_count == 0 {
        result.status |= ChunkStatus::LOST;
    }

    if chunk.is_sealed() {
        if chunk.is_journal() && replication_factor > 0 && sealed_on_medium == 0 {
            result.status |= ChunkStatus::SEALED_MISSING;
        }

        if replica_count < replication_factor && sealed_on_medium > 0 {
            result.status |= ChunkStatus::UNDERREPLICATED;
        }

        let totally_sealed = unsealed_on_medium == 0;
        if totally_sealed {
            if decommissioned_count > 0 && replica_count + decommissioned_count > replication_factor {
                result.status |= ChunkStatus::OVERREPLICATED;
                if replica_count >= replication_factor {
                    result.decommissioned_removal_replicas = decommissioned_replicas;
                } else {
                    let excess = replica_count + decommissioned_count - replication_factor;
                    result.decommissioned_removal_replicas =
                        decommissioned_replicas.into_iter().take(excess).collect();
                }
            } else if replica_count > replication_factor {
                result.status |= ChunkStatus::OVERREPLICATED;
                match inconsistent_replica {
                    Some(replica) => result.decommissioned_removal_replicas.push(replica),
                    None => result.balancing_removal_indexes.push(ReplicaIndex::GENERIC),
                }
            }
        }
    }

    if replication_factor > 1 && unsafely_placed && !result.status.contains(ChunkStatus::OVERREPLICATED) {
        result.status |= ChunkStatus::UNSAFELY_PLACED;
    }

    if inconsistently_placed && !result.status.contains(ChunkStatus::OVERREPLICATED) {
        result.status |= ChunkStatus::INCONSISTENTLY_PLACED;
    }

    if has_sealed_replica
        && result.status.intersects(
            ChunkStatus::UNDERREPLICATED | ChunkStatus::UNSAFELY_PLACED | ChunkStatus::INCONSISTENTLY_PLACED,
        )
    {
        result.add_replication_index(ReplicaIndex::GENERIC);
    }

    result
}

/// Per-medium tallies of erasure parts gathered in one pass over replicas.
#[derive(Default)]
struct PartTally {
    replica_count: [u8; REPLICA_INDEX_BOUND],
    decommissioned_replica_count: [u8; REPLICA_INDEX_BOUND],
    decommissioned_replicas: BTreeMap<ReplicaIndex, Vec<ChunkReplica>>,
    /// Parts whose decommissioned copies sit on nodes that are actually
    /// being decommissioned, rather than doubling up on one node.
    truly_decommissioned: PartIndexSet,
    doubled_up: PartIndexSet,
    unsafely_placed: PartIndexSet,
    replicas: BTreeMap<ReplicaIndex, Vec<ChunkReplica>>,
}

fn compute_erasure_statistics(
    cluster: &Cluster,
    config: &ReplicatorConfig,
    chunk: &Chunk,
    replication: &Replication,
    consistent_nodes: &BTreeMap<MediumIndex, Vec<NodeId>>,
) -> ChunkStatistics {
    let codec = chunk.erasure_codec;
    let total_part_count = codec.total_part_count();
    let max_replicas_per_rack = cluster.placement.max_replicas_per_rack(chunk, 1, None);

    let mut tallies: BTreeMap<MediumIndex, PartTally> = BTreeMap::new();
    let mut visited: BTreeSet<(MediumIndex, NodeId)> = BTreeSet::new();
    let mut per_rack: BTreeMap<(MediumIndex, RackIndex), usize> = BTreeMap::new();
    let mut present_parts = PartIndexSet::new();

    for replica in &chunk.stored_replicas {
        let index = replica.replica_index;
        if index.as_usize() >= total_part_count {
            tracing::error!(
                "Invariant violation: chunk {} has replica index {} beyond codec bound",
                chunk.id,
                index
            );
            continue;
        }
        present_parts.insert(index);
        let tally = tallies.entry(replica.medium).or_default();
        let first_on_node = visited.insert((replica.medium, replica.node));
        let doubled_up = !first_on_node && !config.allow_multiple_erasure_parts_per_node;
        let decommissioned = is_decommissioned(cluster, replica.node);
        let slot = index.as_usize();
        if decommissioned || doubled_up {
            tally.decommissioned_replica_count[slot] = tally.decommissioned_replica_count[slot].saturating_add(1);
            tally.decommissioned_replicas.entry(index).or_default().push(*replica);
            if decommissioned {
                tally.truly_decommissioned.insert(index);
            } else {
                tally.doubled_up.insert(index);
            }
        } else {
            tally.replica_count[slot] = tally.replica_count[slot].saturating_add(1);
        }
        tally.replicas.entry(index).or_default().push(*replica);

        if replica.is_sealed() {
            if let Some(rack) = cluster.nodes.rack_of(replica.node) {
                let count = per_rack.entry((replica.medium, rack)).or_insert(0);
                *count += 1;
                if *count > max_replicas_per_rack {
                    tally.unsafely_placed.insert(index);
                }
            }
        }
    }

    let mut result = ChunkStatistics::default();
    let empty_tally = PartTally::default();
    let mut all_media_data_parts_only = true;
    let mut policies = BTreeMap::new();
    for (index, policy) in replication.iter() {
        let Some(medium) = cluster.store.medium(index) else {
            continue;
        };
        if medium.cache {
            continue;
        }
        if policy.replication_factor > 0 {
            all_media_data_parts_only &= policy.data_parts_only;
        }
        let tally = tallies.get(&index).unwrap_or(&empty_tally);
        let statistics = compute_erasure_medium_statistics(
            chunk,
            policy,
            tally,
            consistent_nodes.get(&index).map(Vec::as_slice),
        );
        policies.insert(index, (policy, medium.transient));
        result.per_medium.insert(index, statistics);
    }

    let mut cross_erased = PartIndexSet::range(0, total_part_count);
    let mut cross_erased_durable = PartIndexSet::range(0, total_part_count);
    let mut has_durable_medium = false;
    for (index, statistics) in &result.per_medium {
        let Some((policy, transient)) = policies.get(index) else {
            continue;
        };
        let absent = absent_parts(statistics, total_part_count);
        cross_erased = cross_erased.intersection(absent);
        if !*transient && policy.replication_factor > 0 {
            has_durable_medium = true;
            cross_erased_durable = cross_erased_durable.intersection(absent);
        }
    }
    if result.per_medium.is_empty() {
        cross_erased = PartIndexSet::new();
    }

    if !codec.can_repair(&cross_erased) {
        result.status |= CrossMediumChunkStatus::LOST;
    } else if replication.is_vital() && has_durable_medium && !codec.can_repair(&cross_erased_durable) {
        result.status |= CrossMediumChunkStatus::PRECARIOUS;
    }

    if cross_erased.intersects(&codec.data_parts()) {
        result.status |= CrossMediumChunkStatus::DATA_MISSING;
    }
    if cross_erased.intersects(&codec.parity_parts()) && !all_media_data_parts_only {
        result.status |= CrossMediumChunkStatus::PARITY_MISSING;
    }

    if chunk.is_sealed() {
        for statistics in result.per_medium.values_mut() {
            let locally_erased = statistics.erased_parts;
            let recoverable_by_copy: Vec<ReplicaIndex> = locally_erased
                .iter()
                .filter(|index| !cross_erased.contains(*index))
                .collect();
            if recoverable_by_copy.is_empty() {
                continue;
            }
            for index in recoverable_by_copy {
                statistics.add_replication_index(index);
            }
            statistics.status |= ChunkStatus::UNDERREPLICATED;
            // Repair only has to rebuild what no medium has.
            let still_missing = locally_erased.intersection(cross_erased);
            statistics.erased_parts = still_missing;
            statistics.status.remove(ChunkStatus::DATA_MISSING | ChunkStatus::PARITY_MISSING);
            if still_missing.intersects(&codec.data_parts()) {
                statistics.status |= ChunkStatus::DATA_MISSING;
            }
            if still_missing.intersects(&codec.parity_parts()) {
                statistics.status |= ChunkStatus::PARITY_MISSING;
            }
        }
    }

    let lost = result.status.contains(CrossMediumChunkStatus::LOST);
    let medium_wise_lost = !lost
        && result
            .per_medium
            .values()
            .any(|statistics| statistics.status.contains(ChunkStatus::LOST));
    if medium_wise_lost {
        result.status |= CrossMediumChunkStatus::MEDIUM_WISE_LOST;
    }
    let deficient = result.per_medium.values().any(|statistics| {
        statistics.status.intersects(
            ChunkStatus::DATA_MISSING
                | ChunkStatus::PARITY_MISSING
                | ChunkStatus::DATA_DECOMMISSIONED
                | ChunkStatus::PARITY_DECOMMISSIONED
                | ChunkStatus::UNDERREPLICATED,
        )
    });
    if !lost && !medium_wise_lost && deficient {
        result.status |= CrossMediumChunkStatus::DEFICIENT;
    }

    if chunk.is_journal() && !chunk.is_sealed() && present_parts.len() < chunk.read_quorum as usize {
        result.status |= CrossMediumChunkStatus::QUORUM_MISSING;
    }

    result
}

fn absent_parts(statistics: &MediumStatistics, total_part_count: usize) -> PartIndexSet {
    (0..total_part_count)
        .map(|index| ReplicaIndex(index as u8))
        .filter(|index| {
            let slot = index.as_usize();
            statistics.replica_count[slot] == 0 && statistics.decommissioned_replica_count[slot] == 0
        })
        .collect()
}

fn compute_erasure_medium_statistics(
    chunk: &Chunk,
    policy: ReplicationPolicy,
    tally: &PartTally,
    consistent_nodes: Option<&[NodeId]>,
) -> MediumStatistics {
    let codec = chunk.erasure_codec;
    let mut result = MediumStatistics {
        replica_count: tally.replica_count,
        decommissioned_replica_count: tally.decommissioned_replica_count,
        ..MediumStatistics::default()
    };
    let sealed = chunk.is_sealed();
    let mut erased = PartIndexSet::new();

    for slot in 0..codec.total_part_count() {
        let index = ReplicaIndex(slot as u8);
        let is_data = codec.is_data_part(index);
        let removal_advised = policy.replication_factor == 0 || (policy.data_parts_only && !is_data);
        let target_count = if removal_advised { 0 } else { 1 };
        let replica_count = tally.replica_count[slot] as usize;
        let decommissioned_count = tally.decommissioned_replica_count[slot] as usize;
        let designated = consistent_nodes.and_then(|nodes| nodes.get(slot)).copied();
        let misplaced = designated.and_then(|node| {
            tally
                .replicas
                .get(&index)
                .and_then(|replicas| replicas.iter().find(|replica| replica.node != node))
                .copied()
        });

        if sealed {
            if replica_count >= target_count && decommissioned_count > 0 {
                result.status |= ChunkStatus::OVERREPLICATED;
                if let Some(replicas) = tally.decommissioned_replicas.get(&index) {
                    result.decommissioned_removal_replicas.extend(replicas.iter().copied());
                }
            } else if replica_count > target_count {
                result.status |= ChunkStatus::OVERREPLICATED;
                match misplaced {
                    Some(replica) if replica_count > 1 || removal_advised => {
                        result.decommissioned_removal_replicas.push(replica)
                    }
                    _ => result.balancing_removal_indexes.push(index),
                }
            }
        }

        if removal_advised {
            continue;
        }

        if replica_count == 0 && decommissioned_count > 0 {
            if tally.truly_decommissioned.contains(index) && !tally.doubled_up.contains(index) {
                result.status |= if is_data {
                    ChunkStatus::DATA_DECOMMISSIONED
                } else {
                    ChunkStatus::PARITY_DECOMMISSIONED
                };
            } else {
                result.status |= ChunkStatus::UNDERREPLICATED;
                result.add_replication_index(index);
            }
        }

        if replica_count == 0 && decommissioned_count == 0 {
            erased.insert(index);
            result.status |= if is_data {
                ChunkStatus::DATA_MISSING
            } else {
                ChunkStatus::PARITY_MISSING
            };
        }

        if replica_count == 1 && tally.unsafely_placed.contains(index) && sealed {
            result.status |= ChunkStatus::UNSAFELY_PLACED;
            result.add_replication_index(index);
        }

        if let Some(node) = designated {
            let on_designated = tally
                .replicas
                .get(&index)
                .map(|replicas| replicas.iter().any(|replica| replica.node == node))
                .unwrap_or(false);
            if !on_designated && replica_count > 0 && sealed {
                result.status |= ChunkStatus::INCONSISTENTLY_PLACED;
                result.add_replication_index(index);
            }
        }
    }

    if !erased.is_empty() && !codec.can_repair(&erased) {
        result.status |= ChunkStatus::LOST;
    }
    result.erased_parts = erased;
    result
}
