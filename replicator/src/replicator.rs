use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use model::{
    CellTag, Chunk, ChunkId, ChunkListId, ChunkPartLocation, ChunkPartRef, ChunkReplica, ChunkStore,
    ChunkTreeRef, EphemeralRequisitionRegistry, MediumIndex, MediumSet, Node, NodeId, NodeState,
    PartIndexSet, ReplicaIndex, ReplicaState, Replication, ReplicationPolicy, Requisition,
    RequisitionIndex, ScanKind, REPLICATION_PRIORITY_COUNT,
};
use placement::AllocationRequest;
use serde::{Deserialize, Serialize};

use crate::health::{ChunkHealthSets, HealthSet};
use crate::job::{Job, JobType};
use crate::messages::{RequisitionUpdate, RequisitionUpdateRequest, SealCandidate, WriteTarget};
use crate::status::{aggregated_replication, compute_chunk_statistics, ChunkStatus, CrossMediumChunkStatus};
use crate::{ChunkScanner, Clock, Cluster, DecayingMaxMinBalancer, JobTracker, RepairQueue, ReplicatorConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairQueueKind {
    /// Parts with no copy anywhere.
    Missing,
    /// Parts that only survive on decommissioned nodes.
    Decommissioned,
}

enum Attempt {
    Scheduled(Job),
    /// Could not schedule now; keep the queue entry.
    Misscheduled,
    /// The entry is stale; drop it.
    Drop,
}

/// Memoized requisition for the last seen parent set. Sibling chunks share
/// parents, so consecutive lookups usually hit.
#[derive(Debug, Default)]
struct RequisitionCache {
    parents: Option<BTreeMap<ChunkTreeRef, u32>>,
    regular: Option<Option<Requisition>>,
    erasure: Option<Option<Requisition>>,
}

impl RequisitionCache {
    fn lookup(&self, parents: &BTreeMap<ChunkTreeRef, u32>, erasure: bool) -> Option<Option<Requisition>> {
        if self.parents.as_ref() != Some(parents) {
            return None;
        }
        if erasure {
            self.erasure.clone()
        } else {
            self.regular.clone()
        }
    }

    fn store(&mut self, parents: &BTreeMap<ChunkTreeRef, u32>, erasure: bool, value: Option<Requisition>) {
        if self.parents.as_ref() != Some(parents) {
            self.parents = Some(parents.clone());
            self.regular = None;
            self.erasure = None;
        }
        if erasure {
            self.erasure = Some(value);
        } else {
            self.regular = Some(value);
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug)]
struct RequisitionTraversal {
    root: ChunkListId,
    stack: Vec<ChunkTreeRef>,
    visited: HashSet<ChunkTreeRef>,
}

impl RequisitionTraversal {
    fn new(root: ChunkListId) -> Self {
        Self {
            root,
            stack: vec![ChunkTreeRef::ChunkList(root)],
            visited: HashSet::new(),
        }
    }
}

/// Leader-only engine that keeps every chunk at its requested replication:
/// it classifies chunks, queues remedial work on nodes and turns queue
/// entries into jobs when nodes heartbeat.
#[derive(Debug)]
pub struct ChunkReplicator {
    config: ReplicatorConfig,
    clock: Arc<dyn Clock>,
    epoch: u64,
    leading: bool,
    enabled: Option<bool>,
    blob_refresh: ChunkScanner,
    journal_refresh: ChunkScanner,
    blob_requisition_update: ChunkScanner,
    journal_requisition_update: ChunkScanner,
    health: ChunkHealthSets,
    missing_repair_queues: BTreeMap<MediumIndex, RepairQueue>,
    decommissioned_repair_queues: BTreeMap<MediumIndex, RepairQueue>,
    missing_balancer: DecayingMaxMinBalancer<MediumIndex>,
    decommissioned_balancer: DecayingMaxMinBalancer<MediumIndex>,
    requisition_cache: RequisitionCache,
    traversals: VecDeque<RequisitionTraversal>,
    finished_traversals: Vec<ChunkListId>,
    seal_candidates: BTreeSet<ChunkId>,
}

impl ChunkReplicator {
    pub fn new(config: ReplicatorConfig, clock: Arc<dyn Clock>) -> Self {
        let half_life = Duration::milliseconds(config.repair_balancer_half_life_ms as i64);
        Self {
            health: ChunkHealthSets::new(config.max_oldest_part_missing_chunks),
            clock,
            epoch: 0,
            leading: false,
            enabled: None,
            blob_refresh: ChunkScanner::new(ScanKind::Refresh, false),
            journal_refresh: ChunkScanner::new(ScanKind::Refresh, true),
            blob_requisition_update: ChunkScanner::new(ScanKind::RequisitionUpdate, false),
            journal_requisition_update: ChunkScanner::new(ScanKind::RequisitionUpdate, true),
            missing_repair_queues: BTreeMap::new(),
            decommissioned_repair_queues: BTreeMap::new(),
            missing_balancer: DecayingMaxMinBalancer::new(half_life),
            decommissioned_balancer: DecayingMaxMinBalancer::new(half_life),
            requisition_cache: RequisitionCache::default(),
            traversals: VecDeque::new(),
            finished_traversals: Vec::new(),
            seal_candidates: BTreeSet::new(),
            config,
        }
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: ReplicatorConfig) {
        let half_life = Duration::milliseconds(config.repair_balancer_half_life_ms as i64);
        self.missing_balancer.set_half_life(half_life);
        self.decommissioned_balancer.set_half_life(half_life);
        self.health.set_max_oldest_part_missing(config.max_oldest_part_missing_chunks);
        self.config = config;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_leading(&self) -> bool {
        self.leading
    }

    pub fn enabled(&self) -> Option<bool> {
        self.enabled
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled == Some(true)
    }

    pub fn health(&self) -> &ChunkHealthSets {
        &self.health
    }

    pub fn refresh_queue_size(&self) -> usize {
        self.blob_refresh.queue_size() + self.journal_refresh.queue_size()
    }

    pub fn requisition_update_queue_size(&self) -> usize {
        self.blob_requisition_update.queue_size() + self.journal_requisition_update.queue_size()
    }

    pub fn active_traversal_count(&self) -> usize {
        self.traversals.len()
    }

    pub fn repair_queue(&self, kind: RepairQueueKind, medium: MediumIndex) -> Option<&RepairQueue> {
        match kind {
            RepairQueueKind::Missing => self.missing_repair_queues.get(&medium),
            RepairQueueKind::Decommissioned => self.decommissioned_repair_queues.get(&medium),
        }
    }

    fn repair_queue_mut(&mut self, kind: RepairQueueKind, medium: MediumIndex) -> &mut RepairQueue {
        match kind {
            RepairQueueKind::Missing => self.missing_repair_queues.entry(medium).or_default(),
            RepairQueueKind::Decommissioned => self.decommissioned_repair_queues.entry(medium).or_default(),
        }
    }

    fn balancer_mut(&mut self, kind: RepairQueueKind) -> &mut DecayingMaxMinBalancer<MediumIndex> {
        match kind {
            RepairQueueKind::Missing => &mut self.missing_balancer,
            RepairQueueKind::Decommissioned => &mut self.decommissioned_balancer,
        }
    }

    fn scanner_mut(&mut self, kind: ScanKind, journal: bool) -> &mut ChunkScanner {
        match (kind, journal) {
            (ScanKind::Refresh, false) => &mut self.blob_refresh,
            (ScanKind::Refresh, true) => &mut self.journal_refresh,
            (ScanKind::RequisitionUpdate, false) => &mut self.blob_requisition_update,
            (ScanKind::RequisitionUpdate, true) => &mut self.journal_requisition_update,
        }
    }

    /// Starts a new epoch and schedules every chunk for refresh and
    /// requisition update.
    pub fn on_leading_started(&mut self, cluster: &mut Cluster) {
        self.leading = true;
        self.epoch += 1;
        self.clear_transient_state(cluster);

        let (mut blobs, mut journals) = (Vec::new(), Vec::new());
        for chunk in cluster.store.chunks() {
            if chunk.is_journal() {
                journals.push(chunk.id);
            } else {
                blobs.push(chunk.id);
            }
            if chunk.is_journal() && chunk.sealable && !chunk.sealed {
                self.seal_candidates.insert(chunk.id);
            }
        }
        let epoch = self.epoch;
        for (journal, ids) in [(false, &blobs), (true, &journals)] {
            for id in ids {
                let Some(chunk) = cluster.store.chunk_mut(*id) else {
                    continue;
                };
                for kind in [ScanKind::Refresh, ScanKind::RequisitionUpdate] {
                    self.scanner_mut(kind, journal).schedule_global_scan(chunk, epoch);
                }
            }
        }
        tracing::info!(
            "Chunk replicator started: epoch {}, {} blob and {} journal chunks scheduled",
            self.epoch,
            blobs.len(),
            journals.len()
        );
    }

    pub fn on_leading_finished(&mut self, cluster: &mut Cluster) {
        self.leading = false;
        self.epoch += 1;
        self.clear_transient_state(cluster);
        tracing::info!("Chunk replicator stopped");
    }

    fn clear_transient_state(&mut self, cluster: &mut Cluster) {
        self.enabled = None;
        for kind in [ScanKind::Refresh, ScanKind::RequisitionUpdate] {
            for journal in [false, true] {
                self.scanner_mut(kind, journal).clear();
            }
        }
        self.health.clear();
        self.missing_repair_queues.clear();
        self.decommissioned_repair_queues.clear();
        self.missing_balancer.reset_weights();
        self.decommissioned_balancer.reset_weights();
        self.requisition_cache.reset();
        self.traversals.clear();
        self.finished_traversals.clear();
        self.seal_candidates.clear();
        for node in cluster.nodes.nodes_mut() {
            node.clear_queues();
            node.pending_endorsements.clear();
        }
    }

    /// Queues the chunk for refresh after the configured delay. A chunk is
    /// queued at most once per epoch.
    pub fn schedule_chunk_refresh(&mut self, cluster: &mut Cluster, id: ChunkId) {
        if !self.leading {
            return;
        }
        let due = self.clock.now() + self.config.chunk_refresh_delay();
        let epoch = self.epoch;
        let Some(chunk) = cluster.store.chunk_mut(id) else {
            return;
        };
        let journal = chunk.is_journal();
        self.scanner_mut(ScanKind::Refresh, journal).enqueue(chunk, epoch, due);
    }

    pub fn schedule_requisition_update(&mut self, cluster: &mut Cluster, id: ChunkId) {
        if !self.leading {
            return;
        }
        let now = self.clock.now();
        let epoch = self.epoch;
        let Some(chunk) = cluster.store.chunk_mut(id) else {
            return;
        };
        let journal = chunk.is_journal();
        self.scanner_mut(ScanKind::RequisitionUpdate, journal).enqueue(chunk, epoch, now);
    }

    pub fn schedule_seal(&mut self, chunk: ChunkId) {
        if self.leading {
            self.seal_candidates.insert(chunk);
        }
    }

    /// Pops due chunks from a scanner within the configured count and time
    /// budget, clearing their scan flags.
    fn dequeue_batch(&mut self, cluster: &mut Cluster, kind: ScanKind, journal: bool) -> Vec<ChunkId> {
        let (max_chunks, max_time_ms) = match (kind, journal) {
            (ScanKind::Refresh, false) => (self.config.max_blob_chunks_per_refresh, self.config.max_time_per_blob_refresh_ms),
            (ScanKind::Refresh, true) => (
                self.config.max_journal_chunks_per_refresh,
                self.config.max_time_per_journal_refresh_ms,
            ),
            (ScanKind::RequisitionUpdate, false) => (
                self.config.max_blob_chunks_per_requisition_update,
                self.config.max_time_per_blob_requisition_update_ms,
            ),
            (ScanKind::RequisitionUpdate, true) => (
                self.config.max_journal_chunks_per_requisition_update,
                self.config.max_time_per_journal_requisition_update_ms,
            ),
        };
        let deadline = self.clock.now() + Duration::milliseconds(max_time_ms as i64);
        let mut batch = Vec::new();
        while batch.len() < max_chunks {
            let now = self.clock.now();
            if now >= deadline && !batch.is_empty() {
                break;
            }
            let Some(id) = self.scanner_mut(kind, journal).dequeue(now) else {
                break;
            };
            if let Some(chunk) = cluster.store.chunk_mut(id) {
                chunk.clear_scan_flag(kind);
                batch.push(id);
            }
        }
        batch
    }

    /// One refresh iteration over both chunk kinds.
    pub fn run_refresh(&mut self, cluster: &mut Cluster) -> usize {
        if !self.leading || !self.config.enable_refresh {
            return 0;
        }
        let mut total = 0;
        for journal in [false, true] {
            let batch = self.dequeue_batch(cluster, ScanKind::Refresh, journal);
            total += batch.len();
            for id in batch {
                self.refresh_chunk(cluster, id);
            }
        }
        if total > 0 {
            tracing::debug!("Chunk refresh iteration completed: {} chunks refreshed", total);
        }
        total
    }

    fn remove_chunk_from_queues(&mut self, cluster: &mut Cluster, id: ChunkId) {
        let Some(chunk) = cluster.store.chunk(id) else {
            return;
        };
        let holders: BTreeSet<NodeId> = chunk
            .stored_replicas
            .iter()
            .chain(chunk.cached_replicas.iter())
            .map(|replica| replica.node)
            .collect();
        for node in holders {
            if let Some(node) = cluster.nodes.node_mut(node) {
                node.remove_chunk_from_queues(id);
            }
        }
        for queues in [&mut self.missing_repair_queues, &mut self.decommissioned_repair_queues] {
            for (medium, queue) in queues.iter_mut() {
                queue.remove(ChunkPartRef::new(id, ReplicaIndex::GENERIC).on_medium(*medium));
            }
        }
    }

    fn add_to_repair_queue(&mut self, kind: RepairQueueKind, location: ChunkPartLocation) {
        self.repair_queue_mut(kind, location.medium).push_back(location);
        self.balancer_mut(kind).add_contender(location.medium);
    }

    /// Recomputes the chunk's health and rebuilds every queue entry that
    /// refers to it.
    pub fn refresh_chunk(&mut self, cluster: &mut Cluster, id: ChunkId) {
        let cell_tag = cluster.store.cell_tag();
        let eligible = cluster
            .store
            .chunk(id)
            .map(|chunk| chunk.confirmed && chunk.native_cell == cell_tag)
            .unwrap_or(false);
        if !eligible {
            return;
        }

        self.health.reset(id);
        self.remove_chunk_from_queues(cluster, id);

        let Some(chunk) = cluster.store.chunk(id) else {
            return;
        };
        let statistics = compute_chunk_statistics(cluster, &self.config, chunk);
        let replication = aggregated_replication(&cluster.store, chunk);
        let vital = replication.is_vital();
        let has_job = chunk.job.is_some();

        let mut removals: Vec<(NodeId, ChunkPartRef, MediumIndex)> = Vec::new();
        let mut replications: Vec<(NodeId, usize, ChunkPartLocation, MediumIndex)> = Vec::new();
        let mut repairs: Vec<(RepairQueueKind, MediumIndex)> = Vec::new();
        let mut seals: Vec<(NodeId, ChunkPartLocation)> = Vec::new();
        let mut health: Vec<HealthSet> = Vec::new();

        for (medium, stats) in &statistics.per_medium {
            let status = stats.status;
            if status.contains(ChunkStatus::UNDERREPLICATED) {
                health.push(HealthSet::Underreplicated);
            }
            if status.contains(ChunkStatus::OVERREPLICATED) {
                health.push(HealthSet::Overreplicated);
            }
            if status.contains(ChunkStatus::UNSAFELY_PLACED) {
                health.push(HealthSet::UnsafelyPlaced);
            }
            if status.contains(ChunkStatus::INCONSISTENTLY_PLACED) {
                health.push(HealthSet::InconsistentlyPlaced);
            }
            if has_job {
                continue;
            }

            if status.contains(ChunkStatus::OVERREPLICATED) {
                for replica in &stats.decommissioned_removal_replicas {
                    removals.push((replica.node, ChunkPartRef::new(id, replica.replica_index), replica.medium));
                }
                let factor = replication.get(*medium).replication_factor;
                for index in &stats.balancing_removal_indexes {
                    if let Some(target) =
                        cluster.placement.get_removal_target(&cluster.nodes, chunk, *medium, *index, factor)
                    {
                        removals.push((target, ChunkPartRef::new(id, *index), *medium));
                    }
                }
            }

            if status.intersects(
                ChunkStatus::UNDERREPLICATED | ChunkStatus::UNSAFELY_PLACED | ChunkStatus::INCONSISTENTLY_PLACED,
            ) {
                for index in &stats.replication_indexes {
                    let live = stats.replica_count[index.as_usize()] as usize;
                    let priority = live.max(1) - 1;
                    for replica in chunk
                        .stored_replicas
                        .iter()
                        .filter(|replica| replica.replica_index == *index && replica.is_sealed())
                    {
                        let source = ChunkPartRef::new(id, *index).on_medium(replica.medium);
                        replications.push((replica.node, priority, source, *medium));
                    }
                }
            }

            if chunk.is_erasure() && !status.contains(ChunkStatus::LOST) {
                if status.intersects(ChunkStatus::DATA_MISSING | ChunkStatus::PARITY_MISSING) {
                    repairs.push((RepairQueueKind::Missing, *medium));
                } else if status.intersects(ChunkStatus::DATA_DECOMMISSIONED | ChunkStatus::PARITY_DECOMMISSIONED) {
                    repairs.push((RepairQueueKind::Decommissioned, *medium));
                }
            }
        }

        if chunk.is_journal() && chunk.is_sealed() && !has_job {
            for replica in chunk.stored_replicas.iter().filter(|replica| !replica.is_sealed()) {
                seals.push((replica.node, ChunkPartRef::new(id, replica.replica_index).on_medium(replica.medium)));
            }
        }

        let cross = statistics.status;
        if cross.contains(CrossMediumChunkStatus::LOST) {
            health.push(HealthSet::Lost);
            if vital {
                health.push(HealthSet::LostVital);
            }
        }
        if cross.contains(CrossMediumChunkStatus::DATA_MISSING) {
            health.push(HealthSet::DataMissing);
        }
        if cross.contains(CrossMediumChunkStatus::PARITY_MISSING) {
            health.push(HealthSet::ParityMissing);
        }
        if cross.contains(CrossMediumChunkStatus::QUORUM_MISSING) {
            health.push(HealthSet::QuorumMissing);
        }
        if cross.contains(CrossMediumChunkStatus::PRECARIOUS) {
            health.push(HealthSet::Precarious);
            if vital {
                health.push(HealthSet::PrecariousVital);
            }
        }

        let parts_missing = chunk.is_erasure()
            && cross.intersects(CrossMediumChunkStatus::DATA_MISSING | CrossMediumChunkStatus::PARITY_MISSING);
        let endorsement = self.endorsement_target(cluster, chunk);
        let consistent_registration: Vec<(MediumIndex, usize)> = match chunk.consistent_placement_hash {
            Some(_) if cluster.placement.config().enable_consistent_placement => replication
                .iter()
                .filter(|(_, policy)| policy.replication_factor > 0)
                .filter(|(medium, _)| cluster.store.medium(*medium).map(|m| !m.cache).unwrap_or(false))
                .map(|(medium, policy)| {
                    let count = if chunk.is_erasure() {
                        if policy.data_parts_only {
                            chunk.erasure_codec.data_part_count()
                        } else {
                            chunk.erasure_codec.total_part_count()
                        }
                    } else {
                        policy.replication_factor as usize
                    };
                    (medium, count)
                })
                .collect(),
            _ => Vec::new(),
        };
        let hash = chunk.consistent_placement_hash;

        for set in health {
            self.health.insert(set, id);
        }
        for (node, part, medium) in removals {
            if let Some(node) = cluster.nodes.node_mut(node) {
                if node.reported_heartbeat {
                    node.add_to_removal_queue(part, medium);
                }
            }
        }
        for (node, priority, source, target) in replications {
            if let Some(node) = cluster.nodes.node_mut(node) {
                if node.reported_heartbeat {
                    node.add_to_replication_queue(priority, source, MediumSet::single(target));
                }
            }
        }
        for (kind, medium) in repairs {
            self.add_to_repair_queue(kind, ChunkPartRef::new(id, ReplicaIndex::GENERIC).on_medium(medium));
        }
        for (node, location) in seals {
            if let Some(node) = cluster.nodes.node_mut(node) {
                if node.reported_heartbeat {
                    node.add_to_seal_queue(location);
                }
            }
        }

        let now = self.clock.now();
        let mut loss_time = None;
        if let Some(chunk) = cluster.store.chunk_mut(id) {
            if parts_missing {
                loss_time = Some(*chunk.part_loss_time.get_or_insert(now));
            } else {
                chunk.part_loss_time = None;
            }
            if let Some(node) = endorsement {
                chunk.endorsement_node = Some(node);
            }
        }
        if let Some(loss_time) = loss_time {
            self.health.remember_part_missing(id, loss_time);
        }
        if let Some(node) = endorsement.and_then(|node| cluster.nodes.node_mut(node)) {
            node.pending_endorsements.insert(id);
        }
        if let Some(hash) = hash {
            for (medium, count) in consistent_registration {
                cluster.consistent_placement.register_chunk(id, hash, medium, count);
            }
        }

        tracing::trace!("Chunk refreshed: {} status {:?}", id, statistics.status);
    }

    /// The node that should announce a chunk still requiring endorsement:
    /// the current one if it still holds a replica, else the first live
    /// holder.
    fn endorsement_target(&self, cluster: &Cluster, chunk: &Chunk) -> Option<NodeId> {
        if !chunk.endorsement_required {
            return None;
        }
        let live = |node: NodeId| {
            chunk.has_replica_on(node)
                && cluster
                    .nodes
                    .node(node)
                    .map(|node| node.is_online() && node.reported_heartbeat)
                    .unwrap_or(false)
        };
        if let Some(node) = chunk.endorsement_node.filter(|node| live(*node)) {
            return Some(node);
        }
        chunk.stored_replicas.iter().map(|replica| replica.node).find(|node| live(*node))
    }

    /// Drains the node's pending endorsements; announced chunks no longer
    /// require endorsement.
    pub fn take_announcements(&mut self, cluster: &mut Cluster, node: NodeId) -> Vec<ChunkId> {
        let Some(node) = cluster.nodes.node_mut(node) else {
            return Vec::new();
        };
        let pending = std::mem::take(&mut node.pending_endorsements);
        for id in &pending {
            if let Some(chunk) = cluster.store.chunk_mut(*id) {
                chunk.endorsement_required = false;
            }
        }
        pending.into_iter().collect()
    }

    /// Chunks the node was ever chosen to announce; re-sent after a full
    /// heartbeat.
    pub fn endorsed_chunks(&self, cluster: &Cluster, node: NodeId) -> Vec<ChunkId> {
        cluster
            .store
            .chunks()
            .filter(|chunk| chunk.endorsement_node == Some(node))
            .map(|chunk| chunk.id)
            .collect()
    }

    /// Requisition of a chunk derived from the owners above it, or `None`
    /// for staged chunks and chunks without owners.
    pub fn compute_chunk_requisition(&mut self, store: &ChunkStore, chunk: &Chunk) -> Option<Requisition> {
        if chunk.is_staged() {
            return None;
        }
        let erasure = chunk.is_erasure();
        if let Some(cached) = self.requisition_cache.lookup(&chunk.parents, erasure) {
            return cached;
        }

        let mut queue: VecDeque<ChunkListId> = VecDeque::new();
        for parent in chunk.parents.keys() {
            match parent {
                ChunkTreeRef::ChunkList(id) => queue.push_back(*id),
                ChunkTreeRef::ChunkView(id) => {
                    if let Some(view) = store.chunk_view(*id) {
                        queue.extend(view.parents.keys().copied());
                    }
                }
                other => {
                    tracing::error!("Invariant violation: chunk {} has parent {:?}", chunk.id, other);
                }
            }
        }

        let mut visited = HashSet::new();
        let mut requisition = Requisition::new();
        let mut found = false;
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let Some(list) = store.chunk_list(id) else {
                continue;
            };
            for owner in &list.owners {
                requisition.aggregate_with(&owner.replication, &owner.account, true);
                found = true;
            }
            queue.extend(list.parents.keys().copied());
        }

        let result = match (found, erasure) {
            (false, _) => None,
            (true, false) => Some(requisition),
            // Every erasure part is stored once per medium.
            (true, true) => {
                let mut capped = Requisition::new();
                for entry in requisition.entries() {
                    let mut single = Replication::new(requisition.is_vital());
                    single.set(entry.medium, ReplicationPolicy::new(1, entry.policy.data_parts_only));
                    capped.aggregate_with(&single, &entry.account, entry.committed);
                }
                Some(capped)
            }
        };
        self.requisition_cache.store(&chunk.parents, erasure, result.clone());
        result
    }

    /// One requisition update iteration. Returns the batches to apply, keyed
    /// by destination cell: the local cell, plus the native cell of every
    /// foreign chunk whose requisition changed.
    pub fn run_requisition_update(&mut self, cluster: &mut Cluster) -> Vec<(CellTag, RequisitionUpdateRequest)> {
        if !self.leading || !self.config.enable_requisition_update {
            return Vec::new();
        }
        self.requisition_cache.reset();
        let local_cell = cluster.store.cell_tag();
        let mut batches: BTreeMap<CellTag, (Vec<RequisitionUpdate>, EphemeralRequisitionRegistry)> = BTreeMap::new();
        let mut scanned = 0;

        for journal in [false, true] {
            let batch = self.dequeue_batch(cluster, ScanKind::RequisitionUpdate, journal);
            scanned += batch.len();
            for id in batch {
                let Some(chunk) = cluster.store.chunk(id) else {
                    continue;
                };
                let Some(requisition) = self.compute_chunk_requisition(&cluster.store, chunk) else {
                    continue;
                };
                if *cluster.store.requisitions().get(chunk.local_requisition) == requisition {
                    continue;
                }
                let mut destinations = vec![local_cell];
                if chunk.native_cell != local_cell {
                    destinations.push(chunk.native_cell);
                }
                for cell in destinations {
                    let (updates, registry) = batches
                        .entry(cell)
                        .or_insert_with(|| (Vec::new(), EphemeralRequisitionRegistry::new()));
                    let requisition_index = registry.get_or_create(&requisition);
                    updates.push(RequisitionUpdate {
                        chunk_id: id,
                        requisition_index,
                    });
                }
            }
        }

        if scanned > 0 {
            tracing::debug!(
                "Requisition update iteration completed: {} chunks scanned, {} batches",
                scanned,
                batches.len()
            );
        }
        batches
            .into_iter()
            .map(|(cell, (updates, registry))| {
                let request = RequisitionUpdateRequest {
                    cell_tag: local_cell,
                    updates,
                    dictionary: registry.into_dictionary(),
                };
                (cell, request)
            })
            .collect()
    }

    /// Applies a requisition batch computed by `request.cell_tag`. Dictionary
    /// entries are pinned while chunks switch over so that no index dies
    /// halfway through.
    pub fn apply_requisition_update(&mut self, cluster: &mut Cluster, request: &RequisitionUpdateRequest) -> usize {
        let mut dictionary: BTreeMap<u32, RequisitionIndex> = BTreeMap::new();
        for (key, requisition) in &request.dictionary {
            let registry = cluster.store.requisitions_mut();
            let index = registry.get_or_create(requisition);
            registry.ref_index(index);
            dictionary.insert(*key, index);
        }

        let mut applied = 0;
        for update in &request.updates {
            let Some(index) = dictionary.get(&update.requisition_index).copied() else {
                tracing::error!(
                    "Invariant violation: requisition update for chunk {} references unknown entry {}",
                    update.chunk_id,
                    update.requisition_index
                );
                continue;
            };
            match cluster.store.set_chunk_requisition(update.chunk_id, request.cell_tag, index) {
                Ok(true) => {
                    applied += 1;
                    self.schedule_chunk_refresh(cluster, update.chunk_id);
                }
                Ok(false) => {}
                Err(e) => tracing::debug!("Skipping requisition update for chunk {}: {}", update.chunk_id, e),
            }
        }

        for index in dictionary.values() {
            cluster.store.requisitions_mut().unref_index(*index);
        }
        if applied > 0 {
            tracing::debug!("Requisition update applied: {} chunks from cell {}", applied, request.cell_tag);
        }
        applied
    }

    /// Advances pending chunk list traversals, scheduling a requisition
    /// update for every chunk reached.
    pub fn run_traversals(&mut self, cluster: &mut Cluster) -> usize {
        if !self.leading {
            return 0;
        }
        let pending: Vec<ChunkListId> = cluster
            .store
            .pending_requisition_traversals()
            .iter()
            .copied()
            .filter(|id| !self.traversals.iter().any(|t| t.root == *id) && !self.finished_traversals.contains(id))
            .collect();
        for root in pending {
            tracing::debug!("Requisition traversal started: {}", root);
            self.traversals.push_back(RequisitionTraversal::new(root));
        }

        let mut budget = self.config.max_chunks_per_traversal_step;
        let mut reached = 0;
        while budget > 0 {
            let Some(mut traversal) = self.traversals.pop_front() else {
                break;
            };
            while budget > 0 {
                let Some(node) = traversal.stack.pop() else {
                    break;
                };
                if !traversal.visited.insert(node) {
                    continue;
                }
                match node {
                    ChunkTreeRef::Chunk(id) => {
                        self.schedule_requisition_update(cluster, id);
                        budget -= 1;
                        reached += 1;
                    }
                    ChunkTreeRef::ChunkView(id) => {
                        if let Some(view) = cluster.store.chunk_view(id) {
                            traversal.stack.push(ChunkTreeRef::Chunk(view.chunk));
                        }
                    }
                    ChunkTreeRef::ChunkList(id) => {
                        if let Some(list) = cluster.store.chunk_list(id) {
                            traversal.stack.extend(list.child_refs());
                        }
                    }
                    ChunkTreeRef::DynamicStore(_) => {}
                }
            }
            if traversal.stack.is_empty() {
                tracing::debug!("Requisition traversal finished: {}", traversal.root);
                self.finished_traversals.push(traversal.root);
            } else {
                self.traversals.push_front(traversal);
            }
        }
        reached
    }

    /// Clears the pending marks of finished traversals in the store.
    pub fn flush_finished_traversals(&mut self, cluster: &mut Cluster) -> usize {
        let finished = std::mem::take(&mut self.finished_traversals);
        cluster.store.finish_requisition_traversals(&finished);
        finished.len()
    }

    /// Forgets any traversal of the list so the next step starts over.
    pub fn restart_traversal(&mut self, list: ChunkListId) {
        self.traversals.retain(|traversal| traversal.root != list);
        self.finished_traversals.retain(|id| *id != list);
    }

    /// Re-evaluates whether the replicator may schedule jobs.
    pub fn check_enabled(&mut self, cluster: &Cluster) -> bool {
        let enabled = if !self.config.enable_replicator {
            if self.enabled != Some(false) {
                tracing::info!("Chunk replicator disabled by configuration");
            }
            false
        } else {
            let online = cluster.nodes.online_node_count();
            let lost = self.health.len(HealthSet::LostVital);
            let total = cluster.store.chunk_count();
            if online < self.config.safe_online_node_count {
                if self.enabled != Some(false) {
                    tracing::warn!(
                        "Chunk replicator disabled: too few online nodes: {} < {}",
                        online,
                        self.config.safe_online_node_count
                    );
                }
                false
            } else if lost > self.config.safe_lost_chunk_count {
                if self.enabled != Some(false) {
                    tracing::warn!(
                        "Chunk replicator disabled: too many lost vital chunks: {} > {}",
                        lost,
                        self.config.safe_lost_chunk_count
                    );
                }
                false
            } else if total > 0 && lost as f64 / total as f64 > self.config.safe_lost_chunk_fraction {
                if self.enabled != Some(false) {
                    tracing::warn!(
                        "Chunk replicator disabled: lost vital chunk fraction {:.3} exceeds {}",
                        lost as f64 / total as f64,
                        self.config.safe_lost_chunk_fraction
                    );
                }
                false
            } else {
                if self.enabled != Some(true) {
                    tracing::info!("Chunk replicator enabled");
                }
                true
            }
        };
        self.enabled = Some(enabled);
        enabled
    }

    /// Secondary cells mirror the primary's decision.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != Some(enabled) {
            tracing::info!("Chunk replicator enabled state set by primary: {}", enabled);
        }
        self.enabled = Some(enabled);
    }

    fn has_spare_resources(node: &Node, job_type: JobType) -> bool {
        let (usage, limits) = (node.resource_usage, node.resource_limits);
        match job_type {
            JobType::Replicate | JobType::Balance => {
                usage.replication_slots < limits.replication_slots
                    && (usage.replication_slots == 0 || usage.replication_data_size < limits.replication_data_size)
            }
            JobType::Repair => {
                usage.repair_slots < limits.repair_slots
                    && (usage.repair_slots == 0 || usage.repair_data_size < limits.repair_data_size)
            }
            JobType::Remove => usage.removal_slots < limits.removal_slots,
            JobType::Seal => usage.seal_slots < limits.seal_slots,
        }
    }

    fn node_has_spare(cluster: &Cluster, node: NodeId, job_type: JobType) -> bool {
        cluster
            .nodes
            .node(node)
            .map(|node| Self::has_spare_resources(node, job_type))
            .unwrap_or(false)
    }

    /// Turns the node's queue entries into jobs: replication, repair,
    /// removal, balancing, then sealing. Scheduled jobs are registered with
    /// the tracker.
    pub fn schedule_jobs(&mut self, cluster: &mut Cluster, tracker: &mut JobTracker, node_id: NodeId) -> Vec<Job> {
        let mut scheduled = Vec::new();
        if !self.leading || !self.is_enabled() {
            return scheduled;
        }
        match cluster.nodes.node(node_id) {
            Some(node) if node.is_online() && node.reported_heartbeat => {}
            _ => return scheduled,
        }
        let now = self.clock.now();

        if self.config.enable_replication {
            self.schedule_replication_jobs(cluster, tracker, node_id, now, &mut scheduled);
        }
        if self.config.enable_repair {
            self.schedule_repair_jobs(cluster, tracker, node_id, now, &mut scheduled);
        }
        if self.config.enable_removal {
            self.schedule_removal_jobs(cluster, tracker, node_id, now, &mut scheduled);
        }
        if self.config.enable_balancing {
            self.schedule_balancing_jobs(cluster, tracker, node_id, now, &mut scheduled);
        }
        if self.config.enable_sealing {
            self.schedule_seal_jobs(cluster, tracker, node_id, now, &mut scheduled);
        }

        if !scheduled.is_empty() {
            tracing::debug!("Scheduled {} jobs for node {}", scheduled.len(), node_id);
        }
        scheduled
    }

    fn schedule_replication_jobs(
        &mut self,
        cluster: &mut Cluster,
        tracker: &mut JobTracker,
        node_id: NodeId,
        now: DateTime<Utc>,
        scheduled: &mut Vec<Job>,
    ) {
        let cap = self.config.max_misscheduled_replication_jobs_per_heartbeat;
        let mut misscheduled = 0;
        'priorities: for priority in 0..REPLICATION_PRIORITY_COUNT {
            let entries: Vec<(ChunkPartLocation, MediumSet)> = match cluster.nodes.node(node_id) {
                Some(node) => node.replication_queues[priority].iter().map(|(l, m)| (*l, *m)).collect(),
                None => return,
            };
            for (location, media) in entries {
                if misscheduled >= cap || !Self::node_has_spare(cluster, node_id, JobType::Replicate) {
                    break 'priorities;
                }
                let attempt = self.try_schedule_replication_job(cluster, tracker, node_id, location, media, now);
                let drop_entry = match attempt {
                    Attempt::Scheduled(job) => {
                        tracker.register_job(job.clone(), cluster);
                        scheduled.push(job);
                        true
                    }
                    Attempt::Drop => true,
                    Attempt::Misscheduled => {
                        misscheduled += 1;
                        false
                    }
                };
                if drop_entry {
                    if let Some(node) = cluster.nodes.node_mut(node_id) {
                        node.replication_queues[priority].remove(&location);
                    }
                }
            }
        }
    }

    /// Preferred target from consistent placement for a part that is not
    /// where the ring wants it.
    fn consistent_target(&self, cluster: &Cluster, chunk: &Chunk, medium: MediumIndex, index: ReplicaIndex) -> Option<NodeId> {
        chunk.consistent_placement_hash?;
        if !cluster.placement.config().enable_consistent_placement {
            return None;
        }
        let targets = cluster.consistent_placement.cached_targets(chunk.id, medium)?;
        if chunk.is_erasure() {
            return targets.get(index.as_usize()).copied().filter(|node| !chunk.has_replica_on(*node));
        }
        targets.iter().copied().find(|node| !chunk.has_replica_on(*node))
    }

    fn try_schedule_replication_job(
        &self,
        cluster: &Cluster,
        tracker: &JobTracker,
        node_id: NodeId,
        location: ChunkPartLocation,
        target_media: MediumSet,
        now: DateTime<Utc>,
    ) -> Attempt {
        let Some(chunk) = cluster.store.chunk(location.chunk) else {
            return Attempt::Drop;
        };
        if chunk.job.is_some() || chunk.scan_flag(ScanKind::Refresh, self.epoch) || !chunk.is_sealed() {
            return Attempt::Drop;
        }
        match cluster.nodes.node(node_id) {
            Some(node) if node.has_replica(location) => {}
            _ => return Attempt::Drop,
        }
        let source_dc = cluster.nodes.data_center_of(node_id);
        if !tracker.has_unsaturated_edge_from(source_dc, &cluster.nodes) {
            return Attempt::Misscheduled;
        }

        let statistics = compute_chunk_statistics(cluster, &self.config, chunk);
        let replication = aggregated_replication(&cluster.store, chunk);
        for medium_index in target_media.iter() {
            let Some(stats) = statistics.per_medium.get(&medium_index) else {
                continue;
            };
            if !stats.replication_indexes.contains(&location.replica_index) {
                continue;
            }
            let Some(medium) = cluster.store.medium(medium_index) else {
                continue;
            };
            let factor = replication.get(medium_index).replication_factor;
            let live = stats.replica_count[location.replica_index.as_usize()] as usize;
            let needed = if chunk.is_erasure() || chunk.is_journal() {
                1
            } else {
                (factor as usize).saturating_sub(live).max(1)
            };

            let request = AllocationRequest::new(needed, 1)
                .forbid(tracker.saturated_destinations(source_dc, &cluster.nodes))
                .prefer(self.consistent_target(cluster, chunk, medium_index, location.replica_index));
            let targets = match cluster.placement.allocate_write_targets(&cluster.nodes, medium, chunk, factor, &request) {
                Ok(targets) => targets,
                Err(e) => {
                    tracing::warn!("Replication target allocation failed for chunk {}: {}", chunk.id, e);
                    return Attempt::Misscheduled;
                }
            };
            if targets.is_empty() {
                return Attempt::Misscheduled;
            }
            let targets = targets
                .into_iter()
                .map(|node| ChunkReplica::new(node, location.replica_index, medium_index, ReplicaState::Generic))
                .collect();
            return Attempt::Scheduled(Job::replicate(node_id, location, targets, chunk.info.disk_space, now));
        }
        Attempt::Drop
    }

    fn schedule_repair_jobs(
        &mut self,
        cluster: &mut Cluster,
        tracker: &mut JobTracker,
        node_id: NodeId,
        now: DateTime<Utc>,
        scheduled: &mut Vec<Job>,
    ) {
        let cap = self.config.max_misscheduled_repair_jobs_per_heartbeat;
        let mut misscheduled = 0;
        for kind in [RepairQueueKind::Missing, RepairQueueKind::Decommissioned] {
            let mut exhausted: BTreeSet<MediumIndex> = BTreeSet::new();
            loop {
                if misscheduled >= cap || !Self::node_has_spare(cluster, node_id, JobType::Repair) {
                    return;
                }
                let (queues, balancer) = match kind {
                    RepairQueueKind::Missing => (&self.missing_repair_queues, &mut self.missing_balancer),
                    RepairQueueKind::Decommissioned => {
                        (&self.decommissioned_repair_queues, &mut self.decommissioned_balancer)
                    }
                };
                let winner = balancer.take_winner_if(
                    |medium| {
                        !exhausted.contains(&medium) && queues.get(&medium).map(|q| !q.is_empty()).unwrap_or(false)
                    },
                    now,
                );
                let Some(medium) = winner else {
                    break;
                };

                let mut cursor = None;
                let mut done = false;
                while let Some((seq, location)) = self.repair_queue(kind, medium).and_then(|q| q.next_after(cursor)) {
                    cursor = Some(seq);
                    match self.try_schedule_repair_job(cluster, tracker, node_id, location, kind, now) {
                        Attempt::Scheduled(job) => {
                            self.repair_queue_mut(kind, medium).remove(location);
                            self.balancer_mut(kind).add_weight(medium, job.repair_cost(), now);
                            tracker.register_job(job.clone(), cluster);
                            scheduled.push(job);
                            done = true;
                            break;
                        }
                        Attempt::Drop => {
                            self.repair_queue_mut(kind, medium).remove(location);
                        }
                        Attempt::Misscheduled => {
                            misscheduled += 1;
                            if misscheduled >= cap {
                                return;
                            }
                        }
                    }
                }
                if !done {
                    exhausted.insert(medium);
                }
            }
        }
    }

    fn try_schedule_repair_job(
        &self,
        cluster: &Cluster,
        tracker: &JobTracker,
        node_id: NodeId,
        location: ChunkPartLocation,
        kind: RepairQueueKind,
        now: DateTime<Utc>,
    ) -> Attempt {
        let Some(chunk) = cluster.store.chunk(location.chunk) else {
            return Attempt::Drop;
        };
        if !chunk.is_erasure() || chunk.job.is_some() || chunk.scan_flag(ScanKind::Refresh, self.epoch) {
            return Attempt::Drop;
        }
        let statistics = compute_chunk_statistics(cluster, &self.config, chunk);
        let Some(stats) = statistics.per_medium.get(&location.medium) else {
            return Attempt::Drop;
        };
        if stats.status.contains(ChunkStatus::LOST) {
            return Attempt::Drop;
        }

        let codec = chunk.erasure_codec;
        let decommissioned_only: PartIndexSet = (0..codec.total_part_count())
            .filter(|index| stats.replica_count[*index] == 0 && stats.decommissioned_replica_count[*index] > 0)
            .map(|index| ReplicaIndex(index as u8))
            .collect();
        let mut parts = stats.erased_parts.union(decommissioned_only);
        // Parts still readable from decommissioned nodes can wait.
        for index in decommissioned_only.iter() {
            if codec.can_repair(&parts) {
                break;
            }
            parts.remove(index);
        }
        if parts.is_empty() || !codec.can_repair(&parts) {
            return Attempt::Drop;
        }

        let Some(medium) = cluster.store.medium(location.medium) else {
            return Attempt::Drop;
        };
        let source_dc = cluster.nodes.data_center_of(node_id);
        if !tracker.has_unsaturated_edge_from(source_dc, &cluster.nodes) {
            return Attempt::Misscheduled;
        }
        let factor = aggregated_replication(&cluster.store, chunk).get(location.medium).replication_factor;
        let count = parts.len();
        let request =
            AllocationRequest::new(count, count).forbid(tracker.saturated_destinations(source_dc, &cluster.nodes));
        let targets = match cluster.placement.allocate_write_targets(&cluster.nodes, medium, chunk, factor, &request) {
            Ok(targets) if targets.len() >= count => targets,
            Ok(_) => return Attempt::Misscheduled,
            Err(e) => {
                tracing::warn!("Repair target allocation failed for chunk {}: {}", chunk.id, e);
                return Attempt::Misscheduled;
            }
        };
        let targets = targets
            .into_iter()
            .zip(parts.iter())
            .map(|(node, index)| ChunkReplica::new(node, index, location.medium, ReplicaState::Generic))
            .collect();
        let decommission = kind == RepairQueueKind::Decommissioned;
        Attempt::Scheduled(Job::repair(node_id, location, targets, chunk.info.disk_space, decommission, now))
    }

    fn schedule_removal_jobs(
        &mut self,
        cluster: &mut Cluster,
        tracker: &mut JobTracker,
        node_id: NodeId,
        now: DateTime<Utc>,
        scheduled: &mut Vec<Job>,
    ) {
        let cap = self.config.max_misscheduled_removal_jobs_per_heartbeat;
        let mut misscheduled = 0;
        let entries: Vec<(ChunkPartRef, MediumSet)> = match cluster.nodes.node(node_id) {
            Some(node) => node.removal_queue.iter().map(|(part, media)| (*part, *media)).collect(),
            None => return,
        };
        for (part, media) in entries {
            for medium in media.iter() {
                if misscheduled >= cap || !Self::node_has_spare(cluster, node_id, JobType::Remove) {
                    return;
                }
                let location = part.on_medium(medium);
                let drop_entry = match self.try_schedule_removal_job(cluster, tracker, node_id, location, now) {
                    Attempt::Scheduled(job) => {
                        tracker.register_job(job.clone(), cluster);
                        scheduled.push(job);
                        true
                    }
                    Attempt::Drop => true,
                    Attempt::Misscheduled => {
                        misscheduled += 1;
                        false
                    }
                };
                if drop_entry {
                    if let Some(node) = cluster.nodes.node_mut(node_id) {
                        node.remove_from_removal_queue(part, medium);
                    }
                }
            }
        }
    }

    fn try_schedule_removal_job(
        &self,
        cluster: &Cluster,
        tracker: &JobTracker,
        node_id: NodeId,
        location: ChunkPartLocation,
        now: DateTime<Utc>,
    ) -> Attempt {
        if let Some(chunk) = cluster.store.chunk(location.chunk) {
            if chunk.job.is_some() || chunk.scan_flag(ScanKind::Refresh, self.epoch) {
                return Attempt::Drop;
            }
        }
        let in_progress = tracker
            .jobs_of(node_id)
            .iter()
            .any(|job| job.job_type == JobType::Remove && job.chunk == location);
        if in_progress {
            return Attempt::Drop;
        }
        Attempt::Scheduled(Job::remove(node_id, location, now))
    }

    fn schedule_balancing_jobs(
        &mut self,
        cluster: &mut Cluster,
        tracker: &mut JobTracker,
        node_id: NodeId,
        now: DateTime<Utc>,
        scheduled: &mut Vec<Job>,
    ) {
        let max_jobs = self.config.max_balancing_jobs_per_heartbeat;
        let mut count = 0;
        let media: Vec<(MediumIndex, f64)> = match cluster.nodes.node(node_id) {
            Some(node) => node
                .media
                .keys()
                .filter_map(|medium| node.fill_factor(*medium).map(|fill| (*medium, fill)))
                .collect(),
            None => return,
        };
        for (medium, fill) in media {
            if fill < self.config.min_balancing_fill_factor {
                continue;
            }
            if cluster.store.medium(medium).map(|m| m.cache).unwrap_or(true) {
                continue;
            }
            let max_fill = fill - self.config.min_balancing_fill_factor_diff;
            if !cluster.placement.has_balancing_targets(medium, max_fill) {
                continue;
            }
            let parts = match cluster.nodes.node(node_id) {
                Some(node) => cluster.placement.get_balancing_chunks(node, medium, max_jobs),
                None => return,
            };
            for part in parts {
                if count >= max_jobs || !Self::node_has_spare(cluster, node_id, JobType::Balance) {
                    return;
                }
                let location = part.on_medium(medium);
                if let Attempt::Scheduled(job) =
                    self.try_schedule_balancing_job(cluster, tracker, node_id, location, max_fill, now)
                {
                    tracker.register_job(job.clone(), cluster);
                    scheduled.push(job);
                    count += 1;
                }
            }
        }
    }

    fn try_schedule_balancing_job(
        &self,
        cluster: &Cluster,
        tracker: &JobTracker,
        node_id: NodeId,
        location: ChunkPartLocation,
        max_fill: f64,
        now: DateTime<Utc>,
    ) -> Attempt {
        let Some(chunk) = cluster.store.chunk(location.chunk) else {
            return Attempt::Drop;
        };
        if chunk.job.is_some() || chunk.scan_flag(ScanKind::Refresh, self.epoch) || !chunk.is_sealed() {
            return Attempt::Drop;
        }
        let Some(medium) = cluster.store.medium(location.medium) else {
            return Attempt::Drop;
        };
        let factor = aggregated_replication(&cluster.store, chunk).get(location.medium).replication_factor;
        if factor == 0 {
            return Attempt::Drop;
        }
        let Some(target) = cluster.placement.allocate_balancing_target(&cluster.nodes, medium, chunk, factor, max_fill)
        else {
            return Attempt::Misscheduled;
        };
        let source_dc = cluster.nodes.data_center_of(node_id);
        if !tracker.is_edge_unsaturated(source_dc, cluster.nodes.data_center_of(target)) {
            return Attempt::Misscheduled;
        }
        let target = ChunkReplica::new(target, location.replica_index, location.medium, ReplicaState::Generic);
        Attempt::Scheduled(Job::balance(node_id, location, target, chunk.info.disk_space, now))
    }

    fn schedule_seal_jobs(
        &mut self,
        cluster: &mut Cluster,
        tracker: &mut JobTracker,
        node_id: NodeId,
        now: DateTime<Utc>,
        scheduled: &mut Vec<Job>,
    ) {
        let cap = self.config.max_misscheduled_seal_jobs_per_heartbeat;
        let mut misscheduled = 0;
        let entries: Vec<ChunkPartLocation> = match cluster.nodes.node(node_id) {
            Some(node) => node.seal_queue.iter().copied().collect(),
            None => return,
        };
        for location in entries {
            if misscheduled >= cap || !Self::node_has_spare(cluster, node_id, JobType::Seal) {
                return;
            }
            let drop_entry = match self.try_schedule_seal_job(cluster, node_id, location, now) {
                Attempt::Scheduled(job) => {
                    tracker.register_job(job.clone(), cluster);
                    scheduled.push(job);
                    true
                }
                Attempt::Drop => true,
                Attempt::Misscheduled => {
                    misscheduled += 1;
                    false
                }
            };
            if drop_entry {
                if let Some(node) = cluster.nodes.node_mut(node_id) {
                    node.seal_queue.remove(&location);
                }
            }
        }
    }

    fn try_schedule_seal_job(
        &self,
        cluster: &Cluster,
        node_id: NodeId,
        location: ChunkPartLocation,
        now: DateTime<Utc>,
    ) -> Attempt {
        let Some(chunk) = cluster.store.chunk(location.chunk) else {
            return Attempt::Drop;
        };
        if !chunk.is_journal() || !chunk.is_sealed() || chunk.job.is_some() {
            return Attempt::Drop;
        }
        let unsealed = chunk.stored_replicas.iter().any(|replica| {
            replica.node == node_id
                && replica.medium == location.medium
                && replica.replica_index == location.replica_index
                && !replica.is_sealed()
        });
        if !unsealed {
            return Attempt::Drop;
        }
        Attempt::Scheduled(Job::seal(node_id, location, chunk.info.row_count, now))
    }

    /// Unwinds a node that went away: its replicas, queues and jobs are
    /// dropped and every affected chunk is refreshed.
    pub fn on_node_disposed(&mut self, cluster: &mut Cluster, tracker: &mut JobTracker, node_id: NodeId) {
        let Some(node) = cluster.nodes.node_mut(node_id) else {
            return;
        };
        let replicas: Vec<(ChunkPartLocation, bool)> = node
            .replicas()
            .map(|location| (location, false))
            .chain(node.cached_replicas().map(|location| (location, true)))
            .collect();
        node.clear_replicas();
        node.clear_queues();
        node.pending_endorsements.clear();
        node.state = NodeState::Offline;
        node.reported_heartbeat = false;

        let mut affected: BTreeSet<ChunkId> = BTreeSet::new();
        for (location, cached) in &replicas {
            if let Some(chunk) = cluster.store.chunk_mut(location.chunk) {
                chunk.remove_replica(node_id, location.replica_index, location.medium, *cached);
                if chunk.endorsement_node == Some(node_id) {
                    chunk.endorsement_node = None;
                }
                affected.insert(location.chunk);
            }
        }
        for job in tracker.abort_node_jobs(node_id, cluster) {
            affected.insert(job.chunk.chunk);
        }
        cluster.placement.on_node_removed(node_id);
        affected.extend(cluster.consistent_placement.remove_node(node_id));

        tracing::info!(
            "Node disposed: {} ({} replicas, {} chunks affected)",
            node_id,
            replicas.len(),
            affected.len()
        );
        for chunk in affected {
            self.schedule_chunk_refresh(cluster, chunk);
        }
    }

    /// Unwinds a destroyed chunk: holders forget it and queue its replicas
    /// for removal.
    pub fn on_chunk_destroyed(&mut self, cluster: &mut Cluster, chunk: &Chunk) {
        for replica in &chunk.stored_replicas {
            if let Some(node) = cluster.nodes.node_mut(replica.node) {
                let location = ChunkPartRef::new(chunk.id, replica.replica_index).on_medium(replica.medium);
                node.remove_chunk_from_queues(chunk.id);
                node.remove_replica(location, false);
                if node.reported_heartbeat {
                    node.add_to_removal_queue(location.part(), replica.medium);
                }
            }
        }
        for replica in &chunk.cached_replicas {
            if let Some(node) = cluster.nodes.node_mut(replica.node) {
                let location = ChunkPartRef::new(chunk.id, replica.replica_index).on_medium(replica.medium);
                node.remove_replica(location, true);
            }
        }
        for queues in [&mut self.missing_repair_queues, &mut self.decommissioned_repair_queues] {
            for (medium, queue) in queues.iter_mut() {
                queue.remove(ChunkPartRef::new(chunk.id, ReplicaIndex::GENERIC).on_medium(*medium));
            }
        }
        self.health.reset(chunk.id);
        self.seal_candidates.remove(&chunk.id);
        cluster.consistent_placement.unregister_chunk(chunk.id);
    }

    /// Abandoned journal chunks awaiting a seal, oldest id first.
    pub fn seal_candidates(&mut self, cluster: &Cluster, max_count: usize) -> Vec<SealCandidate> {
        self.seal_candidates.retain(|id| {
            cluster
                .store
                .chunk(*id)
                .map(|chunk| chunk.is_journal() && chunk.confirmed && chunk.sealable && !chunk.sealed)
                .unwrap_or(false)
        });
        self.seal_candidates
            .iter()
            .take(max_count)
            .filter_map(|id| cluster.store.chunk(*id))
            .map(|chunk| SealCandidate {
                chunk_id: chunk.id,
                read_quorum: chunk.read_quorum,
                replicas: chunk
                    .stored_replicas
                    .iter()
                    .filter_map(|replica| cluster.nodes.node(replica.node))
                    .map(|node| WriteTarget {
                        node_id: node.id,
                        address: node.address.clone(),
                    })
                    .collect(),
            })
            .collect()
    }

    pub fn on_chunk_sealed(&mut self, cluster: &mut Cluster, chunk: ChunkId) {
        self.seal_candidates.remove(&chunk);
        self.schedule_chunk_refresh(cluster, chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::JobStatusReport;
    use crate::{JobState, ManualClock};
    use model::{
        AccountId, CellTag, ChunkInfo, ChunkKind, ChunkListKind, ChunkOwner, CreateChunkSpec, ErasureCodec,
        MediumConfig, NodeMediumStatistics, NodeResources, Replication,
    };
    use placement::PlacementConfig;

    const DEFAULT: MediumIndex = MediumIndex(0);

    struct Fixture {
        cluster: Cluster,
        replicator: ChunkReplicator,
        tracker: JobTracker,
        nodes: Vec<NodeId>,
    }

    fn config() -> ReplicatorConfig {
        ReplicatorConfig {
            chunk_refresh_delay_ms: 0,
            ..ReplicatorConfig::default()
        }
    }

    fn limits() -> NodeResources {
        NodeResources {
            replication_slots: 4,
            replication_data_size: 1 << 30,
            repair_slots: 4,
            repair_data_size: 1 << 30,
            removal_slots: 16,
            seal_slots: 4,
        }
    }

    fn fixture(node_count: u32) -> Fixture {
        let mut cluster = Cluster::new(ChunkStore::new(CellTag(1)), PlacementConfig::default());
        let mut nodes = Vec::new();
        for i in 0..node_count {
            let id = cluster.nodes.register_node(&format!("node-{}:9012", i));
            let rack = cluster.nodes.get_or_create_rack(&format!("rack-{}", i), None);
            cluster.nodes.set_node_rack(id, Some(rack)).unwrap();
            let node = cluster.nodes.node_mut(id).unwrap();
            node.state = NodeState::Online;
            node.reported_heartbeat = true;
            node.resource_limits = limits();
            node.media.insert(
                DEFAULT,
                NodeMediumStatistics {
                    total_space: 1 << 40,
                    used_space: (i as i64 + 1) << 20,
                    session_count: 0,
                },
            );
            cluster.update_node_placement(id);
            nodes.push(id);
        }
        let config = config();
        let tracker = JobTracker::new(&config);
        let mut replicator = ChunkReplicator::new(config, Arc::new(ManualClock::default()));
        replicator.on_leading_started(&mut cluster);
        replicator.check_enabled(&cluster);
        Fixture {
            cluster,
            replicator,
            tracker,
            nodes,
        }
    }

    impl Fixture {
        fn create_chunk(&mut self, codec: ErasureCodec, factor: u8) -> ChunkId {
            let id = self
                .cluster
                .store
                .create_chunk(CreateChunkSpec {
                    id: ChunkId::new(),
                    kind: ChunkKind::Blob,
                    erasure_codec: codec,
                    account: AccountId::new("tmp"),
                    replication: Replication::new(true).with_policy(DEFAULT, factor),
                    transaction: None,
                    read_quorum: 0,
                    write_quorum: 0,
                    consistent_placement_hash: None,
                    endorsement_required: false,
                })
                .unwrap();
            self.cluster.store.confirm_chunk(id, ChunkInfo::default()).unwrap();
            id
        }

        fn add_replica(&mut self, chunk: ChunkId, node: NodeId, index: u8) {
            let replica = ChunkReplica::new(node, ReplicaIndex(index), DEFAULT, ReplicaState::Generic);
            self.cluster.store.chunk_mut(chunk).unwrap().add_replica(replica, false);
            self.cluster.nodes.node_mut(node).unwrap().add_replica(&replica, chunk, false);
        }

        fn refresh(&mut self, chunk: ChunkId) {
            self.replicator.refresh_chunk(&mut self.cluster, chunk);
        }

        fn schedule(&mut self, node: NodeId) -> Vec<Job> {
            self.replicator.schedule_jobs(&mut self.cluster, &mut self.tracker, node)
        }

        fn set_owner(&mut self, list: ChunkListId, name: &str, replication: Replication) {
            let owner = ChunkOwner {
                name: name.to_string(),
                account: AccountId::new("tmp"),
                replication,
            };
            self.cluster.store.set_owner(list, owner).unwrap();
        }

        fn run_requisition_round(&mut self) -> Vec<(CellTag, RequisitionUpdateRequest)> {
            self.replicator.run_traversals(&mut self.cluster);
            self.replicator.flush_finished_traversals(&mut self.cluster);
            self.replicator.run_requisition_update(&mut self.cluster)
        }

        /// Every queue entry and health set membership, for comparing refreshes.
        fn queue_state(&self) -> Vec<String> {
            let mut state = Vec::new();
            for node in &self.nodes {
                let node = self.cluster.nodes.node(*node).unwrap();
                state.push(format!(
                    "{} {:?} {:?} {:?}",
                    node.id, node.replication_queues, node.removal_queue, node.seal_queue
                ));
            }
            for set in HealthSet::ALL {
                state.push(format!("{:?} {:?}", set, self.replicator.health().members(set)));
            }
            for kind in [RepairQueueKind::Missing, RepairQueueKind::Decommissioned] {
                let queue = self.replicator.repair_queue(kind, DEFAULT);
                state.push(format!("{:?} {:?}", kind, queue.map(|q| q.len())));
            }
            state
        }
    }

    #[test]
    fn test_underreplicated_chunk_gets_replication_job() {
        let mut f = fixture(4);
        let chunk = f.create_chunk(ErasureCodec::None, 3);
        let source = f.nodes[0];
        f.add_replica(chunk, source, 0);
        f.refresh(chunk);

        assert!(f.replicator.health().contains(HealthSet::Underreplicated, chunk));
        let node = f.cluster.nodes.node(source).unwrap();
        assert_eq!(node.replication_queues[0].len(), 1);

        let jobs = f.schedule(source);
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.job_type, JobType::Replicate);
        assert_eq!(job.targets.len(), 2);
        assert!(job.targets.iter().all(|target| target.node != source));
        assert_eq!(f.cluster.store.chunk(chunk).unwrap().job, Some(job.id));
        assert_eq!(f.cluster.nodes.node(source).unwrap().replication_queue_depth(), 0);
    }

    #[test]
    fn test_chunk_with_running_job_gets_no_second_job() {
        let mut f = fixture(4);
        let chunk = f.create_chunk(ErasureCodec::None, 3);
        let (a, b) = (f.nodes[0], f.nodes[1]);
        f.add_replica(chunk, a, 0);
        f.add_replica(chunk, b, 0);
        f.refresh(chunk);

        assert_eq!(f.schedule(a).len(), 1);
        // The second holder's queue entry is stale now.
        assert!(f.schedule(b).is_empty());
        assert_eq!(f.tracker.len(), 1);
    }

    #[test]
    fn test_overreplicated_chunk_is_trimmed_on_most_filled_node() {
        let mut f = fixture(4);
        let chunk = f.create_chunk(ErasureCodec::None, 2);
        for node in f.nodes.clone().into_iter().take(3) {
            f.add_replica(chunk, node, 0);
        }
        f.refresh(chunk);
        assert!(f.replicator.health().contains(HealthSet::Overreplicated, chunk));

        // Fill grows with the node's position in the fixture.
        let victim = f.nodes[2];
        let jobs = f.schedule(victim);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::Remove);
        assert!(f.schedule(f.nodes[0]).is_empty());
    }

    #[test]
    fn test_erasure_chunk_with_missing_part_is_repaired() {
        let mut f = fixture(10);
        let chunk = f.create_chunk(ErasureCodec::ReedSolomon6_3, 1);
        for index in 1..9u8 {
            f.add_replica(chunk, f.nodes[index as usize], index);
        }
        f.refresh(chunk);
        assert!(f.replicator.health().contains(HealthSet::DataMissing, chunk));
        assert_eq!(f.replicator.repair_queue(RepairQueueKind::Missing, DEFAULT).map(|q| q.len()), Some(1));

        let jobs = f.schedule(f.nodes[9]);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::Repair);
        assert_eq!(jobs[0].erased_parts, vec![ReplicaIndex(0)]);
        assert!(!jobs[0].decommission);
        assert_eq!(f.replicator.repair_queue(RepairQueueKind::Missing, DEFAULT).map(|q| q.len()), Some(0));
    }

    #[test]
    fn test_disabled_replicator_schedules_nothing() {
        let mut f = fixture(4);
        let mut config = config();
        config.enable_replicator = false;
        f.replicator.set_config(config);
        assert!(!f.replicator.check_enabled(&f.cluster));

        let chunk = f.create_chunk(ErasureCodec::None, 3);
        f.add_replica(chunk, f.nodes[0], 0);
        f.refresh(chunk);
        assert!(f.schedule(f.nodes[0]).is_empty());
        // Queues keep accumulating while disabled.
        assert_eq!(f.cluster.nodes.node(f.nodes[0]).unwrap().replication_queue_depth(), 1);
    }

    #[test]
    fn test_too_few_online_nodes_disable_replicator() {
        let mut f = fixture(2);
        let mut config = config();
        config.safe_online_node_count = 3;
        f.replicator.set_config(config);
        assert!(!f.replicator.check_enabled(&f.cluster));
        assert_eq!(f.replicator.enabled(), Some(false));
    }

    #[test]
    fn test_owner_change_produces_requisition_update() {
        let mut f = fixture(3);
        let chunk = f.create_chunk(ErasureCodec::None, 3);
        let list = ChunkListId::new();
        f.cluster.store.create_chunk_list(list, ChunkListKind::Static).unwrap();
        f.cluster.store.attach_to_chunk_list(list, &[ChunkTreeRef::Chunk(chunk)]).unwrap();
        f.cluster
            .store
            .set_owner(
                list,
                ChunkOwner {
                    name: "table".to_string(),
                    account: AccountId::new("tmp"),
                    replication: Replication::new(true).with_policy(DEFAULT, 2),
                },
            )
            .unwrap();

        assert_eq!(f.replicator.run_traversals(&mut f.cluster), 1);
        assert_eq!(f.replicator.flush_finished_traversals(&mut f.cluster), 1);
        assert!(f.cluster.store.pending_requisition_traversals().is_empty());

        let batches = f.replicator.run_requisition_update(&mut f.cluster);
        assert_eq!(batches.len(), 1);
        let (cell, request) = &batches[0];
        assert_eq!(*cell, CellTag(1));
        assert_eq!(request.updates.len(), 1);

        assert_eq!(f.replicator.apply_requisition_update(&mut f.cluster, request), 1);
        let chunk = f.cluster.store.chunk(chunk).unwrap();
        assert_eq!(aggregated_replication(&f.cluster.store, chunk).get(DEFAULT).replication_factor, 2);

        // A second pass finds nothing to change.
        let id = chunk.id;
        f.replicator.schedule_requisition_update(&mut f.cluster, id);
        assert!(f.replicator.run_requisition_update(&mut f.cluster).is_empty());
    }

    #[test]
    fn test_node_disposal_drops_replicas_and_jobs() {
        let mut f = fixture(4);
        let chunk = f.create_chunk(ErasureCodec::None, 3);
        let source = f.nodes[0];
        f.add_replica(chunk, source, 0);
        f.refresh(chunk);
        assert_eq!(f.schedule(source).len(), 1);

        f.replicator.on_node_disposed(&mut f.cluster, &mut f.tracker, source);
        assert!(f.tracker.is_empty());
        let stored = &f.cluster.store.chunk(chunk).unwrap().stored_replicas;
        assert!(stored.is_empty());
        assert_eq!(f.cluster.nodes.node(source).unwrap().state, NodeState::Offline);

        f.replicator.run_refresh(&mut f.cluster);
        assert!(f.replicator.health().contains(HealthSet::Lost, chunk));
        assert!(f.replicator.health().contains(HealthSet::LostVital, chunk));
    }

    #[test]
    fn test_completed_job_allows_next_one() {
        let mut f = fixture(4);
        let chunk = f.create_chunk(ErasureCodec::None, 3);
        let source = f.nodes[0];
        f.add_replica(chunk, source, 0);
        f.refresh(chunk);
        let job = f.schedule(source).remove(0);

        let report = JobStatusReport {
            job_id: job.id,
            state: JobState::Completed,
            error: None,
        };
        let now = Utc::now();
        let result = f.tracker.process_jobs(source, &[report], now, &mut f.cluster);
        assert_eq!(result.finished.len(), 1);
        assert_eq!(f.cluster.store.chunk(chunk).unwrap().job, None);
    }

    #[test]
    fn test_destroyed_chunk_replicas_are_queued_for_removal() {
        let mut f = fixture(3);
        let chunk = f.create_chunk(ErasureCodec::None, 1);
        let holder = f.nodes[1];
        f.add_replica(chunk, holder, 0);
        let destroyed = f.cluster.store.destroy_chunk(chunk).unwrap();
        f.replicator.on_chunk_destroyed(&mut f.cluster, &destroyed);

        let node = f.cluster.nodes.node(holder).unwrap();
        assert_eq!(node.replica_count(), 0);
        assert_eq!(node.removal_queue.len(), 1);
        let jobs = f.schedule(holder);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::Remove);
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let mut f = fixture(10);
        let under = f.create_chunk(ErasureCodec::None, 3);
        f.add_replica(under, f.nodes[0], 0);
        let over = f.create_chunk(ErasureCodec::None, 1);
        f.add_replica(over, f.nodes[1], 0);
        f.add_replica(over, f.nodes[2], 0);
        let erasure = f.create_chunk(ErasureCodec::ReedSolomon6_3, 1);
        for index in 1..9u8 {
            f.add_replica(erasure, f.nodes[index as usize], index);
        }

        for chunk in [under, over, erasure] {
            f.refresh(chunk);
        }
        let first = f.queue_state();
        for chunk in [under, over, erasure] {
            f.refresh(chunk);
        }
        assert_eq!(f.queue_state(), first);
        assert!(f.replicator.health().contains(HealthSet::Underreplicated, under));
        assert!(f.replicator.health().contains(HealthSet::Overreplicated, over));
        assert_eq!(f.replicator.repair_queue(RepairQueueKind::Missing, DEFAULT).map(|q| q.len()), Some(1));
    }

    #[test]
    fn test_missing_parts_are_repaired_before_decommissioned_ones() {
        let mut f = fixture(12);
        let decommissioned = f.create_chunk(ErasureCodec::ReedSolomon6_3, 1);
        for index in 0..9u8 {
            f.add_replica(decommissioned, f.nodes[index as usize], index);
        }
        let retiring = f.nodes[0];
        f.cluster.nodes.node_mut(retiring).unwrap().decommissioned = true;
        f.cluster.update_node_placement(retiring);

        let missing = f.create_chunk(ErasureCodec::ReedSolomon6_3, 1);
        for index in 1..9u8 {
            f.add_replica(missing, f.nodes[index as usize], index);
        }

        // Queued first, still served second.
        f.refresh(decommissioned);
        f.refresh(missing);
        assert_eq!(f.replicator.repair_queue(RepairQueueKind::Decommissioned, DEFAULT).map(|q| q.len()), Some(1));
        assert_eq!(f.replicator.repair_queue(RepairQueueKind::Missing, DEFAULT).map(|q| q.len()), Some(1));

        let repairs: Vec<Job> = f
            .schedule(f.nodes[11])
            .into_iter()
            .filter(|job| job.job_type == JobType::Repair)
            .collect();
        assert_eq!(repairs.len(), 2);
        assert_eq!(repairs[0].chunk.chunk, missing);
        assert!(!repairs[0].decommission);
        assert_eq!(repairs[1].chunk.chunk, decommissioned);
        assert!(repairs[1].decommission);
    }

    #[test]
    fn test_ancestor_owners_spread_requisition_over_media() {
        let mut f = fixture(4);
        let ssd = f.cluster.store.create_medium("ssd", MediumConfig::default()).unwrap();
        let chunk = f.create_chunk(ErasureCodec::None, 3);
        let (parent, grandparent) = (ChunkListId::new(), ChunkListId::new());
        for list in [parent, grandparent] {
            f.cluster.store.create_chunk_list(list, ChunkListKind::Static).unwrap();
        }
        f.cluster.store.attach_to_chunk_list(parent, &[ChunkTreeRef::Chunk(chunk)]).unwrap();
        f.cluster
            .store
            .attach_to_chunk_list(grandparent, &[ChunkTreeRef::ChunkList(parent)])
            .unwrap();
        f.set_owner(grandparent, "table", Replication::new(true).with_policy(DEFAULT, 3));
        for (_, request) in f.run_requisition_round() {
            f.replicator.apply_requisition_update(&mut f.cluster, &request);
        }
        let replication = aggregated_replication(&f.cluster.store, f.cluster.store.chunk(chunk).unwrap());
        assert_eq!(replication.get(DEFAULT).replication_factor, 3);
        assert!(!replication.contains(ssd));

        f.set_owner(parent, "nested", Replication::new(true).with_policy(DEFAULT, 2));
        f.set_owner(grandparent, "table", Replication::new(true).with_policy(ssd, 1));
        let batches = f.run_requisition_round();
        assert_eq!(batches.len(), 1);
        let (_, request) = &batches[0];
        assert_eq!(request.updates.len(), 1);
        assert_eq!(request.updates[0].chunk_id, chunk);

        assert_eq!(f.replicator.apply_requisition_update(&mut f.cluster, request), 1);
        let replication = aggregated_replication(&f.cluster.store, f.cluster.store.chunk(chunk).unwrap());
        assert_eq!(replication.get(DEFAULT).replication_factor, 2);
        assert_eq!(replication.get(ssd).replication_factor, 1);
        assert!(f.run_requisition_round().is_empty());
    }
}
