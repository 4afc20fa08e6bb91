use std::collections::BTreeSet;
use std::sync::Arc;

use model::{
    CellTag, ChunkId, ChunkListId, ChunkReplica, ChunkStore, ChunkTreeRef, NodeId, NodeState, ReplicaState,
};
use placement::{AllocationRequest, NodeInvalidityReasons, PlacementConfig};

use crate::health::HealthSet;
use crate::messages::*;
use crate::{
    aggregated_replication, compute_chunk_statistics, ChunkReplicator, Clock, Cluster, Job, JobTracker, JobType,
    ReplicatorConfig, ReplicatorError, Result,
};

/// Owner of all chunk server state. Every mutation is one call on this
/// struct; callers serialize them, so no step observes another half done.
#[derive(Debug)]
pub struct ChunkAutomaton {
    cluster: Cluster,
    replicator: ChunkReplicator,
    job_tracker: JobTracker,
    clock: Arc<dyn Clock>,
}

impl ChunkAutomaton {
    pub fn new(
        store: ChunkStore,
        placement_config: PlacementConfig,
        replicator_config: ReplicatorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let job_tracker = JobTracker::new(&replicator_config);
        Self {
            cluster: Cluster::new(store, placement_config),
            replicator: ChunkReplicator::new(replicator_config, clock.clone()),
            job_tracker,
            clock,
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn replicator(&self) -> &ChunkReplicator {
        &self.replicator
    }

    pub fn job_tracker(&self) -> &JobTracker {
        &self.job_tracker
    }

    pub fn store(&self) -> &ChunkStore {
        &self.cluster.store
    }

    pub fn is_leading(&self) -> bool {
        self.replicator.is_leading()
    }

    fn ensure_leading(&self) -> Result<()> {
        if self.replicator.is_leading() {
            Ok(())
        } else {
            Err(ReplicatorError::NotLeader)
        }
    }

    pub fn start_leading(&mut self) {
        self.job_tracker.clear(&mut self.cluster);
        self.replicator.on_leading_started(&mut self.cluster);
        self.replicator.check_enabled(&self.cluster);
    }

    pub fn stop_leading(&mut self) {
        self.job_tracker.clear(&mut self.cluster);
        self.replicator.on_leading_finished(&mut self.cluster);
    }

    pub fn set_replicator_config(&mut self, config: ReplicatorConfig) {
        self.job_tracker.set_config(&config, &self.cluster.nodes);
        self.replicator.set_config(config);
    }

    pub fn set_placement_config(&mut self, config: PlacementConfig) {
        self.cluster.placement.set_config(config);
        for id in self.cluster.nodes.node_ids() {
            self.cluster.update_node_placement(id);
        }
    }

    fn schedule_refresh_of(&mut self, chunks: impl IntoIterator<Item = ChunkId>) {
        for chunk in chunks {
            self.replicator.schedule_chunk_refresh(&mut self.cluster, chunk);
        }
    }

    fn node_chunks(&self, node: NodeId) -> BTreeSet<ChunkId> {
        self.cluster
            .nodes
            .node(node)
            .map(|node| node.replicas().map(|location| location.chunk).collect())
            .unwrap_or_default()
    }

    /// Re-keys the node in the placement indexes and brings its consistent
    /// placement membership in line with its flags.
    fn sync_node_placement(&mut self, node_id: NodeId) {
        self.cluster.update_node_placement(node_id);
        let Some(node) = self.cluster.nodes.node(node_id) else {
            return;
        };
        let affected = if !self.cluster.consistent_placement.is_member(node_id) {
            if node.is_online() {
                self.cluster.consistent_placement.add_node(node, self.cluster.store.media())
            } else {
                Vec::new()
            }
        } else {
            let reasons = NodeInvalidityReasons::of(node);
            let mut affected = Vec::new();
            for reason in [
                NodeInvalidityReasons::DECOMMISSIONED,
                NodeInvalidityReasons::WRITE_SESSIONS_DISABLED,
                NodeInvalidityReasons::NO_HEARTBEAT,
            ] {
                affected.extend(self.cluster.consistent_placement.set_node_validity(
                    node_id,
                    reason,
                    reasons.contains(reason),
                ));
            }
            affected
        };
        self.schedule_refresh_of(affected);
    }

    pub fn register_node(&mut self, request: RegisterNodeRequest) -> Result<RegisterNodeResponse> {
        self.ensure_leading()?;
        if request.address.is_empty() {
            return Err(ReplicatorError::InvalidRequest("node address must not be empty".to_string()));
        }
        if let Some(existing) = self.cluster.nodes.find_by_address(&request.address) {
            let id = existing.id;
            if existing.state != NodeState::Registered {
                tracing::info!("Node {} re-registered, disposing previous incarnation", id);
                self.replicator.on_node_disposed(&mut self.cluster, &mut self.job_tracker, id);
            }
        }

        let id = self.cluster.nodes.register_node(&request.address);
        let rack = request
            .rack
            .as_deref()
            .map(|rack| self.cluster.nodes.get_or_create_rack(rack, request.data_center.as_deref()));
        self.cluster.nodes.set_node_rack(id, rack)?;
        let node = self.cluster.nodes.get_mut(id)?;
        node.state = NodeState::Registered;
        node.reported_heartbeat = false;
        node.consistent_placement_token_count = request.consistent_placement_token_count;
        self.cluster.update_node_placement(id);
        Ok(RegisterNodeResponse { node_id: id })
    }

    fn apply_media_reports(&mut self, node_id: NodeId, media: &[MediumReport]) -> Result<()> {
        let node = self.cluster.nodes.get_mut(node_id)?;
        for report in media {
            let stats = node.media.entry(report.medium).or_default();
            stats.total_space = report.total_space;
            stats.used_space = report.used_space;
            stats.session_count = report.session_count;
        }
        Ok(())
    }

    /// Adds a reported replica to the chunk and node. Returns false when
    /// the chunk is unknown.
    fn add_reported_replica(&mut self, node_id: NodeId, report: &ReplicaReport) -> bool {
        let replica = ChunkReplica::new(node_id, report.replica_index, report.medium, report.state);
        let Some(chunk) = self.cluster.store.chunk_mut(report.chunk_id) else {
            return false;
        };
        let replica = if chunk.is_journal() {
            replica
        } else {
            ChunkReplica::new(node_id, report.replica_index, report.medium, ReplicaState::Generic)
        };
        chunk.add_replica(replica, report.cached);
        if let Some(node) = self.cluster.nodes.node_mut(node_id) {
            node.add_replica(&replica, report.chunk_id, report.cached);
        }
        true
    }

    fn remove_reported_replica(&mut self, node_id: NodeId, report: &ReplicaReport) {
        if let Some(chunk) = self.cluster.store.chunk_mut(report.chunk_id) {
            chunk.remove_replica(node_id, report.replica_index, report.medium, report.cached);
        }
        if let Some(node) = self.cluster.nodes.node_mut(node_id) {
            let location = model::ChunkPartRef::new(report.chunk_id, report.replica_index).on_medium(report.medium);
            node.remove_replica(location, report.cached);
        }
    }

    /// First heartbeat of a node: the full replica inventory.
    pub fn full_heartbeat(&mut self, request: FullHeartbeatRequest) -> Result<FullHeartbeatResponse> {
        self.ensure_leading()?;
        let node_id = request.node_id;
        let state = self.cluster.nodes.get(node_id)?.state;
        if state == NodeState::Online {
            tracing::warn!("Full heartbeat from online node {}, disposing previous inventory", node_id);
            self.replicator.on_node_disposed(&mut self.cluster, &mut self.job_tracker, node_id);
        }

        self.apply_media_reports(node_id, &request.media)?;
        let now = self.clock.now();
        let node = self.cluster.nodes.get_mut(node_id)?;
        node.resource_limits = request.resource_limits;
        node.state = NodeState::Online;
        node.reported_heartbeat = true;
        node.last_heartbeat = Some(now);

        let mut unknown = Vec::new();
        let mut touched = BTreeSet::new();
        for report in &request.replicas {
            if self.add_reported_replica(node_id, report) {
                touched.insert(report.chunk_id);
            } else {
                unknown.push(report.chunk_id);
            }
        }
        self.sync_node_placement(node_id);
        self.schedule_refresh_of(touched.iter().copied());

        tracing::info!(
            "Full heartbeat processed: node {}, {} replicas, {} unknown",
            node_id,
            touched.len(),
            unknown.len()
        );
        Ok(FullHeartbeatResponse {
            announce_replicas: self.replicator.endorsed_chunks(&self.cluster, node_id),
            unknown_chunks: unknown,
        })
    }

    /// Regular heartbeat: replica deltas, job reports and new jobs.
    pub fn incremental_heartbeat(&mut self, request: IncrementalHeartbeatRequest) -> Result<IncrementalHeartbeatResponse> {
        self.ensure_leading()?;
        let node_id = request.node_id;
        let node = self.cluster.nodes.get(node_id)?;
        if !node.is_online() || !node.reported_heartbeat {
            return Err(ReplicatorError::InvalidRequest(format!(
                "node {} must send a full heartbeat first",
                node_id
            )));
        }

        self.apply_media_reports(node_id, &request.media)?;
        let now = self.clock.now();
        let node = self.cluster.nodes.get_mut(node_id)?;
        node.last_heartbeat = Some(now);
        if let Some(limits) = request.resource_limits {
            node.resource_limits = limits;
        }

        let mut touched = BTreeSet::new();
        for report in &request.added_replicas {
            if self.add_reported_replica(node_id, report) {
                touched.insert(report.chunk_id);
            } else if let Some(node) = self.cluster.nodes.node_mut(node_id) {
                // Replicas of unknown chunks are garbage.
                node.add_to_removal_queue(
                    model::ChunkPartRef::new(report.chunk_id, report.replica_index),
                    report.medium,
                );
            }
        }
        for report in &request.removed_replicas {
            self.remove_reported_replica(node_id, report);
            touched.insert(report.chunk_id);
        }

        let reconciliation = self.job_tracker.process_jobs(node_id, &request.jobs, now, &mut self.cluster);
        touched.extend(reconciliation.finished.iter().map(|job| job.chunk.chunk));
        self.schedule_refresh_of(touched);

        self.cluster.update_node_placement(node_id);
        let jobs = self.replicator.schedule_jobs(&mut self.cluster, &mut self.job_tracker, node_id);
        let jobs_to_start = jobs.iter().map(|job| self.job_spec(job)).collect();
        let announce_replicas = self.replicator.take_announcements(&mut self.cluster, node_id);
        let disable_write_sessions = self.cluster.nodes.get(node_id)?.disable_write_sessions;

        Ok(IncrementalHeartbeatResponse {
            jobs_to_start,
            jobs_to_abort: reconciliation.to_abort,
            jobs_to_remove: reconciliation.to_remove,
            announce_replicas,
            disable_write_sessions,
        })
    }

    fn job_spec(&self, job: &Job) -> JobSpec {
        let targets = job
            .targets
            .iter()
            .map(|target| JobTarget {
                node_id: target.node,
                address: self
                    .cluster
                    .nodes
                    .node(target.node)
                    .map(|node| node.address.clone())
                    .unwrap_or_default(),
                replica_index: target.replica_index,
                medium: target.medium,
            })
            .collect();
        JobSpec {
            job_id: job.id,
            job_type: job.job_type,
            chunk_id: job.chunk.chunk,
            replica_index: job.chunk.replica_index,
            medium: job.chunk.medium,
            targets,
            erased_parts: job.erased_parts.clone(),
            row_count: job.row_count,
            decommission: job.decommission,
            data_size: job.data_size,
        }
    }

    /// Picks nodes for a client write session.
    pub fn allocate_write_targets(&self, request: &AllocateWriteTargetsRequest) -> Result<AllocateWriteTargetsResponse> {
        self.ensure_leading()?;
        let chunk = self
            .cluster
            .store
            .chunk(request.chunk_id)
            .ok_or(ReplicatorError::NoSuchChunk(request.chunk_id))?;
        let medium = self.cluster.store.medium_by_name(&request.medium)?;
        let factor = match request.replication_factor_override {
            Some(factor) => factor,
            None => aggregated_replication(&self.cluster.store, chunk)
                .get(medium.index)
                .replication_factor
                .max(1),
        };

        let forbidden: Vec<NodeId> = request
            .forbidden_addresses
            .iter()
            .filter_map(|address| self.cluster.nodes.find_by_address(address))
            .map(|node| node.id)
            .collect();
        let preferred = request
            .preferred_address
            .as_deref()
            .and_then(|address| self.cluster.nodes.find_by_address(address))
            .map(|node| node.id);
        let consistent = chunk.consistent_placement_hash.filter(|_| {
            self.cluster.placement.config().enable_consistent_placement && !medium.cache
        });

        let targets = match consistent {
            Some(hash) => {
                let count = request.desired_count.max(1);
                self.cluster
                    .consistent_placement
                    .get_write_targets(hash, medium.index, count)
                    .into_iter()
                    .filter(|node| !forbidden.contains(node))
                    .collect()
            }
            None => {
                let mut allocation = AllocationRequest::new(request.desired_count, request.min_count)
                    .forbid(forbidden)
                    .prefer(preferred);
                allocation.replication_factor_override = request.replication_factor_override;
                self.cluster
                    .placement
                    .allocate_write_targets(&self.cluster.nodes, medium, chunk, factor, &allocation)?
            }
        };
        if targets.len() < request.min_count || targets.is_empty() {
            return Err(ReplicatorError::NotEnoughTargets {
                found: targets.len(),
                needed: request.min_count.max(1),
            });
        }

        let targets = targets
            .into_iter()
            .filter_map(|id| self.cluster.nodes.node(id))
            .map(|node| WriteTarget {
                node_id: node.id,
                address: node.address.clone(),
            })
            .collect();
        Ok(AllocateWriteTargetsResponse { targets })
    }

    /// Applies every subrequest in order; a failing subrequest does not
    /// undo the ones before it.
    pub fn execute_batch(&mut self, request: BatchRequest) -> Result<BatchResponse> {
        self.ensure_leading()?;
        let subresponses = request
            .subrequests
            .into_iter()
            .map(|subrequest| match self.execute_subrequest(subrequest) {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!("Batch subrequest failed: {}", e);
                    BatchSubresponse::failed(e)
                }
            })
            .collect();
        Ok(BatchResponse { subresponses })
    }

    fn schedule_tree_update(&mut self, node: ChunkTreeRef) {
        match node {
            ChunkTreeRef::Chunk(id) => self.replicator.schedule_requisition_update(&mut self.cluster, id),
            ChunkTreeRef::ChunkList(id) => {
                self.cluster.store.add_pending_requisition_traversal(id);
                self.replicator.restart_traversal(id);
            }
            ChunkTreeRef::ChunkView(id) => {
                if let Some(chunk) = self.cluster.store.chunk_view(id).map(|view| view.chunk) {
                    self.replicator.schedule_requisition_update(&mut self.cluster, chunk);
                }
            }
            ChunkTreeRef::DynamicStore(_) => {}
        }
    }

    fn execute_subrequest(&mut self, subrequest: BatchSubrequest) -> Result<BatchSubresponse> {
        match subrequest {
            BatchSubrequest::CreateChunk(spec) => {
                let id = self.cluster.store.create_chunk(spec)?;
                Ok(BatchSubresponse {
                    chunk_id: Some(id),
                    ..BatchSubresponse::ok()
                })
            }
            BatchSubrequest::ConfirmChunk { chunk_id, info, replicas } => {
                self.cluster.store.confirm_chunk(chunk_id, info)?;
                for replica in replicas {
                    let report = ReplicaReport {
                        chunk_id,
                        replica_index: replica.replica_index,
                        medium: replica.medium,
                        state: replica.state,
                        cached: false,
                    };
                    if self.cluster.nodes.node(replica.node_id).is_some() {
                        self.add_reported_replica(replica.node_id, &report);
                    }
                }
                self.replicator.schedule_chunk_refresh(&mut self.cluster, chunk_id);
                self.replicator.schedule_requisition_update(&mut self.cluster, chunk_id);
                Ok(BatchSubresponse::ok())
            }
            BatchSubrequest::SealChunk { chunk_id, row_count } => {
                self.seal_chunk(chunk_id, row_count)?;
                Ok(BatchSubresponse::ok())
            }
            BatchSubrequest::MarkSealable { chunk_id } => {
                let chunk = self.cluster.store.get_chunk_mut(chunk_id)?;
                if !chunk.is_journal() {
                    return Err(model::ModelError::NotJournalChunk(chunk_id).into());
                }
                if !chunk.confirmed {
                    return Err(model::ModelError::ChunkNotConfirmed(chunk_id).into());
                }
                if !chunk.sealed {
                    chunk.sealable = true;
                    self.replicator.schedule_seal(chunk_id);
                }
                Ok(BatchSubresponse::ok())
            }
            BatchSubrequest::CreateChunkLists { kind, count } => {
                let mut ids = Vec::with_capacity(count);
                for _ in 0..count {
                    let id = ChunkListId::new();
                    self.cluster.store.create_chunk_list(id, kind)?;
                    ids.push(id);
                }
                Ok(BatchSubresponse {
                    chunk_list_ids: ids,
                    ..BatchSubresponse::ok()
                })
            }
            BatchSubrequest::UnstageChunkTree { root, recursive } => {
                let chunks = self.cluster.store.unstage_chunk_tree(root, recursive)?;
                for chunk in chunks {
                    self.replicator.schedule_requisition_update(&mut self.cluster, chunk);
                }
                Ok(BatchSubresponse::ok())
            }
            BatchSubrequest::AttachChunkTrees { parent, children } => {
                self.cluster.store.attach_to_chunk_list(parent, &children)?;
                for child in children {
                    self.schedule_tree_update(child);
                }
                Ok(BatchSubresponse::ok())
            }
            BatchSubrequest::DetachChunkTree { parent, child } => {
                self.cluster.store.detach_from_chunk_list(parent, child)?;
                self.schedule_tree_update(child);
                Ok(BatchSubresponse::ok())
            }
            BatchSubrequest::SetOwner { chunk_list, owner } => {
                self.cluster.store.set_owner(chunk_list, owner)?;
                self.replicator.restart_traversal(chunk_list);
                Ok(BatchSubresponse::ok())
            }
            BatchSubrequest::RemoveOwner { chunk_list, name } => {
                if self.cluster.store.remove_owner(chunk_list, &name)? {
                    self.replicator.restart_traversal(chunk_list);
                }
                Ok(BatchSubresponse::ok())
            }
            BatchSubrequest::DestroyChunk { chunk_id } => {
                self.destroy_chunk(chunk_id)?;
                Ok(BatchSubresponse::ok())
            }
        }
    }

    pub fn seal_chunk(&mut self, chunk_id: ChunkId, row_count: i64) -> Result<bool> {
        let sealed = self.cluster.store.seal_chunk(chunk_id, row_count)?;
        if sealed {
            self.replicator.on_chunk_sealed(&mut self.cluster, chunk_id);
        }
        Ok(sealed)
    }

    pub fn destroy_chunk(&mut self, chunk_id: ChunkId) -> Result<()> {
        let job = self.cluster.store.get_chunk(chunk_id)?.job;
        let chunk = self.cluster.store.destroy_chunk(chunk_id)?;
        if let Some(job) = job {
            self.job_tracker.unregister_job(job, &mut self.cluster);
        }
        self.replicator.on_chunk_destroyed(&mut self.cluster, &chunk);
        Ok(())
    }

    /// Applies a requisition batch computed by this or another cell.
    pub fn apply_requisition_update(&mut self, request: &RequisitionUpdateRequest) -> Result<RequisitionUpdateResponse> {
        self.ensure_leading()?;
        let applied = self.replicator.apply_requisition_update(&mut self.cluster, request);
        Ok(RequisitionUpdateResponse { applied })
    }

    pub fn node_admin(&mut self, node_id: NodeId, request: NodeAdminRequest) -> Result<NodeView> {
        self.ensure_leading()?;
        self.cluster.nodes.get(node_id)?;
        match request {
            NodeAdminRequest::SetRack { rack, data_center } => {
                let rack = rack
                    .as_deref()
                    .map(|rack| self.cluster.nodes.get_or_create_rack(rack, data_center.as_deref()));
                self.cluster.nodes.set_node_rack(node_id, rack)?;
                self.job_tracker.set_config(self.replicator.config(), &self.cluster.nodes);
                tracing::info!("Node {} moved to rack {:?}", node_id, rack);
            }
            NodeAdminRequest::SetDecommissioned { decommissioned } => {
                self.cluster.nodes.get_mut(node_id)?.decommissioned = decommissioned;
                tracing::info!("Node {} decommissioned: {}", node_id, decommissioned);
            }
            NodeAdminRequest::SetWriteSessionsDisabled { disabled } => {
                self.cluster.nodes.get_mut(node_id)?.disable_write_sessions = disabled;
                tracing::info!("Node {} write sessions disabled: {}", node_id, disabled);
            }
            NodeAdminRequest::Unregister => {
                self.replicator.on_node_disposed(&mut self.cluster, &mut self.job_tracker, node_id);
                return self.node_view(node_id);
            }
            NodeAdminRequest::Dispose => {
                self.replicator.on_node_disposed(&mut self.cluster, &mut self.job_tracker, node_id);
                let view = self.node_view(node_id)?;
                self.cluster.nodes.remove_node(node_id);
                tracing::info!("Node removed from directory: {} ({})", node_id, view.address);
                return Ok(view);
            }
        }
        self.sync_node_placement(node_id);
        let chunks = self.node_chunks(node_id);
        self.schedule_refresh_of(chunks);
        self.node_view(node_id)
    }

    /// Periodic refresh step.
    pub fn refresh(&mut self) -> usize {
        self.replicator.run_refresh(&mut self.cluster)
    }

    /// Periodic requisition step. Batches for this cell are applied right
    /// away; the rest are returned for forwarding.
    pub fn update_requisitions(&mut self) -> Vec<(CellTag, RequisitionUpdateRequest)> {
        self.replicator.run_traversals(&mut self.cluster);
        let local = self.cluster.store.cell_tag();
        let mut remote = Vec::new();
        for (cell, request) in self.replicator.run_requisition_update(&mut self.cluster) {
            if cell == local {
                self.replicator.apply_requisition_update(&mut self.cluster, &request);
            } else {
                remote.push((cell, request));
            }
        }
        remote
    }

    pub fn flush_finished_traversals(&mut self) -> usize {
        self.replicator.flush_finished_traversals(&mut self.cluster)
    }

    pub fn check_enabled(&mut self) -> bool {
        self.replicator.check_enabled(&self.cluster)
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.replicator.set_enabled(enabled);
    }

    pub fn seal_candidates(&mut self) -> Vec<SealCandidate> {
        if !self.replicator.is_leading() || !self.replicator.config().enable_sealing {
            return Vec::new();
        }
        let max = self.replicator.config().max_chunks_per_seal_scan;
        self.replicator.seal_candidates(&self.cluster, max)
    }

    pub fn chunk_status(&self, id: ChunkId) -> Result<ChunkStatusView> {
        let chunk = self.cluster.store.chunk(id).ok_or(ReplicatorError::NoSuchChunk(id))?;
        let statistics = compute_chunk_statistics(&self.cluster, self.replicator.config(), chunk);
        let health_sets = HealthSet::ALL
            .iter()
            .copied()
            .filter(|set| self.replicator.health().contains(*set, id))
            .collect();
        Ok(ChunkStatusView {
            chunk_id: id,
            kind: chunk.kind,
            erasure_codec: chunk.erasure_codec,
            confirmed: chunk.confirmed,
            sealed: chunk.sealed,
            native_cell: chunk.native_cell,
            replicas: chunk.stored_replicas.clone(),
            requisition: self.cluster.store.chunk_requisition(chunk),
            statistics,
            job: chunk.job,
            health_sets,
        })
    }

    pub fn health_set_members(&self, set: HealthSet) -> Vec<ChunkId> {
        self.replicator.health().members(set)
    }

    pub fn node_view(&self, id: NodeId) -> Result<NodeView> {
        let node = self.cluster.nodes.get(id)?;
        let rack = node.rack.and_then(|rack| self.cluster.nodes.rack(rack));
        let data_center = rack
            .and_then(|rack| rack.data_center)
            .and_then(|dc| self.cluster.nodes.data_center(dc))
            .map(|dc| dc.name.clone());
        Ok(NodeView {
            node_id: node.id,
            address: node.address.clone(),
            state: node.state,
            rack: rack.map(|rack| rack.name.clone()),
            data_center,
            decommissioned: node.decommissioned,
            disable_write_sessions: node.disable_write_sessions,
            replica_count: node.replica_count(),
            running_jobs: node.jobs.len(),
            removal_queue_size: node.removal_queue.len(),
            replication_queue_size: node.replication_queue_depth(),
            seal_queue_size: node.seal_queue.len(),
        })
    }

    pub fn status(&self) -> ReplicatorStatus {
        ReplicatorStatus {
            leading: self.replicator.is_leading(),
            enabled: self.replicator.enabled(),
            epoch: self.replicator.epoch(),
            chunk_count: self.cluster.store.chunk_count(),
            online_node_count: self.cluster.nodes.online_node_count(),
            refresh_queue_size: self.replicator.refresh_queue_size(),
            requisition_update_queue_size: self.replicator.requisition_update_queue_size(),
            running_jobs: self.job_tracker.len(),
            active_traversals: self.replicator.active_traversal_count(),
            health: self.replicator.health().summary(),
        }
    }

    pub fn running_jobs_of(&self, node: NodeId, job_type: JobType) -> usize {
        self.job_tracker
            .jobs_of(node)
            .iter()
            .filter(|job| job.job_type == job_type)
            .count()
    }

    pub fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(model::encode_snapshot(&self.cluster.store)?)
    }
}
