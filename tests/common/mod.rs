#![allow(dead_code)]

use chrono::Duration;
use model::{
    AccountId, CellTag, ChunkId, ChunkInfo, ChunkKind, ChunkStore, CreateChunkSpec, ErasureCodec,
    MediumConfig, MediumIndex, NodeId, NodeResources, ReplicaIndex, ReplicaState, Replication,
};
use placement::PlacementConfig;
use replicator::{
    BatchRequest, BatchSubrequest, ChunkAutomaton, ConfirmedReplica, FullHeartbeatRequest,
    HealthSet, IncrementalHeartbeatRequest, JobSpec, JobState, JobStatusReport, JobType,
    ManualClock, MediumReport, RegisterNodeRequest, ReplicaReport, ReplicatorConfig,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const DEFAULT: MediumIndex = MediumIndex(0);

/// Replica held by a simulated node: chunk, part index, medium.
pub type HeldReplica = (ChunkId, ReplicaIndex, MediumIndex);

/// In-memory storage node that runs every job it is handed to completion
/// and reports the outcome on its next heartbeat.
#[derive(Debug)]
pub struct SimNode {
    pub id: NodeId,
    pub address: String,
    pub alive: bool,
    pub replicas: BTreeSet<HeldReplica>,
    media: Vec<MediumIndex>,
    pending_added: Vec<HeldReplica>,
    pending_removed: Vec<HeldReplica>,
    finished_jobs: Vec<JobStatusReport>,
}

impl SimNode {
    fn take_request(&mut self) -> IncrementalHeartbeatRequest {
        let report = |(chunk_id, replica_index, medium): HeldReplica| ReplicaReport {
            chunk_id,
            replica_index,
            medium,
            state: ReplicaState::Generic,
            cached: false,
        };
        IncrementalHeartbeatRequest {
            node_id: self.id,
            media: self.media_reports(),
            added_replicas: self.pending_added.drain(..).map(report).collect(),
            removed_replicas: self.pending_removed.drain(..).map(report).collect(),
            jobs: std::mem::take(&mut self.finished_jobs),
            resource_limits: None,
        }
    }

    fn media_reports(&self) -> Vec<MediumReport> {
        self.media
            .iter()
            .map(|medium| {
                let held = self.replicas.iter().filter(|(_, _, m)| m == medium).count();
                MediumReport {
                    medium: *medium,
                    total_space: 1 << 40,
                    used_space: (held as i64 + 1) << 20,
                    session_count: 0,
                }
            })
            .collect()
    }
}

fn resource_limits() -> NodeResources {
    NodeResources {
        replication_slots: 8,
        replication_data_size: 1 << 30,
        repair_slots: 8,
        repair_data_size: 1 << 30,
        removal_slots: 32,
        seal_slots: 8,
    }
}

pub struct SimCluster {
    pub automaton: ChunkAutomaton,
    pub clock: ManualClock,
    pub nodes: BTreeMap<NodeId, SimNode>,
    pub started_jobs: Vec<JobSpec>,
    /// Media every node added from now on reports.
    pub media: Vec<MediumIndex>,
}

impl SimCluster {
    pub fn new() -> Self {
        Self::with_config(PlacementConfig::default(), Self::replicator_config())
    }

    pub fn replicator_config() -> ReplicatorConfig {
        ReplicatorConfig {
            chunk_refresh_delay_ms: 0,
            ..ReplicatorConfig::default()
        }
    }

    pub fn with_config(placement: PlacementConfig, replicator: ReplicatorConfig) -> Self {
        Self::with_store(ChunkStore::new(CellTag(1)), placement, replicator)
    }

    /// A cluster whose store has the given media on top of the default one.
    /// Returns their indexes in order.
    pub fn with_media(names: &[&str]) -> (Self, Vec<MediumIndex>) {
        let mut store = ChunkStore::new(CellTag(1));
        let extra: Vec<MediumIndex> = names
            .iter()
            .map(|name| store.create_medium(name, MediumConfig::default()).unwrap())
            .collect();
        let mut cluster = Self::with_store(store, PlacementConfig::default(), Self::replicator_config());
        cluster.media.extend(extra.iter().copied());
        (cluster, extra)
    }

    fn with_store(store: ChunkStore, placement: PlacementConfig, replicator: ReplicatorConfig) -> Self {
        let clock = ManualClock::default();
        let mut automaton = ChunkAutomaton::new(store, placement, replicator, Arc::new(clock.clone()));
        automaton.start_leading();
        Self {
            automaton,
            clock,
            nodes: BTreeMap::new(),
            started_jobs: Vec::new(),
            media: vec![DEFAULT],
        }
    }

    /// Registers a node in its own rack and sends its full heartbeat.
    pub fn add_node(&mut self) -> NodeId {
        let index = self.nodes.len();
        self.add_node_in_rack(&format!("rack-{}", index))
    }

    pub fn add_node_in_rack(&mut self, rack: &str) -> NodeId {
        let address = format!("sim-{}:9012", self.nodes.len());
        let node_id = self
            .automaton
            .register_node(RegisterNodeRequest {
                address: address.clone(),
                rack: Some(rack.to_string()),
                data_center: None,
                consistent_placement_token_count: 0,
            })
            .unwrap()
            .node_id;
        let node = SimNode {
            id: node_id,
            address,
            alive: true,
            replicas: BTreeSet::new(),
            media: self.media.clone(),
            pending_added: Vec::new(),
            pending_removed: Vec::new(),
            finished_jobs: Vec::new(),
        };
        self.automaton
            .full_heartbeat(FullHeartbeatRequest {
                node_id,
                media: node.media_reports(),
                replicas: Vec::new(),
                resource_limits: resource_limits(),
            })
            .unwrap();
        self.nodes.insert(node_id, node);
        node_id
    }

    pub fn create_chunk(&mut self, codec: ErasureCodec, factor: u8, holders: &[(NodeId, ReplicaIndex)]) -> ChunkId {
        let id = ChunkId::new();
        let response = self
            .automaton
            .execute_batch(BatchRequest {
                subrequests: vec![
                    BatchSubrequest::CreateChunk(CreateChunkSpec {
                        id,
                        kind: ChunkKind::Blob,
                        erasure_codec: codec,
                        account: AccountId::new("sim"),
                        replication: Replication::new(true).with_policy(DEFAULT, factor),
                        transaction: None,
                        read_quorum: 0,
                        write_quorum: 0,
                        consistent_placement_hash: None,
                        endorsement_required: false,
                    }),
                    BatchSubrequest::ConfirmChunk {
                        chunk_id: id,
                        info: ChunkInfo {
                            row_count: 100,
                            data_size: 1 << 20,
                            disk_space: 1 << 20,
                        },
                        replicas: holders
                            .iter()
                            .map(|(node_id, replica_index)| ConfirmedReplica {
                                node_id: *node_id,
                                replica_index: *replica_index,
                                medium: DEFAULT,
                                state: ReplicaState::Generic,
                            })
                            .collect(),
                    },
                ],
            })
            .unwrap();
        assert!(response.subresponses.iter().all(|r| r.ok), "{:?}", response);
        for (node_id, replica_index) in holders {
            if let Some(node) = self.nodes.get_mut(node_id) {
                node.replicas.insert((id, *replica_index, DEFAULT));
            }
        }
        id
    }

    pub fn create_regular_chunk(&mut self, factor: u8, holders: &[NodeId]) -> ChunkId {
        let holders: Vec<_> = holders.iter().map(|node| (*node, ReplicaIndex::GENERIC)).collect();
        self.create_chunk(ErasureCodec::None, factor, &holders)
    }

    /// Stops heartbeats from a node and tells the master it is gone.
    pub fn kill_node(&mut self, node_id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.alive = false;
        }
        self.automaton
            .node_admin(node_id, replicator::NodeAdminRequest::Unregister)
            .unwrap();
    }

    fn execute_job(&mut self, executor: NodeId, spec: JobSpec) {
        match spec.job_type {
            JobType::Replicate | JobType::Repair | JobType::Balance => {
                for target in &spec.targets {
                    if let Some(node) = self.nodes.get_mut(&target.node_id) {
                        if node.alive {
                            let replica = (spec.chunk_id, target.replica_index, target.medium);
                            if node.replicas.insert(replica) {
                                node.pending_added.push(replica);
                            }
                        }
                    }
                }
            }
            JobType::Remove => {
                if let Some(node) = self.nodes.get_mut(&executor) {
                    let replica = (spec.chunk_id, spec.replica_index, spec.medium);
                    if node.replicas.remove(&replica) {
                        node.pending_removed.push(replica);
                    }
                }
            }
            JobType::Seal => {}
        }
        if let Some(node) = self.nodes.get_mut(&executor) {
            node.finished_jobs.push(JobStatusReport {
                job_id: spec.job_id,
                state: JobState::Completed,
                error: None,
            });
        }
        self.started_jobs.push(spec);
    }

    /// One heartbeat from every live node followed by a refresh.
    pub fn round(&mut self) -> usize {
        let ids: Vec<NodeId> = self.nodes.values().filter(|node| node.alive).map(|node| node.id).collect();
        let mut started = 0;
        for id in ids {
            let request = match self.nodes.get_mut(&id) {
                Some(node) => node.take_request(),
                None => continue,
            };
            let response = self.automaton.incremental_heartbeat(request).unwrap();
            for spec in response.jobs_to_start {
                started += 1;
                self.execute_job(id, spec);
            }
        }
        self.automaton.update_requisitions();
        self.automaton.refresh();
        self.clock.advance(Duration::milliseconds(100));
        started
    }

    /// Runs rounds until nothing is scheduled for a few rounds in a row.
    pub fn converge(&mut self, max_rounds: usize) -> usize {
        let mut quiet = 0;
        for round in 0..max_rounds {
            if self.round() == 0 {
                quiet += 1;
                if quiet >= 3 {
                    return round + 1;
                }
            } else {
                quiet = 0;
            }
        }
        panic!("cluster did not converge in {} rounds", max_rounds);
    }

    pub fn holders(&self, chunk: ChunkId) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|node| node.alive && node.replicas.iter().any(|(id, _, _)| *id == chunk))
            .map(|node| node.id)
            .collect()
    }

    pub fn holders_on(&self, chunk: ChunkId, medium: MediumIndex) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|node| node.alive && node.replicas.iter().any(|(id, _, m)| *id == chunk && *m == medium))
            .map(|node| node.id)
            .collect()
    }

    pub fn health_sets(&self, chunk: ChunkId) -> Vec<HealthSet> {
        self.automaton.chunk_status(chunk).unwrap().health_sets
    }
}
