// Drives an in-process chunk master over HTTP with simulated storage nodes.
use anyhow::{bail, Context};
use chunkmaster::model::{
    AccountId, ChunkId, ChunkInfo, ChunkKind, CreateChunkSpec, ErasureCodec, MediumIndex, NodeId,
    NodeResources, ReplicaIndex, ReplicaState, Replication,
};
use chunkmaster::replicator::{
    BatchRequest, BatchResponse, BatchSubrequest, ChunkStatusView, ConfirmedReplica,
    FullHeartbeatRequest, FullHeartbeatResponse, IncrementalHeartbeatRequest,
    IncrementalHeartbeatResponse, JobSpec, JobState, JobStatusReport, JobType, MediumReport,
    NodeAdminRequest, RegisterNodeRequest, RegisterNodeResponse, ReplicaReport, ReplicatorConfig,
    ReplicatorStatus,
};
use chunkmaster::{Master, MasterConfig};
use clap::Parser;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::info;

const DEFAULT: MediumIndex = MediumIndex(0);

#[derive(Parser, Debug)]
#[command(name = "cluster-sim", about = "Replication convergence check against a live master")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:19013")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 6)]
    nodes: usize,
    #[arg(long, default_value_t = 20)]
    chunks: usize,
    #[arg(long, default_value_t = 3)]
    replication_factor: u8,
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

struct SimNode {
    id: NodeId,
    replicas: BTreeSet<(ChunkId, ReplicaIndex)>,
    added: Vec<(ChunkId, ReplicaIndex)>,
    removed: Vec<(ChunkId, ReplicaIndex)>,
    finished: Vec<JobStatusReport>,
    alive: bool,
}

struct Simulation {
    client: reqwest::Client,
    base: String,
    nodes: BTreeMap<NodeId, SimNode>,
    chunks: Vec<ChunkId>,
    jobs: BTreeMap<JobType, usize>,
}

fn report((chunk_id, replica_index): (ChunkId, ReplicaIndex)) -> ReplicaReport {
    ReplicaReport {
        chunk_id,
        replica_index,
        medium: DEFAULT,
        state: ReplicaState::Generic,
        cached: false,
    }
}

fn media(replica_count: usize) -> Vec<MediumReport> {
    vec![MediumReport {
        medium: DEFAULT,
        total_space: 1 << 40,
        used_space: (replica_count as i64 + 1) << 20,
        session_count: 0,
    }]
}

impl Simulation {
    async fn post<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> anyhow::Result<Resp> {
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {}", path))?;
        let status = response.status();
        if !status.is_success() {
            bail!("POST {} returned {}: {}", path, status, response.text().await.unwrap_or_default());
        }
        Ok(response.json().await?)
    }

    async fn get<Resp: serde::de::DeserializeOwned>(&self, path: &str) -> anyhow::Result<Resp> {
        let response = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .with_context(|| format!("GET {}", path))?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn wait_for_master(&self) -> anyhow::Result<()> {
        for _ in 0..50 {
            if self.get::<ReplicatorStatus>("/health").await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        bail!("master at {} never became ready", self.base)
    }

    async fn add_node(&mut self, index: usize) -> anyhow::Result<NodeId> {
        let registered: RegisterNodeResponse = self
            .post(
                "/nodes",
                &RegisterNodeRequest {
                    address: format!("sim-{}:9012", index),
                    rack: Some(format!("rack-{}", index)),
                    data_center: None,
                    consistent_placement_token_count: 0,
                },
            )
            .await?;
        let _: FullHeartbeatResponse = self
            .post(
                "/heartbeat/full",
                &FullHeartbeatRequest {
                    node_id: registered.node_id,
                    media: media(0),
                    replicas: Vec::new(),
                    resource_limits: NodeResources {
                        replication_slots: 8,
                        replication_data_size: 1 << 30,
                        repair_slots: 4,
                        repair_data_size: 1 << 30,
                        removal_slots: 32,
                        seal_slots: 8,
                    },
                },
            )
            .await?;
        self.nodes.insert(
            registered.node_id,
            SimNode {
                id: registered.node_id,
                replicas: BTreeSet::new(),
                added: Vec::new(),
                removed: Vec::new(),
                finished: Vec::new(),
                alive: true,
            },
        );
        Ok(registered.node_id)
    }

    async fn create_chunk(&mut self, factor: u8, holder: NodeId) -> anyhow::Result<ChunkId> {
        let id = ChunkId::new();
        let response: BatchResponse = self
            .post(
                "/chunks/batch",
                &BatchRequest {
                    subrequests: vec![
                        BatchSubrequest::CreateChunk(CreateChunkSpec {
                            id,
                            kind: ChunkKind::Blob,
                            erasure_codec: ErasureCodec::None,
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
                                row_count: 1000,
                                data_size: 1 << 20,
                                disk_space: 1 << 20,
                            },
                            replicas: vec![ConfirmedReplica {
                                node_id: holder,
                                replica_index: ReplicaIndex::GENERIC,
                                medium: DEFAULT,
                                state: ReplicaState::Generic,
                            }],
                        },
                    ],
                },
            )
            .await?;
        if let Some(failed) = response.subresponses.iter().find(|r| !r.ok) {
            bail!("chunk creation failed: {:?}", failed.error);
        }
        if let Some(node) = self.nodes.get_mut(&holder) {
            node.replicas.insert((id, ReplicaIndex::GENERIC));
        }
        self.chunks.push(id);
        Ok(id)
    }

    fn execute(&mut self, executor: NodeId, spec: JobSpec) {
        *self.jobs.entry(spec.job_type).or_default() += 1;
        match spec.job_type {
            JobType::Replicate | JobType::Repair | JobType::Balance => {
                for target in &spec.targets {
                    if let Some(node) = self.nodes.get_mut(&target.node_id).filter(|node| node.alive) {
                        let replica = (spec.chunk_id, target.replica_index);
                        if node.replicas.insert(replica) {
                            node.added.push(replica);
                        }
                    }
                }
            }
            JobType::Remove => {
                if let Some(node) = self.nodes.get_mut(&executor) {
                    let replica = (spec.chunk_id, spec.replica_index);
                    if node.replicas.remove(&replica) {
                        node.removed.push(replica);
                    }
                }
            }
            JobType::Seal => {}
        }
        if let Some(node) = self.nodes.get_mut(&executor) {
            node.finished.push(JobStatusReport {
                job_id: spec.job_id,
                state: JobState::Completed,
                error: None,
            });
        }
    }

    async fn heartbeat_all(&mut self) -> anyhow::Result<usize> {
        let ids: Vec<NodeId> = self.nodes.values().filter(|n| n.alive).map(|n| n.id).collect();
        let mut started = 0;
        for id in ids {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            let request = IncrementalHeartbeatRequest {
                node_id: id,
                media: media(node.replicas.len()),
                added_replicas: node.added.drain(..).map(report).collect(),
                removed_replicas: node.removed.drain(..).map(report).collect(),
                jobs: std::mem::take(&mut node.finished),
                resource_limits: None,
            };
            let response: IncrementalHeartbeatResponse = self.post("/heartbeat/incremental", &request).await?;
            for spec in response.jobs_to_start {
                started += 1;
                self.execute(id, spec);
            }
        }
        Ok(started)
    }

    async fn converged(&self, factor: u8) -> anyhow::Result<bool> {
        let status: ReplicatorStatus = self.get("/health").await?;
        if status.running_jobs > 0 || status.health.underreplicated > 0 || status.health.overreplicated > 0 {
            return Ok(false);
        }
        for chunk in &self.chunks {
            let view: ChunkStatusView = self.get(&format!("/chunks/{}/status", chunk)).await?;
            if view.replicas.len() != factor as usize {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn run_until_converged(&mut self, factor: u8, timeout: Duration) -> anyhow::Result<Duration> {
        let started = Instant::now();
        while started.elapsed() < timeout {
            self.heartbeat_all().await?;
            if self.converged(factor).await? {
                return Ok(started.elapsed());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        bail!("cluster did not converge within {:?}", timeout)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();
    if (args.replication_factor as usize) >= args.nodes {
        bail!("need more nodes than the replication factor to survive a node loss");
    }

    let config = MasterConfig {
        bind_address: args.bind,
        replicator: ReplicatorConfig {
            chunk_refresh_delay_ms: 0,
            refresh_period_ms: 20,
            requisition_update_period_ms: 50,
            ..ReplicatorConfig::default()
        },
        ..MasterConfig::default()
    };
    let master = Master::new(config).await?;
    let master_task = tokio::spawn(master.start());

    let mut sim = Simulation {
        client: reqwest::Client::new(),
        base: format!("http://{}", args.bind),
        nodes: BTreeMap::new(),
        chunks: Vec::new(),
        jobs: BTreeMap::new(),
    };
    sim.wait_for_master().await?;

    println!("Starting {} simulated nodes", args.nodes);
    let mut node_ids = Vec::new();
    for index in 0..args.nodes {
        node_ids.push(sim.add_node(index).await?);
    }

    println!("Writing {} chunks with replication factor {}", args.chunks, args.replication_factor);
    for index in 0..args.chunks {
        let holder = node_ids[index % node_ids.len()];
        sim.create_chunk(args.replication_factor, holder).await?;
    }

    let timeout = Duration::from_secs(args.timeout_secs);
    let elapsed = sim.run_until_converged(args.replication_factor, timeout).await?;
    println!("Replication converged in {:?}", elapsed);

    let victim = node_ids[0];
    let _: serde_json::Value = sim
        .post(&format!("/nodes/{}/admin", victim.0), &NodeAdminRequest::Unregister)
        .await?;
    if let Some(node) = sim.nodes.get_mut(&victim) {
        node.alive = false;
    }
    info!("Node {} unregistered", victim);

    let elapsed = sim.run_until_converged(args.replication_factor, timeout).await?;
    println!("Recovered from node loss in {:?}", elapsed);

    println!("Jobs executed:");
    for (job_type, count) in &sim.jobs {
        println!("  {:?}: {}", job_type, count);
    }

    master_task.abort();
    println!("Cluster simulation completed");
    Ok(())
}
