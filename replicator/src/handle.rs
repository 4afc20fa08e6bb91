use std::sync::Arc;

use async_trait::async_trait;
use model::{CellTag, ChunkId, NodeId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::health::HealthSet;
use crate::messages::*;
use crate::{ChunkAutomaton, ReplicatorConfig, ReplicatorError, Result};

type Step = Box<dyn FnOnce(&mut ChunkAutomaton) + Send>;

/// Reads the row count agreed on by a quorum of a journal chunk's replicas.
#[async_trait]
pub trait JournalQuorumQuerier: Send + Sync {
    async fn query_quorum_row_count(&self, candidate: &SealCandidate) -> Result<i64>;
}

/// The primary cell's view of whether replication is allowed.
#[async_trait]
pub trait PrimaryStateSource: Send + Sync {
    async fn replicator_enabled(&self) -> Result<Option<bool>>;
}

/// Delivers requisition updates to the cell that owns the chunks.
#[async_trait]
pub trait CellForwarder: Send + Sync {
    async fn forward_requisition_update(&self, cell: CellTag, request: RequisitionUpdateRequest) -> Result<()>;
}

/// External services the periodic loops talk to. Missing ones switch the
/// corresponding behavior off.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub quorum_querier: Option<Arc<dyn JournalQuorumQuerier>>,
    pub primary: Option<Arc<dyn PrimaryStateSource>>,
    pub forwarder: Option<Arc<dyn CellForwarder>>,
}

/// Cloneable front of a [`ChunkAutomaton`] owned by a single task. Steps
/// run one at a time in submission order.
#[derive(Clone)]
pub struct AutomatonHandle {
    sender: mpsc::UnboundedSender<Step>,
}

impl AutomatonHandle {
    /// Moves the automaton into its own task. The task ends and hands the
    /// automaton back once every handle is dropped.
    pub fn spawn(automaton: ChunkAutomaton) -> (Self, JoinHandle<ChunkAutomaton>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(Self::process_steps(rx, automaton));
        (Self { sender: tx }, task)
    }

    async fn process_steps(mut receiver: mpsc::UnboundedReceiver<Step>, mut automaton: ChunkAutomaton) -> ChunkAutomaton {
        while let Some(step) = receiver.recv().await {
            step(&mut automaton);
        }
        tracing::info!("Chunk automaton loop finished");
        automaton
    }

    pub async fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut ChunkAutomaton) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let step: Step = Box::new(move |automaton: &mut ChunkAutomaton| {
            let _ = tx.send(f(automaton));
        });
        self.sender.send(step).map_err(|_| ReplicatorError::Stopped)?;
        rx.await.map_err(|_| ReplicatorError::Stopped)
    }

    pub async fn start_leading(&self) -> Result<()> {
        self.execute(|automaton| automaton.start_leading()).await
    }

    pub async fn stop_leading(&self) -> Result<()> {
        self.execute(|automaton| automaton.stop_leading()).await
    }

    pub async fn set_replicator_config(&self, config: ReplicatorConfig) -> Result<()> {
        self.execute(move |automaton| automaton.set_replicator_config(config)).await
    }

    pub async fn register_node(&self, request: RegisterNodeRequest) -> Result<RegisterNodeResponse> {
        self.execute(move |automaton| automaton.register_node(request)).await?
    }

    pub async fn full_heartbeat(&self, request: FullHeartbeatRequest) -> Result<FullHeartbeatResponse> {
        self.execute(move |automaton| automaton.full_heartbeat(request)).await?
    }

    pub async fn incremental_heartbeat(&self, request: IncrementalHeartbeatRequest) -> Result<IncrementalHeartbeatResponse> {
        self.execute(move |automaton| automaton.incremental_heartbeat(request)).await?
    }

    pub async fn allocate_write_targets(&self, request: AllocateWriteTargetsRequest) -> Result<AllocateWriteTargetsResponse> {
        self.execute(move |automaton| automaton.allocate_write_targets(&request)).await?
    }

    pub async fn execute_batch(&self, request: BatchRequest) -> Result<BatchResponse> {
        self.execute(move |automaton| automaton.execute_batch(request)).await?
    }

    pub async fn apply_requisition_update(&self, request: RequisitionUpdateRequest) -> Result<RequisitionUpdateResponse> {
        self.execute(move |automaton| automaton.apply_requisition_update(&request)).await?
    }

    pub async fn node_admin(&self, node: NodeId, request: NodeAdminRequest) -> Result<NodeView> {
        self.execute(move |automaton| automaton.node_admin(node, request)).await?
    }

    pub async fn chunk_status(&self, chunk: ChunkId) -> Result<ChunkStatusView> {
        self.execute(move |automaton| automaton.chunk_status(chunk)).await?
    }

    pub async fn health_set_members(&self, set: HealthSet) -> Result<Vec<ChunkId>> {
        self.execute(move |automaton| automaton.health_set_members(set)).await
    }

    pub async fn node_view(&self, node: NodeId) -> Result<NodeView> {
        self.execute(move |automaton| automaton.node_view(node)).await?
    }

    pub async fn status(&self) -> Result<ReplicatorStatus> {
        self.execute(|automaton| automaton.status()).await
    }

    pub async fn snapshot(&self) -> Result<Vec<u8>> {
        self.execute(|automaton| automaton.snapshot()).await?
    }

    /// Drives the background loops until one of them stops, which happens
    /// only when the automaton task is gone.
    pub async fn run_periodic(&self, config: ReplicatorConfig, collaborators: Collaborators) -> Result<()> {
        tracing::info!("Starting chunk replicator loops");

        let refresh_task = {
            let handle = self.clone();
            let period = config.refresh_period_ms;
            tokio::spawn(async move { Self::refresh_loop(handle, period).await })
        };

        let requisition_task = {
            let handle = self.clone();
            let period = config.requisition_update_period_ms;
            let forwarder = collaborators.forwarder.clone();
            tokio::spawn(async move { Self::requisition_update_loop(handle, period, forwarder).await })
        };

        let traversal_flush_task = {
            let handle = self.clone();
            let period = config.finished_traversal_flush_period_ms;
            tokio::spawn(async move { Self::traversal_flush_loop(handle, period).await })
        };

        let health_task = {
            let handle = self.clone();
            let period = config.health_check_period_ms;
            let primary = collaborators.primary.clone();
            tokio::spawn(async move { Self::health_check_loop(handle, period, primary).await })
        };

        let seal_task = {
            let handle = self.clone();
            let period = config.seal_scan_period_ms;
            let querier = collaborators.quorum_querier.clone();
            tokio::spawn(async move { Self::seal_loop(handle, period, querier).await })
        };

        tokio::select! {
            result = refresh_task => {
                tracing::error!("Refresh task failed: {:?}", result);
                Err(ReplicatorError::Stopped)
            }
            result = requisition_task => {
                tracing::error!("Requisition update task failed: {:?}", result);
                Err(ReplicatorError::Stopped)
            }
            result = traversal_flush_task => {
                tracing::error!("Traversal flush task failed: {:?}", result);
                Err(ReplicatorError::Stopped)
            }
            result = health_task => {
                tracing::error!("Health check task failed: {:?}", result);
                Err(ReplicatorError::Stopped)
            }
            result = seal_task => {
                tracing::error!("Seal task failed: {:?}", result);
                Err(ReplicatorError::Stopped)
            }
        }
    }

    fn interval(period_ms: u64) -> tokio::time::Interval {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(period_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    }

    async fn refresh_loop(handle: AutomatonHandle, period_ms: u64) -> Result<()> {
        let mut interval = Self::interval(period_ms);
        loop {
            interval.tick().await;
            let refreshed = handle.execute(|automaton| automaton.refresh()).await?;
            if refreshed > 0 {
                tracing::debug!("Refreshed {} chunks", refreshed);
            }
        }
    }

    async fn requisition_update_loop(
        handle: AutomatonHandle,
        period_ms: u64,
        forwarder: Option<Arc<dyn CellForwarder>>,
    ) -> Result<()> {
        let mut interval = Self::interval(period_ms);
        loop {
            interval.tick().await;
            let remote = handle.execute(|automaton| automaton.update_requisitions()).await?;
            for (cell, request) in remote {
                let Some(forwarder) = &forwarder else {
                    tracing::warn!(
                        "Dropping requisition update for cell {}: no forwarder configured ({} chunks)",
                        cell,
                        request.updates.len()
                    );
                    continue;
                };
                let count = request.updates.len();
                match forwarder.forward_requisition_update(cell, request).await {
                    Ok(()) => tracing::debug!("Forwarded {} requisition updates to cell {}", count, cell),
                    Err(e) => tracing::warn!("Failed to forward requisition update to cell {}: {}", cell, e),
                }
            }
        }
    }

    async fn traversal_flush_loop(handle: AutomatonHandle, period_ms: u64) -> Result<()> {
        let mut interval = Self::interval(period_ms);
        loop {
            interval.tick().await;
            handle.execute(|automaton| automaton.flush_finished_traversals()).await?;
        }
    }

    async fn health_check_loop(
        handle: AutomatonHandle,
        period_ms: u64,
        primary: Option<Arc<dyn PrimaryStateSource>>,
    ) -> Result<()> {
        let mut interval = Self::interval(period_ms);
        loop {
            interval.tick().await;
            let Some(primary) = &primary else {
                handle.execute(|automaton| automaton.check_enabled()).await?;
                continue;
            };
            match primary.replicator_enabled().await {
                Ok(Some(enabled)) => handle.execute(move |automaton| automaton.set_enabled(enabled)).await?,
                Ok(None) => tracing::debug!("Primary has not decided on replicator state yet"),
                Err(e) => tracing::warn!("Failed to fetch replicator state from primary: {}", e),
            }
        }
    }

    async fn seal_loop(
        handle: AutomatonHandle,
        period_ms: u64,
        querier: Option<Arc<dyn JournalQuorumQuerier>>,
    ) -> Result<()> {
        let mut interval = Self::interval(period_ms);
        loop {
            interval.tick().await;
            let Some(querier) = &querier else {
                continue;
            };
            let candidates = handle.execute(|automaton| automaton.seal_candidates()).await?;
            for candidate in candidates {
                let chunk = candidate.chunk_id;
                let row_count = match querier.query_quorum_row_count(&candidate).await {
                    Ok(row_count) => row_count,
                    Err(e) => {
                        tracing::warn!("Quorum query for chunk {} failed: {}", chunk, e);
                        continue;
                    }
                };
                match handle.execute(move |automaton| automaton.seal_chunk(chunk, row_count)).await? {
                    Ok(true) => tracing::info!("Chunk sealed by sealer: {} (RowCount: {})", chunk, row_count),
                    Ok(false) => {}
                    Err(e) => tracing::warn!("Failed to seal chunk {}: {}", chunk, e),
                }
            }
        }
    }
}
