use async_trait::async_trait;
use futures::future::join_all;
use model::{CellTag, ChunkId};
use replicator::{
    CellForwarder, JournalQuorumQuerier, PrimaryStateSource, ReplicatorError, ReplicatorStatus,
    RequisitionUpdateRequest, RequisitionUpdateResponse, SealCandidate,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::{MasterConfig, PeerCell};

fn client(timeout_ms: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Posts requisition updates to the masters of peer cells.
pub struct HttpCellForwarder {
    client: reqwest::Client,
    peers: BTreeMap<CellTag, String>,
}

impl HttpCellForwarder {
    pub fn new(peers: &[PeerCell], timeout_ms: u64) -> Self {
        Self {
            client: client(timeout_ms),
            peers: peers
                .iter()
                .map(|peer| (peer.cell_tag, peer.url.trim_end_matches('/').to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl CellForwarder for HttpCellForwarder {
    async fn forward_requisition_update(&self, cell: CellTag, request: RequisitionUpdateRequest) -> replicator::Result<()> {
        let Some(url) = self.peers.get(&cell) else {
            return Err(ReplicatorError::Forwarding(cell, "unknown cell".to_string()));
        };
        let response = self
            .client
            .post(format!("{}/requisitions/update", url))
            .json(&request)
            .send()
            .await
            .map_err(|e| ReplicatorError::Forwarding(cell, e.to_string()))?;
        if !response.status().is_success() {
            return Err(ReplicatorError::Forwarding(cell, format!("status {}", response.status())));
        }
        let applied: RequisitionUpdateResponse = response
            .json()
            .await
            .map_err(|e| ReplicatorError::Forwarding(cell, e.to_string()))?;
        tracing::debug!("Cell {} applied {} requisition updates", cell, applied.applied);
        Ok(())
    }
}

/// Reads the replicator enabled flag from the primary cell's master.
pub struct HttpPrimaryState {
    client: reqwest::Client,
    url: String,
}

impl HttpPrimaryState {
    pub fn new(url: &str, timeout_ms: u64) -> Self {
        Self {
            client: client(timeout_ms),
            url: url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PrimaryStateSource for HttpPrimaryState {
    async fn replicator_enabled(&self) -> replicator::Result<Option<bool>> {
        let status: ReplicatorStatus = self
            .client
            .get(format!("{}/health", self.url))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| ReplicatorError::InvalidRequest(format!("primary unreachable: {}", e)))?
            .json()
            .await
            .map_err(|e| ReplicatorError::InvalidRequest(format!("bad primary status: {}", e)))?;
        Ok(status.enabled)
    }
}

#[derive(Debug, Deserialize)]
struct JournalInfo {
    row_count: i64,
}

/// Asks every replica holder of a journal chunk for its row count.
pub struct HttpQuorumQuerier {
    client: reqwest::Client,
}

impl HttpQuorumQuerier {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            client: client(timeout_ms),
        }
    }

    async fn row_count(&self, address: &str, chunk: ChunkId) -> Option<i64> {
        let result = self
            .client
            .get(format!("http://{}/journal/{}/info", address, chunk))
            .send()
            .await
            .and_then(|response| response.error_for_status());
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Journal info from {} for chunk {} failed: {}", address, chunk, e);
                return None;
            }
        };
        response.json::<JournalInfo>().await.ok().map(|info| info.row_count)
    }
}

/// Row count every reader is guaranteed to see: the largest one reported
/// once at least `read_quorum` replicas answered.
pub fn quorum_row_count(row_counts: &[i64], read_quorum: u8) -> Option<i64> {
    if row_counts.len() < (read_quorum as usize).max(1) {
        return None;
    }
    row_counts.iter().copied().max()
}

#[async_trait]
impl JournalQuorumQuerier for HttpQuorumQuerier {
    async fn query_quorum_row_count(&self, candidate: &SealCandidate) -> replicator::Result<i64> {
        let answers = join_all(
            candidate
                .replicas
                .iter()
                .map(|replica| self.row_count(&replica.address, candidate.chunk_id)),
        )
        .await;
        let row_counts: Vec<i64> = answers.into_iter().flatten().collect();
        quorum_row_count(&row_counts, candidate.read_quorum).ok_or_else(|| {
            ReplicatorError::QuorumQuery(format!(
                "chunk {}: {} of {} replicas answered, read quorum is {}",
                candidate.chunk_id,
                row_counts.len(),
                candidate.replicas.len(),
                candidate.read_quorum
            ))
        })
    }
}

pub fn collaborators(config: &MasterConfig) -> replicator::Collaborators {
    let forwarder: Option<std::sync::Arc<dyn CellForwarder>> = if config.peer_cells.is_empty() {
        None
    } else {
        Some(std::sync::Arc::new(HttpCellForwarder::new(&config.peer_cells, config.remote_timeout_ms)))
    };
    let primary: Option<std::sync::Arc<dyn PrimaryStateSource>> = config
        .primary_url
        .as_deref()
        .map(|url| std::sync::Arc::new(HttpPrimaryState::new(url, config.remote_timeout_ms)) as _);
    replicator::Collaborators {
        quorum_querier: Some(std::sync::Arc::new(HttpQuorumQuerier::new(config.remote_timeout_ms))),
        primary,
        forwarder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_row_count_needs_read_quorum_answers() {
        assert_eq!(quorum_row_count(&[10, 12], 3), None);
        assert_eq!(quorum_row_count(&[10, 12, 11], 2), Some(12));
        assert_eq!(quorum_row_count(&[], 0), None);
    }

    #[test]
    fn test_collaborators_follow_config() {
        let config = MasterConfig::default();
        let collaborators = collaborators(&config);
        assert!(collaborators.primary.is_none());
        assert!(collaborators.forwarder.is_none());
        assert!(collaborators.quorum_querier.is_some());
    }
}
