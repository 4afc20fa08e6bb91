use axum::extract::{Path, Query, State};
use axum::Json;
use model::{ChunkId, NodeId};
use replicator::{
    AllocateWriteTargetsRequest, AllocateWriteTargetsResponse, AutomatonHandle, BatchRequest, BatchResponse,
    ChunkStatusView, FullHeartbeatRequest, FullHeartbeatResponse, HealthSet, HealthSummary,
    IncrementalHeartbeatRequest, IncrementalHeartbeatResponse, NodeAdminRequest, NodeView, RegisterNodeRequest,
    RegisterNodeResponse, ReplicatorStatus, RequisitionUpdateRequest, RequisitionUpdateResponse,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::{ApiError, ApiResult};

pub struct AppState {
    pub automaton: AutomatonHandle,
}

#[derive(Debug, Deserialize)]
pub struct HealthSetQuery {
    set: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthSetMembers {
    pub set: HealthSet,
    pub total: usize,
    pub chunks: Vec<ChunkId>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthSetsResponse {
    Summary(HealthSummary),
    Members(HealthSetMembers),
}

pub async fn register_node(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterNodeRequest>,
) -> ApiResult<Json<RegisterNodeResponse>> {
    Ok(Json(state.automaton.register_node(request).await?))
}

pub async fn full_heartbeat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FullHeartbeatRequest>,
) -> ApiResult<Json<FullHeartbeatResponse>> {
    Ok(Json(state.automaton.full_heartbeat(request).await?))
}

pub async fn incremental_heartbeat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IncrementalHeartbeatRequest>,
) -> ApiResult<Json<IncrementalHeartbeatResponse>> {
    Ok(Json(state.automaton.incremental_heartbeat(request).await?))
}

pub async fn allocate_write_targets(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AllocateWriteTargetsRequest>,
) -> ApiResult<Json<AllocateWriteTargetsResponse>> {
    if request.desired_count == 0 {
        return Err(ApiError::InvalidRequest("desired_count must be positive".to_string()));
    }
    Ok(Json(state.automaton.allocate_write_targets(request).await?))
}

pub async fn execute_batch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchRequest>,
) -> ApiResult<Json<BatchResponse>> {
    Ok(Json(state.automaton.execute_batch(request).await?))
}

pub async fn update_requisitions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RequisitionUpdateRequest>,
) -> ApiResult<Json<RequisitionUpdateResponse>> {
    Ok(Json(state.automaton.apply_requisition_update(request).await?))
}

pub async fn chunk_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ChunkStatusView>> {
    Ok(Json(state.automaton.chunk_status(ChunkId(id)).await?))
}

pub async fn health_sets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HealthSetQuery>,
) -> ApiResult<Json<HealthSetsResponse>> {
    let Some(name) = query.set else {
        let status = state.automaton.status().await?;
        return Ok(Json(HealthSetsResponse::Summary(status.health)));
    };
    let set: HealthSet = name.parse().map_err(ApiError::InvalidRequest)?;
    let mut chunks = state.automaton.health_set_members(set).await?;
    let total = chunks.len();
    if let Some(limit) = query.limit {
        chunks.truncate(limit);
    }
    Ok(Json(HealthSetsResponse::Members(HealthSetMembers { set, total, chunks })))
}

pub async fn node_view(State(state): State<Arc<AppState>>, Path(id): Path<u32>) -> ApiResult<Json<NodeView>> {
    Ok(Json(state.automaton.node_view(NodeId(id)).await?))
}

pub async fn node_admin(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
    Json(request): Json<NodeAdminRequest>,
) -> ApiResult<Json<NodeView>> {
    Ok(Json(state.automaton.node_admin(NodeId(id), request).await?))
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult<Json<ReplicatorStatus>> {
    Ok(Json(state.automaton.status().await?))
}
