//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use openapi_client::BuildCallback;
use openapi_server::{
    CallbackAck, CreateDeploymentRequest, DeploymentListResponse, DeploymentResponse,
    HealthResponse, RedeployRequest, VersionResponse,
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::deploy::orchestrator::CreateDeployment;
use crate::errors::OrchestratorError;
use crate::models::deployment::{Deployment, DeploymentStatus};
use crate::server::state::ServerState;
use crate::storage::records::DeploymentFilter;
use crate::utils::version_info;

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Caller view of a record
pub fn to_response(record: Deployment) -> DeploymentResponse {
    DeploymentResponse {
        id: record.id,
        owner_id: record.owner_id,
        name: record.name,
        status: record.status.to_string(),
        framework: record.framework.map(|f| f.to_string()),
        artifact_ref: record.artifact_ref,
        endpoint_ref: record.endpoint_ref.map(|e| e.url),
        version: record.version,
        retry_count: record.retry_count,
        error: record.error,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "serveml".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Create a deployment. The `Idempotency-Key` header wins over the body field.
pub async fn create_deployment_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<CreateDeploymentRequest>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let header_key = match headers.get(IDEMPOTENCY_HEADER) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| {
                    OrchestratorError::InvalidRequest("Idempotency-Key is not valid text".into())
                })?
                .to_string(),
        ),
        None => None,
    };
    let idempotency_key = header_key
        .or(request.idempotency_key)
        .filter(|k| !k.trim().is_empty());

    let record = state
        .orchestrator
        .create_deployment(CreateDeployment {
            owner_id: request.owner_id,
            artifact_ref: request.artifact_ref,
            name: request.name,
            idempotency_key,
            webhook_url: request.webhook_url,
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(to_response(record))))
}

/// Query parameters for listing deployments
#[derive(Debug, Deserialize)]
pub struct ListDeploymentsQuery {
    pub owner_id: Option<String>,

    /// Comma separated statuses
    pub status: Option<String>,

    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// List deployments by owner and/or status
pub async fn list_deployments_handler(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<ListDeploymentsQuery>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let mut filter = DeploymentFilter::new();
    if let Some(owner_id) = params.owner_id {
        filter = filter.owner(owner_id);
    }
    if let Some(statuses) = params.status {
        for status in statuses.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let status: DeploymentStatus =
                status.parse().map_err(OrchestratorError::InvalidRequest)?;
            filter = filter.status(status);
        }
    }
    if let Some(limit) = params.limit {
        filter = filter.limit(limit);
    }
    if let Some(offset) = params.offset {
        filter = filter.offset(offset);
    }

    let deployments: Vec<DeploymentResponse> = state
        .orchestrator
        .list_deployments(&filter)
        .await?
        .into_iter()
        .map(to_response)
        .collect();
    let total = state.orchestrator.count_deployments(&filter).await?;

    Ok(Json(DeploymentListResponse { deployments, total }))
}

pub async fn get_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let record = state.orchestrator.get_deployment(&id).await?;
    Ok(Json(to_response(record)))
}

pub async fn delete_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let record = state.orchestrator.delete_deployment(&id).await?;
    Ok(Json(to_response(record)))
}

pub async fn redeploy_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(request): Json<RedeployRequest>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let record = state
        .orchestrator
        .redeploy(&id, &request.artifact_ref)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(to_response(record))))
}

/// Build system completion callback
pub async fn build_callback_handler(
    State(state): State<Arc<ServerState>>,
    Json(callback): Json<BuildCallback>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let deployment_id = callback.deployment_id.clone();
    let attempt = callback.attempt_number;

    let applied = state.orchestrator.handle_build_callback(callback).await?;
    if applied {
        info!(deployment_id = %deployment_id, attempt, "Applied build callback");
    } else {
        debug!(deployment_id = %deployment_id, attempt, "Build callback had no effect");
    }
    Ok(Json(CallbackAck { applied }))
}
