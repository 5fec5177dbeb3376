//! Flow API
//!
//! Small HTTP control surface over the flow controller and the instance
//! driver, used by external tooling and the end-to-end tests.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::driver::InstanceDriver;
use crate::error::OrchestratorError;
use crate::flow::FlowController;
use crate::types::{FlowRule, Instance, VnfType};

/// Shared state of the flow API
#[derive(Clone)]
pub struct ApiState {
    pub flow: Arc<FlowController>,
    pub driver: Arc<InstanceDriver>,
}

/// Create the flow API router with all endpoints
pub fn create_flow_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/flows", get(list_flows).post(add_flow))
        .route("/flows/:flow_id", delete(remove_flow))
        .route("/vnf/:vnf_type/instances", get(list_instances))
        .route("/load-balance/:vnf_type", get(load_balance))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the flow API on the given address
pub async fn serve_flow_api(state: ApiState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = create_flow_router(state);
    info!(flow_addr = %addr, "Starting flow API server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[instrument]
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now(),
    }))
}

#[instrument(skip(state))]
async fn list_flows(State(state): State<ApiState>) -> Json<Vec<FlowRule>> {
    Json(state.flow.list_rules(None))
}

/// Body of `POST /flows`
#[derive(Debug, Deserialize)]
struct AddFlowRequest {
    vnf_type: VnfType,
    instance_id: Uuid,
    priority: u32,
}

#[instrument(skip(state))]
async fn add_flow(
    State(state): State<ApiState>,
    Json(request): Json<AddFlowRequest>,
) -> Result<(StatusCode, Json<FlowRule>), StatusCode> {
    match state
        .flow
        .add_rule(request.vnf_type, request.instance_id, request.priority, None)
    {
        Ok(rule) => Ok((StatusCode::CREATED, Json(rule))),
        Err(OrchestratorError::FlowConflict(_)) => Err(StatusCode::CONFLICT),
        Err(OrchestratorError::AlreadyDestroyed(_)) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(error = %e, "Failed to add flow rule");
            Err(StatusCode::BAD_REQUEST)
        }
    }
}

#[instrument(skip(state))]
async fn remove_flow(
    State(state): State<ApiState>,
    Path(flow_id): Path<Uuid>,
) -> StatusCode {
    match state.flow.remove_rule(flow_id) {
        Ok(_) => StatusCode::NO_CONTENT,
        Err(OrchestratorError::InvalidAction(reason)) if reason.contains("refusing") => {
            StatusCode::CONFLICT
        }
        Err(_) => StatusCode::NOT_FOUND,
    }
}

#[instrument(skip(state))]
async fn list_instances(
    State(state): State<ApiState>,
    Path(vnf_type): Path<String>,
) -> Result<Json<Vec<Instance>>, StatusCode> {
    let vnf = VnfType::from_str(&vnf_type).map_err(|_| StatusCode::BAD_REQUEST)?;
    Ok(Json(state.driver.list(vnf)))
}

#[instrument(skip(state))]
async fn load_balance(
    State(state): State<ApiState>,
    Path(vnf_type): Path<String>,
) -> Result<Json<Instance>, StatusCode> {
    let vnf = VnfType::from_str(&vnf_type).map_err(|_| StatusCode::BAD_REQUEST)?;
    match state.flow.next_instance(vnf) {
        Some(instance) => Ok(Json(instance)),
        None => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverConfig, RollingUpdateConfig};
    use crate::driver::SimulatedContainerApi;
    use crate::flow::ChainIndex;

    async fn setup_state() -> ApiState {
        let api = SimulatedContainerApi::new();
        for vnf in VnfType::ALL {
            api.register_image(&format!("my-{vnf}-vnf"));
        }
        let driver = InstanceDriver::new(
            api,
            RollingUpdateConfig {
                health_check_timeout: 2,
                drain_timeout: 0,
                grace_period: 0,
            },
            &DriverConfig {
                image_prefix: "my-".into(),
            },
        );
        let flow = FlowController::new(Arc::clone(&driver), ChainIndex::new());
        ApiState { flow, driver }
    }

    #[tokio::test]
    async fn test_add_flow_conflict_maps_to_409() {
        let state = setup_state().await;
        let instance = state.driver.create(VnfType::Firewall).await.unwrap();
        state.driver.wait_active(instance.id).await.unwrap();

        let request = AddFlowRequest {
            vnf_type: VnfType::Firewall,
            instance_id: instance.id,
            priority: 100,
        };
        let first = add_flow(State(state.clone()), Json(request)).await;
        assert!(first.is_ok());

        let request = AddFlowRequest {
            vnf_type: VnfType::Firewall,
            instance_id: instance.id,
            priority: 100,
        };
        let second = add_flow(State(state), Json(request)).await;
        assert_eq!(second.unwrap_err(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_remove_flow_404_for_unknown() {
        let state = setup_state().await;
        let status = remove_flow(State(state), Path(Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_load_balance_503_when_empty() {
        let state = setup_state().await;
        let result = load_balance(State(state), Path("spamfilter".into())).await;
        assert_eq!(result.unwrap_err(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
