//! Runner management endpoints, served under every scope prefix.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use hopper_config::Access;
use hopper_core::{ResourceId, RunnerScope};
use hopper_scheduler::RunnerView;
use serde::Serialize;

use super::{path_param, scope_from_path};
use crate::AppState;
use crate::auth::authorize_scope;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/runners", get(list_runners))
        .route("/runners/{id}", get(get_runner).delete(delete_runner))
        .route("/registration-token", post(create_registration_token))
}

async fn list_runners(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(params): Path<HashMap<String, String>>,
) -> Result<Json<Vec<RunnerView>>, ApiError> {
    let scope = scope_from_path(&params)?;
    authorize_scope(&state, &headers, Access::Read, &scope)?;
    let runners = state.scheduler.registry.list(scope).await?;
    Ok(Json(runners))
}

async fn get_runner(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(params): Path<HashMap<String, String>>,
) -> Result<Json<RunnerView>, ApiError> {
    let scope = scope_from_path(&params)?;
    let id: ResourceId = path_param(&params, "id")?;
    authorize_scope(&state, &headers, Access::Read, &scope)?;
    let runner = state.scheduler.registry.get(scope, id).await?;
    Ok(Json(runner))
}

async fn delete_runner(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(params): Path<HashMap<String, String>>,
) -> Result<StatusCode, ApiError> {
    let scope = scope_from_path(&params)?;
    let id: ResourceId = path_param(&params, "id")?;
    authorize_scope(&state, &headers, Access::Write, &scope)?;
    state.scheduler.registry.delete(scope, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct RegistrationTokenResponse {
    token: String,
    scope: RunnerScope,
}

async fn create_registration_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(params): Path<HashMap<String, String>>,
) -> Result<Json<RegistrationTokenResponse>, ApiError> {
    let scope = scope_from_path(&params)?;
    authorize_scope(&state, &headers, Access::Write, &scope)?;
    let token = state
        .scheduler
        .registry
        .issue_registration_token(scope)
        .await?;
    Ok(Json(RegistrationTokenResponse { token, scope }))
}
