//! Runner RPC endpoints.
//!
//! Every call except `register` is authenticated with the runner's
//! credentials. `fetch-task` long-polls until work is available, the
//! assignment version moves or the poll times out.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use hopper_scheduler::{
    FetchRequest, FetchResponse, LogUpdate, RegisterRequest, RegisteredRunner, TaskUpdate,
    TaskUpdateResponse,
};
use serde::Serialize;

use crate::AppState;
use crate::auth;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/fetch-task", post(fetch_task))
        .route("/update-task", post(update_task))
        .route("/update-log", post(update_log))
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisteredRunner>, ApiError> {
    let registered = state.scheduler.registry.register(req).await?;
    Ok(Json(registered))
}

async fn fetch_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<FetchRequest>,
) -> Result<Json<FetchResponse>, ApiError> {
    let runner = auth::runner(&state, &headers).await?;
    let response = state.scheduler.dispatcher.fetch_task(&runner, req).await?;
    Ok(Json(response))
}

async fn update_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TaskUpdate>,
) -> Result<Json<TaskUpdateResponse>, ApiError> {
    let runner = auth::runner(&state, &headers).await?;
    let response = state.scheduler.dispatcher.update_task(&runner, req).await?;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct UpdateLogResponse {
    ack_index: i64,
}

async fn update_log(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LogUpdate>,
) -> Result<Json<UpdateLogResponse>, ApiError> {
    let runner = auth::runner(&state, &headers).await?;
    let ack_index = state.scheduler.dispatcher.update_log(&runner, req).await?;
    Ok(Json(UpdateLogResponse { ack_index }))
}
