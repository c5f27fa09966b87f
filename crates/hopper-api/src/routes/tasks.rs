//! Task log reads.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use hopper_config::Access;
use hopper_core::ResourceId;
use hopper_core::task::LogRow;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::auth::{api_token, authorize_repo};
use crate::error::ApiError;

const DEFAULT_LOG_LIMIT: i64 = 1000;

pub fn router() -> Router<AppState> {
    Router::new().route("/{id}/logs", get(read_log))
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    #[serde(default)]
    offset: i64,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct LogResponse {
    task_id: ResourceId,
    offset: i64,
    log_length: i64,
    closed: bool,
    rows: Vec<LogRow>,
}

async fn read_log(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ResourceId>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogResponse>, ApiError> {
    api_token(&state, &headers, Access::Read)?;
    let (task, rows) = state
        .scheduler
        .dispatcher
        .read_log(id, query.offset, query.limit.unwrap_or(DEFAULT_LOG_LIMIT))
        .await?;
    authorize_repo(&state, &headers, Access::Read, task.owner_id, task.repo_id)?;
    Ok(Json(LogResponse {
        task_id: task.id,
        offset: query.offset,
        log_length: task.log_length,
        closed: task.log_closed,
        rows,
    }))
}
