//! Run endpoints: enqueue, inspection, cancellation and trust decisions.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use hopper_config::Access;
use hopper_core::{
    Job, NewJob, NewRun, OwnerId, RepoId, ResourceId, Run, TriggerEvent, TrustUpdate, UserId,
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::auth::{api_token, authorize_repo};
use crate::error::ApiError;

/// Routes nested under `/repos/{repo_id}`.
pub fn repo_router() -> Router<AppState> {
    Router::new().route("/runs", post(enqueue_run))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(get_run))
        .route("/{id}/cancel", post(cancel_run))
        .route("/{id}/trust", post(record_trust))
}

#[derive(Debug, Serialize)]
struct RunResponse {
    run: Run,
    jobs: Vec<Job>,
}

impl From<(Run, Vec<Job>)> for RunResponse {
    fn from((run, jobs): (Run, Vec<Job>)) -> Self {
        Self { run, jobs }
    }
}

#[derive(Debug, Deserialize)]
struct EnqueueRunRequest {
    owner_id: OwnerId,
    event: TriggerEvent,
    commit_sha: String,
    git_ref: String,
    workflow_id: String,
    trigger_user_id: UserId,
    #[serde(default)]
    is_fork_pull_request: bool,
    /// Whether the triggering user has write access to the repository.
    #[serde(default)]
    contributor_can_write: bool,
    jobs: Vec<NewJob>,
}

async fn enqueue_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(repo_id): Path<RepoId>,
    Json(req): Json<EnqueueRunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    authorize_repo(&state, &headers, Access::Write, req.owner_id, repo_id)?;
    let run = NewRun {
        repo_id,
        owner_id: req.owner_id,
        event: req.event,
        commit_sha: req.commit_sha,
        git_ref: req.git_ref,
        workflow_id: req.workflow_id,
        trigger_user_id: req.trigger_user_id,
        is_fork_pull_request: req.is_fork_pull_request,
    };
    let created = state
        .scheduler
        .runs
        .enqueue(run, req.jobs, req.contributor_can_write)
        .await?;
    Ok(Json(created.into()))
}

async fn get_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ResourceId>,
) -> Result<Json<RunResponse>, ApiError> {
    api_token(&state, &headers, Access::Read)?;
    let (run, jobs) = state.scheduler.runs.get(id).await?;
    authorize_repo(&state, &headers, Access::Read, run.owner_id, run.repo_id)?;
    Ok(Json(RunResponse { run, jobs }))
}

async fn cancel_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ResourceId>,
) -> Result<Json<RunResponse>, ApiError> {
    api_token(&state, &headers, Access::Write)?;
    let (run, _) = state.scheduler.runs.get(id).await?;
    authorize_repo(&state, &headers, Access::Write, run.owner_id, run.repo_id)?;
    let cancelled = state.scheduler.runs.cancel(id).await?;
    Ok(Json(cancelled.into()))
}

#[derive(Debug, Deserialize)]
struct TrustRequest {
    /// Maintainer recording the decision.
    doer_id: UserId,
    decision: TrustUpdate,
}

/// Record a trust decision. Write access of the maintainer follows the
/// access of the calling token.
async fn record_trust(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ResourceId>,
    Json(req): Json<TrustRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    api_token(&state, &headers, Access::Read)?;
    let (run, _) = state.scheduler.runs.get(id).await?;
    let token = authorize_repo(&state, &headers, Access::Read, run.owner_id, run.repo_id)?;
    let doer_can_write = token.access == Access::Write;
    state
        .scheduler
        .trust
        .record(id, req.doer_id, doer_can_write, req.decision)
        .await?;
    let updated = state.scheduler.runs.get(id).await?;
    Ok(Json(updated.into()))
}
