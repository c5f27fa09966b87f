//! API routes.

pub mod health;
pub mod jobs;
pub mod runner;
pub mod runners;
pub mod runs;
pub mod tasks;

use std::collections::HashMap;

use axum::Router;
use hopper_core::RunnerScope;

use crate::AppState;
use crate::error::ApiError;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/actions/runner.v1", runner::router())
        .nest("/api/v1", api_router())
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/global", scoped_router())
        .nest("/owners/{owner_id}", scoped_router())
        .nest("/repos/{repo_id}", scoped_router().merge(runs::repo_router()))
        .nest("/runs", runs::router())
        .nest("/tasks", tasks::router())
}

/// Routes served for each runner scope.
fn scoped_router() -> Router<AppState> {
    Router::new().merge(runners::router()).merge(jobs::router())
}

/// The runner scope named by the path of a scoped route.
pub(crate) fn scope_from_path(params: &HashMap<String, String>) -> Result<RunnerScope, ApiError> {
    let parse = |raw: &str| {
        raw.parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid id: {}", raw)))
    };
    if let Some(raw) = params.get("repo_id") {
        Ok(RunnerScope::Repository(parse(raw)?))
    } else if let Some(raw) = params.get("owner_id") {
        Ok(RunnerScope::Owner(parse(raw)?))
    } else {
        Ok(RunnerScope::Global)
    }
}

pub(crate) fn path_param<T: std::str::FromStr>(
    params: &HashMap<String, String>,
    name: &str,
) -> Result<T, ApiError> {
    let raw = params
        .get(name)
        .ok_or_else(|| ApiError::BadRequest(format!("missing path parameter {}", name)))?;
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid {}: {}", name, raw)))
}
