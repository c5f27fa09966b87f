//! Pending job listing.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use hopper_config::Access;
use hopper_core::Job;
use serde::Deserialize;

use super::scope_from_path;
use crate::AppState;
use crate::auth::authorize_scope;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/jobs", get(pending_jobs))
}

#[derive(Debug, Default, Deserialize)]
struct PendingJobsQuery {
    /// Comma separated runner labels to match jobs against.
    labels: Option<String>,
}

impl PendingJobsQuery {
    fn labels(&self) -> Vec<String> {
        self.labels
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()
    }
}

/// Jobs a runner of this scope could be handed right now, newest first.
async fn pending_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<PendingJobsQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let scope = scope_from_path(&params)?;
    authorize_scope(&state, &headers, Access::Read, &scope)?;
    let jobs = state
        .scheduler
        .matcher
        .pending_jobs(scope, &query.labels())
        .await?;
    Ok(Json(jobs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_query_parsing() {
        let query = PendingJobsQuery {
            labels: Some("linux, x64,,gpu ".to_string()),
        };
        assert_eq!(query.labels(), vec!["linux", "x64", "gpu"]);
        assert!(PendingJobsQuery::default().labels().is_empty());
    }
}
