//! Request authentication.
//!
//! Administrative calls carry `Authorization: Bearer <token>` matching a
//! configured API token. Runner calls carry the credentials handed out at
//! registration in `x-runner-uuid` and `x-runner-token`.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use hopper_config::{Access, ApiToken};
use hopper_core::{OwnerId, RepoId, ResourceId, Runner, RunnerScope};

use crate::AppState;
use crate::error::ApiError;

pub const RUNNER_UUID_HEADER: &str = "x-runner-uuid";
pub const RUNNER_TOKEN_HEADER: &str = "x-runner-token";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header(headers, AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Resolve the API token of a request and check it grants `access`.
pub fn api_token<'a>(
    state: &'a AppState,
    headers: &HeaderMap,
    access: Access,
) -> Result<&'a ApiToken, ApiError> {
    let presented = bearer_token(headers)
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;
    let token = state
        .api_tokens
        .iter()
        .find(|t| t.token == presented)
        .ok_or_else(|| ApiError::Unauthorized("invalid bearer token".to_string()))?;
    if token.access < access {
        return Err(ApiError::Forbidden("token is read-only".to_string()));
    }
    Ok(token)
}

/// Like [`api_token`], and the token must cover `scope`.
pub fn authorize_scope<'a>(
    state: &'a AppState,
    headers: &HeaderMap,
    access: Access,
    scope: &RunnerScope,
) -> Result<&'a ApiToken, ApiError> {
    let token = api_token(state, headers, access)?;
    if !token.scope.covers(scope) {
        return Err(ApiError::Forbidden(format!(
            "token scope {} does not cover {}",
            token.scope, scope
        )));
    }
    Ok(token)
}

/// Like [`api_token`], and the token must reach the given repository.
pub fn authorize_repo<'a>(
    state: &'a AppState,
    headers: &HeaderMap,
    access: Access,
    owner_id: OwnerId,
    repo_id: RepoId,
) -> Result<&'a ApiToken, ApiError> {
    let token = api_token(state, headers, access)?;
    if !token.scope.admits(owner_id, repo_id) {
        return Err(ApiError::Forbidden(format!(
            "token scope {} does not reach repository {}",
            token.scope, repo_id
        )));
    }
    Ok(token)
}

/// Authenticate the runner making a call and mark it online.
pub async fn runner(state: &AppState, headers: &HeaderMap) -> Result<Runner, ApiError> {
    let (Some(raw_id), Some(token)) = (
        header(headers, RUNNER_UUID_HEADER),
        header(headers, RUNNER_TOKEN_HEADER),
    ) else {
        return Err(ApiError::Unauthorized(
            "missing runner credentials".to_string(),
        ));
    };
    let id: ResourceId = raw_id
        .parse()
        .map_err(|_| ApiError::Unauthorized(format!("invalid runner id: {}", raw_id)))?;

    let registry = &state.scheduler.registry;
    let runner = registry.authenticate(id, token).await?;
    registry.heartbeat(runner.id, false).await?;
    Ok(runner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use hopper_config::ActionsConfig;

    fn state() -> AppState {
        AppState::in_memory(
            &ActionsConfig::default(),
            vec![
                ApiToken {
                    token: "admin".to_string(),
                    scope: RunnerScope::Global,
                    access: Access::Write,
                },
                ApiToken {
                    token: "viewer".to_string(),
                    scope: RunnerScope::Owner(7),
                    access: Access::Read,
                },
            ],
        )
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn test_missing_and_unknown_tokens() {
        let state = state();
        assert!(matches!(
            api_token(&state, &HeaderMap::new(), Access::Read),
            Err(ApiError::Unauthorized(_))
        ));
        assert!(matches!(
            api_token(&state, &bearer("nope"), Access::Read),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_read_token_cannot_write() {
        let state = state();
        assert!(api_token(&state, &bearer("viewer"), Access::Read).is_ok());
        assert!(matches!(
            api_token(&state, &bearer("viewer"), Access::Write),
            Err(ApiError::Forbidden(_))
        ));
        assert!(api_token(&state, &bearer("admin"), Access::Write).is_ok());
    }

    #[tokio::test]
    async fn test_scope_checks() {
        let state = state();
        let viewer = bearer("viewer");
        assert!(authorize_scope(&state, &viewer, Access::Read, &RunnerScope::Owner(7)).is_ok());
        assert!(matches!(
            authorize_scope(&state, &viewer, Access::Read, &RunnerScope::Global),
            Err(ApiError::Forbidden(_))
        ));
        assert!(authorize_repo(&state, &viewer, Access::Read, 7, 70).is_ok());
        assert!(matches!(
            authorize_repo(&state, &viewer, Access::Read, 8, 80),
            Err(ApiError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_runner_requires_both_headers() {
        let state = state();
        let mut headers = HeaderMap::new();
        headers.insert(RUNNER_TOKEN_HEADER, HeaderValue::from_static("secret"));
        assert!(matches!(
            runner(&state, &headers).await,
            Err(ApiError::Unauthorized(_))
        ));

        headers.insert(RUNNER_UUID_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert!(matches!(
            runner(&state, &headers).await,
            Err(ApiError::Unauthorized(_))
        ));
    }
}
