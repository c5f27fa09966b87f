//! Runner registration, authentication and listing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use hopper_core::{Error, ResourceId, Result, Runner, RunnerScope, RunnerStatus, labels};
use hopper_db::{NewRunner, RunnerRepo};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// Registration call made by a runner process.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    /// Registration token issued for a scope.
    pub token: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Credentials returned once on registration.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredRunner {
    pub runner: Runner,
    /// Secret the runner presents on every later call.
    pub token: String,
}

/// A runner with its derived liveness.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerView {
    #[serde(flatten)]
    pub runner: Runner,
    pub status: RunnerStatus,
}

pub struct RunnerRegistry {
    runners: Arc<dyn RunnerRepo>,
    offline_after: chrono::Duration,
    idle_after: chrono::Duration,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn random_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn hash_registration_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn hash_runner_token(salt: &str, token: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(salt.as_bytes()).expect("HMAC can take any size key");
    mac.update(token.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn verify_runner_token(runner: &Runner, token: &str) -> bool {
    let Ok(expected) = hex::decode(&runner.token_hash) else {
        return false;
    };
    let mut mac = Hmac::<Sha256>::new_from_slice(runner.token_salt.as_bytes())
        .expect("HMAC can take any size key");
    mac.update(token.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

impl RunnerRegistry {
    pub fn new(runners: Arc<dyn RunnerRepo>, offline_after: Duration, idle_after: Duration) -> Self {
        Self {
            runners,
            offline_after: to_chrono(offline_after),
            idle_after: to_chrono(idle_after),
        }
    }

    /// Issue a registration token for `scope`. Earlier tokens of the scope stop working.
    pub async fn issue_registration_token(&self, scope: RunnerScope) -> Result<String> {
        let token = random_token();
        self.runners
            .issue_registration_token(scope, &hash_registration_token(&token))
            .await?;
        info!(scope = %scope, "Issued registration token");
        Ok(token)
    }

    /// Register a runner, or re-key the runner of the same name in the token's scope.
    pub async fn register(&self, request: RegisterRequest) -> Result<RegisteredRunner> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("runner name is required".to_string()));
        }
        let Some(scope) = self
            .runners
            .registration_token_scope(&hash_registration_token(&request.token))
            .await?
        else {
            warn!(runner = name, "Rejected registration with unknown token");
            return Err(Error::Unauthorized("invalid registration token".to_string()));
        };

        let token = random_token();
        let salt = random_token();
        let runner = self
            .runners
            .upsert_runner(NewRunner {
                name: name.to_string(),
                scope,
                labels: labels::normalize(&request.labels),
                version: request.version,
                token_hash: hash_runner_token(&salt, &token),
                token_salt: salt,
            })
            .await?;

        info!(runner_id = %runner.id, name = %runner.name, scope = %scope, "Registered runner");
        Ok(RegisteredRunner { runner, token })
    }

    /// Resolve runner credentials. Unknown or deleted runners are unauthorized.
    pub async fn authenticate(&self, id: ResourceId, token: &str) -> Result<Runner> {
        let runner = match self.runners.get_runner(id).await {
            Ok(runner) => runner,
            Err(hopper_db::DbError::NotFound(_)) => {
                return Err(Error::Unauthorized(format!("unknown runner {}", id)));
            }
            Err(e) => return Err(e.into()),
        };
        if !verify_runner_token(&runner, token) {
            return Err(Error::Unauthorized("invalid runner token".to_string()));
        }
        Ok(runner)
    }

    pub async fn list(&self, scope: RunnerScope) -> Result<Vec<RunnerView>> {
        let runners = self.runners.list_runners(scope).await?;
        Ok(runners.into_iter().map(|r| self.view(r)).collect())
    }

    /// A runner registered in `scope` (any runner for the global scope).
    pub async fn get(&self, scope: RunnerScope, id: ResourceId) -> Result<RunnerView> {
        let runner = self.runners.get_runner(id).await?;
        if !scope.covers(&runner.scope) {
            return Err(Error::NotFound(format!("runner {}", id)));
        }
        Ok(self.view(runner))
    }

    pub async fn delete(&self, scope: RunnerScope, id: ResourceId) -> Result<()> {
        self.get(scope, id).await?;
        self.runners.delete_runner(id).await?;
        info!(runner_id = %id, "Deleted runner");
        Ok(())
    }

    pub async fn heartbeat(&self, id: ResourceId, active: bool) -> Result<()> {
        Ok(self.runners.touch_runner(id, active).await?)
    }

    fn view(&self, runner: Runner) -> RunnerView {
        let status = runner.status(Utc::now(), self.offline_after, self.idle_after);
        RunnerView { runner, status }
    }
}
