//! Registered execution agents and the scope resolver.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::job::Job;
use crate::{Error, OwnerId, RepoId, ResourceId, Result};

/// Which jobs a runner (or an API token) may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RunnerScope {
    Global,
    Owner(OwnerId),
    Repository(RepoId),
}

impl RunnerScope {
    /// Whether a job of `repo_id` owned by `owner_id` falls inside this scope.
    pub fn admits(&self, owner_id: OwnerId, repo_id: RepoId) -> bool {
        match *self {
            RunnerScope::Global => true,
            RunnerScope::Owner(owner) => owner == owner_id,
            RunnerScope::Repository(repo) => repo == repo_id,
        }
    }

    /// Whether everything visible in `other` is visible in `self`.
    pub fn covers(&self, other: &RunnerScope) -> bool {
        match (self, other) {
            (RunnerScope::Global, _) => true,
            (a, b) => a == b,
        }
    }

    /// Nullable `(owner_id, repo_id)` columns for persistence.
    pub fn to_columns(&self) -> (Option<OwnerId>, Option<RepoId>) {
        match *self {
            RunnerScope::Global => (None, None),
            RunnerScope::Owner(owner) => (Some(owner), None),
            RunnerScope::Repository(repo) => (None, Some(repo)),
        }
    }

    /// Rebuild a scope from nullable columns. `0` is read as absent.
    pub fn from_columns(owner_id: Option<OwnerId>, repo_id: Option<RepoId>) -> Result<Self> {
        match (owner_id.filter(|id| *id != 0), repo_id.filter(|id| *id != 0)) {
            (None, None) => Ok(RunnerScope::Global),
            (Some(owner), None) => Ok(RunnerScope::Owner(owner)),
            (None, Some(repo)) => Ok(RunnerScope::Repository(repo)),
            (Some(owner), Some(repo)) => Err(Error::InvalidInput(format!(
                "scope cannot name both owner {} and repository {}",
                owner, repo
            ))),
        }
    }

    /// Key of the task-version counter for this scope, `0` meaning "any".
    pub fn version_key(&self) -> (OwnerId, RepoId) {
        let (owner, repo) = self.to_columns();
        (owner.unwrap_or(0), repo.unwrap_or(0))
    }
}

impl std::fmt::Display for RunnerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerScope::Global => f.write_str("global"),
            RunnerScope::Owner(id) => write!(f, "owner:{}", id),
            RunnerScope::Repository(id) => write!(f, "repo:{}", id),
        }
    }
}

impl std::str::FromStr for RunnerScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse_id = |raw: &str| {
            raw.parse::<i64>()
                .ok()
                .filter(|id| *id > 0)
                .ok_or_else(|| Error::InvalidInput(format!("invalid scope id: {}", raw)))
        };
        match s.split_once(':') {
            None if s == "global" => Ok(RunnerScope::Global),
            Some(("owner", id)) => Ok(RunnerScope::Owner(parse_id(id)?)),
            Some(("repo", id)) => Ok(RunnerScope::Repository(parse_id(id)?)),
            _ => Err(Error::InvalidInput(format!("invalid scope: {}", s))),
        }
    }
}

/// Liveness of a runner, derived from heartbeat recency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Offline,
    Idle,
    Active,
}

/// A registered execution agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: ResourceId,
    pub name: String,
    pub scope: RunnerScope,
    pub labels: Vec<String>,
    pub version: String,
    #[serde(skip_serializing, default)]
    pub token_hash: String,
    #[serde(skip_serializing, default)]
    pub token_salt: String,
    /// Last time the runner polled.
    pub last_online: Option<DateTime<Utc>>,
    /// Last time the runner claimed or reported work.
    pub last_active: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Runner {
    /// Scope resolver: whether this runner may serve `job` at all.
    pub fn is_eligible_for(&self, job: &Job) -> bool {
        self.scope.admits(job.owner_id, job.repo_id)
    }

    pub fn status(
        &self,
        now: DateTime<Utc>,
        offline_after: Duration,
        idle_after: Duration,
    ) -> RunnerStatus {
        match self.last_online {
            Some(online) if now - online <= offline_after => {}
            _ => return RunnerStatus::Offline,
        }
        match self.last_active {
            Some(active) if now - active <= idle_after => RunnerStatus::Active,
            _ => RunnerStatus::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConcurrencyType, Status};

    fn job(owner_id: OwnerId, repo_id: RepoId) -> Job {
        Job {
            id: ResourceId::new(),
            run_id: ResourceId::new(),
            repo_id,
            owner_id,
            index: 1,
            name: "build".to_string(),
            runs_on: vec![],
            concurrency_group: None,
            concurrency_type: ConcurrencyType::default(),
            status: Status::Waiting,
            task_id: None,
            attempt: 0,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
        }
    }

    fn runner(scope: RunnerScope) -> Runner {
        Runner {
            id: ResourceId::new(),
            name: "r".to_string(),
            scope,
            labels: vec![],
            version: "v1".to_string(),
            token_hash: String::new(),
            token_salt: String::new(),
            last_online: None,
            last_active: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_global_runner_is_eligible_everywhere() {
        let r = runner(RunnerScope::Global);
        assert!(r.is_eligible_for(&job(1, 10)));
        assert!(r.is_eligible_for(&job(2, 20)));
    }

    #[test]
    fn test_owner_runner_matches_owner_only() {
        let r = runner(RunnerScope::Owner(1));
        assert!(r.is_eligible_for(&job(1, 10)));
        assert!(r.is_eligible_for(&job(1, 11)));
        assert!(!r.is_eligible_for(&job(2, 10)));
    }

    #[test]
    fn test_repo_runner_matches_repo_only() {
        let r = runner(RunnerScope::Repository(10));
        assert!(r.is_eligible_for(&job(1, 10)));
        assert!(!r.is_eligible_for(&job(1, 11)));
    }

    #[test]
    fn test_scope_columns() {
        assert_eq!(
            RunnerScope::from_columns(None, None).unwrap(),
            RunnerScope::Global
        );
        assert_eq!(
            RunnerScope::from_columns(Some(0), Some(7)).unwrap(),
            RunnerScope::Repository(7)
        );
        assert!(RunnerScope::from_columns(Some(1), Some(7)).is_err());
        assert_eq!(RunnerScope::Owner(3).to_columns(), (Some(3), None));
        assert_eq!(RunnerScope::Repository(9).version_key(), (0, 9));
    }

    #[test]
    fn test_scope_parse_and_cover() {
        assert_eq!("global".parse::<RunnerScope>().unwrap(), RunnerScope::Global);
        assert_eq!(
            "owner:4".parse::<RunnerScope>().unwrap(),
            RunnerScope::Owner(4)
        );
        assert_eq!(
            "repo:8".parse::<RunnerScope>().unwrap(),
            RunnerScope::Repository(8)
        );
        assert!("repo:0".parse::<RunnerScope>().is_err());
        assert!("team:1".parse::<RunnerScope>().is_err());

        assert!(RunnerScope::Global.covers(&RunnerScope::Repository(1)));
        assert!(RunnerScope::Owner(1).covers(&RunnerScope::Owner(1)));
        assert!(!RunnerScope::Owner(1).covers(&RunnerScope::Global));
    }

    #[test]
    fn test_status_from_heartbeat() {
        let now = Utc::now();
        let offline = Duration::seconds(60);
        let idle = Duration::seconds(10);
        let mut r = runner(RunnerScope::Global);
        assert_eq!(r.status(now, offline, idle), RunnerStatus::Offline);

        r.last_online = Some(now - Duration::seconds(5));
        assert_eq!(r.status(now, offline, idle), RunnerStatus::Idle);

        r.last_active = Some(now - Duration::seconds(2));
        assert_eq!(r.status(now, offline, idle), RunnerStatus::Active);

        r.last_online = Some(now - Duration::seconds(120));
        assert_eq!(r.status(now, offline, idle), RunnerStatus::Offline);
    }
}
