//! Job matching and task dispatch for hopper.
//!
//! Runners long-poll the [`Dispatcher`] for work. Availability is recomputed on
//! every fetch by the [`JobMatcher`] from stored job rows; no queue is kept in
//! memory. Waiting fetches are woken through the [`VersionNotifier`].

pub mod dispatcher;
pub mod matcher;
pub mod notifier;
pub mod registry;
pub mod runs;
pub mod trust;

pub use dispatcher::{
    Assignment, Dispatcher, FetchRequest, FetchResponse, LogUpdate, TaskUpdate, TaskUpdateResponse,
};
pub use matcher::JobMatcher;
pub use notifier::VersionNotifier;
pub use registry::{RegisterRequest, RegisteredRunner, RunnerRegistry, RunnerView};
pub use runs::RunService;
pub use trust::TrustGate;

use std::sync::Arc;

use hopper_config::ActionsConfig;
use hopper_core::concurrency::ConcurrencyGate;
use hopper_db::Stores;

/// Every scheduling service, wired over one set of stores.
#[derive(Clone)]
pub struct Scheduler {
    pub registry: Arc<RunnerRegistry>,
    pub matcher: Arc<JobMatcher>,
    pub dispatcher: Arc<Dispatcher>,
    pub runs: Arc<RunService>,
    pub trust: Arc<TrustGate>,
    pub notifier: VersionNotifier,
}

impl Scheduler {
    pub fn new(stores: Stores, config: &ActionsConfig) -> Self {
        let notifier = VersionNotifier::new();
        let gate = ConcurrencyGate::new(config.concurrency_group_queue_enabled);
        let matcher = Arc::new(JobMatcher::new(stores.runs.clone(), gate));
        let registry = Arc::new(RunnerRegistry::new(
            stores.runners.clone(),
            config.runner_offline_after,
            config.runner_idle_after,
        ));
        let trust = Arc::new(TrustGate::new(
            stores.runs.clone(),
            stores.trust.clone(),
            notifier.clone(),
        ));
        let runs = Arc::new(RunService::new(
            stores.runs.clone(),
            trust.clone(),
            notifier.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            &stores,
            matcher.clone(),
            notifier.clone(),
            config,
        ));

        Self {
            registry,
            matcher,
            dispatcher,
            runs,
            trust,
            notifier,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use hopper_core::{
        ConcurrencyType, NewJob, NewRun, RepoId, ResourceId, RunnerScope, TriggerEvent, UserId,
    };
    use hopper_db::{MemoryStore, NewRunner, RunnerRepo};

    /// Register a global runner directly in the store.
    pub async fn add_runner(store: &MemoryStore) -> ResourceId {
        store
            .upsert_runner(NewRunner {
                name: "runner".to_string(),
                scope: RunnerScope::Global,
                labels: vec!["linux".to_string()],
                version: "v1".to_string(),
                token_hash: "hash".to_string(),
                token_salt: "salt".to_string(),
            })
            .await
            .unwrap()
            .id
    }

    pub fn new_run(owner_id: i64, repo_id: RepoId, user: UserId) -> NewRun {
        NewRun {
            repo_id,
            owner_id,
            event: TriggerEvent::Push,
            commit_sha: "0123abcd".to_string(),
            git_ref: "refs/heads/main".to_string(),
            workflow_id: "ci.yml".to_string(),
            trigger_user_id: user,
            is_fork_pull_request: false,
        }
    }

    pub fn fork_run(owner_id: i64, repo_id: RepoId, user: UserId) -> NewRun {
        NewRun {
            event: TriggerEvent::PullRequest,
            is_fork_pull_request: true,
            ..new_run(owner_id, repo_id, user)
        }
    }

    pub fn job(name: &str, labels: &[&str], group: Option<&str>) -> NewJob {
        NewJob {
            name: name.to_string(),
            runs_on: labels.iter().map(|l| l.to_string()).collect(),
            concurrency_group: group.map(String::from),
            concurrency_type: ConcurrencyType::QueueBehind,
        }
    }
}
