//! Job matcher: the ordered list of jobs a runner may claim right now.

use std::sync::Arc;

use hopper_core::concurrency::ConcurrencyGate;
use hopper_core::{Job, Result, Runner, RunnerScope, Status, labels};
use hopper_db::RunRepo;

/// Composes scope, labels, trust and the concurrency gate over stored job rows.
pub struct JobMatcher {
    runs: Arc<dyn RunRepo>,
    gate: ConcurrencyGate,
}

impl JobMatcher {
    pub fn new(runs: Arc<dyn RunRepo>, gate: ConcurrencyGate) -> Self {
        Self { runs, gate }
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Jobs `runner` may claim, newest first.
    ///
    /// `label_filter` narrows the runner's own labels; an empty filter keeps them.
    pub async fn available_jobs(&self, runner: &Runner, label_filter: &[String]) -> Result<Vec<Job>> {
        let runner_labels = labels::narrow(&runner.labels, label_filter);
        let candidates: Vec<Job> = self
            .runs
            .list_waiting_jobs(runner.scope)
            .await?
            .into_iter()
            .filter(|job| runner.is_eligible_for(job))
            .filter(|job| labels::matches(&runner_labels, &job.runs_on))
            .filter(|job| job.status == Status::Waiting)
            .collect();

        self.apply_gate(candidates).await
    }

    /// Pending jobs visible in `scope`, newest first, as a runner would see them.
    ///
    /// With a non-empty `label_filter`, only jobs sharing a label with it are kept.
    pub async fn pending_jobs(&self, scope: RunnerScope, label_filter: &[String]) -> Result<Vec<Job>> {
        let candidates: Vec<Job> = self
            .runs
            .list_waiting_jobs(scope)
            .await?
            .into_iter()
            .filter(|job| scope.admits(job.owner_id, job.repo_id))
            .filter(|job| label_filter.is_empty() || labels::matches(label_filter, &job.runs_on))
            .filter(|job| job.status == Status::Waiting)
            .collect();

        self.apply_gate(candidates).await
    }

    async fn apply_gate(&self, candidates: Vec<Job>) -> Result<Vec<Job>> {
        let groups = self.gate.group_keys(&candidates);
        let members = if groups.is_empty() {
            Vec::new()
        } else {
            self.runs.list_group_members(&groups).await?
        };

        let mut available = self.gate.filter(candidates, &members);
        available.sort_by(|a, b| b.index.cmp(&a.index));
        Ok(available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{add_runner, job, new_run};
    use chrono::Utc;
    use hopper_core::{ConcurrencyType, ResourceId, TaskResult};
    use hopper_core::task::TaskState;
    use hopper_db::{MemoryStore, TaskRepo};

    fn runner(scope: RunnerScope, labels: &[&str]) -> Runner {
        Runner {
            id: ResourceId::new(),
            name: "runner".to_string(),
            scope,
            labels: labels.iter().map(|l| l.to_string()).collect(),
            version: "v0.2.6".to_string(),
            token_hash: String::new(),
            token_salt: String::new(),
            last_online: None,
            last_active: None,
            created_at: Utc::now(),
        }
    }

    fn matcher(store: &Arc<MemoryStore>, queue_enabled: bool) -> JobMatcher {
        JobMatcher::new(store.clone(), ConcurrencyGate::new(queue_enabled))
    }

    fn names(jobs: &[Job]) -> Vec<&str> {
        jobs.iter().map(|j| j.name.as_str()).collect()
    }

    async fn finish(store: &MemoryStore, job_id: ResourceId, result: TaskResult) {
        let task = store
            .claim_job(job_id, add_runner(store).await)
            .await
            .unwrap()
            .unwrap();
        let state = TaskState {
            result,
            ..Default::default()
        };
        store.update_task_state(task.id, &state).await.unwrap();
    }

    #[tokio::test]
    async fn test_newest_first() {
        let store = Arc::new(MemoryStore::new());
        for name in ["a", "b", "c"] {
            store
                .create_run(new_run(1, 10, 5), false, vec![job(name, &[], None)])
                .await
                .unwrap();
        }
        let jobs = matcher(&store, true)
            .available_jobs(&runner(RunnerScope::Global, &[]), &[])
            .await
            .unwrap();
        assert_eq!(names(&jobs), vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_scope_filtering() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_run(new_run(1, 10, 5), false, vec![job("x", &["linux"], None)])
            .await
            .unwrap();
        store
            .create_run(new_run(2, 20, 5), false, vec![job("y", &["linux"], None)])
            .await
            .unwrap();
        let m = matcher(&store, true);

        let repo = m
            .available_jobs(&runner(RunnerScope::Repository(10), &["linux"]), &[])
            .await
            .unwrap();
        assert_eq!(names(&repo), vec!["x"]);

        let owner = m
            .available_jobs(&runner(RunnerScope::Owner(2), &["linux"]), &[])
            .await
            .unwrap();
        assert_eq!(names(&owner), vec!["y"]);

        let global = m
            .available_jobs(&runner(RunnerScope::Global, &["linux"]), &[])
            .await
            .unwrap();
        assert_eq!(names(&global), vec!["y", "x"]);
    }

    #[tokio::test]
    async fn test_label_any_of_and_filter() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_run(
                new_run(1, 10, 5),
                false,
                vec![job("ab", &["a", "b"], None), job("free", &[], None)],
            )
            .await
            .unwrap();
        let m = matcher(&store, true);

        let only_b = m
            .available_jobs(&runner(RunnerScope::Global, &["b"]), &[])
            .await
            .unwrap();
        assert_eq!(names(&only_b), vec!["free", "ab"]);

        let unlabeled = m
            .available_jobs(&runner(RunnerScope::Global, &[]), &[])
            .await
            .unwrap();
        assert_eq!(names(&unlabeled), vec!["free"]);

        // The filter narrows the runner's labels; it never adds to them.
        let narrowed = m
            .available_jobs(&runner(RunnerScope::Global, &["b", "c"]), &["c".to_string()])
            .await
            .unwrap();
        assert_eq!(names(&narrowed), vec!["free"]);
        let widened = m
            .available_jobs(&runner(RunnerScope::Global, &["c"]), &["a".to_string()])
            .await
            .unwrap();
        assert_eq!(names(&widened), vec!["free"]);
    }

    #[tokio::test]
    async fn test_blocked_jobs_are_not_available() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_run(new_run(1, 10, 5), true, vec![job("untrusted", &[], None)])
            .await
            .unwrap();
        let jobs = matcher(&store, true)
            .available_jobs(&runner(RunnerScope::Global, &[]), &[])
            .await
            .unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_serialization_until_terminal() {
        for result in [TaskResult::Success, TaskResult::Failure, TaskResult::Cancelled] {
            let store = Arc::new(MemoryStore::new());
            let (_, first) = store
                .create_run(new_run(1, 10, 5), false, vec![job("A", &[], Some("deploy"))])
                .await
                .unwrap();
            store
                .create_run(new_run(1, 10, 5), false, vec![job("B", &[], Some("deploy"))])
                .await
                .unwrap();
            let m = matcher(&store, true);
            let r = runner(RunnerScope::Global, &[]);

            assert_eq!(names(&m.available_jobs(&r, &[]).await.unwrap()), vec!["A"]);

            finish(&store, first[0].id, result).await;
            assert_eq!(names(&m.available_jobs(&r, &[]).await.unwrap()), vec!["B"]);
        }
    }

    #[tokio::test]
    async fn test_running_job_keeps_group_blocked() {
        let store = Arc::new(MemoryStore::new());
        let (_, first) = store
            .create_run(new_run(1, 10, 5), false, vec![job("A", &[], Some("deploy"))])
            .await
            .unwrap();
        store
            .create_run(new_run(1, 10, 5), false, vec![job("B", &[], Some("deploy"))])
            .await
            .unwrap();
        store
            .claim_job(first[0].id, add_runner(&store).await)
            .await
            .unwrap()
            .unwrap();

        let jobs = matcher(&store, true)
            .available_jobs(&runner(RunnerScope::Global, &[]), &[])
            .await
            .unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_same_run_exemption() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_run(
                new_run(1, 10, 5),
                false,
                vec![job("A", &[], Some("deploy")), job("B", &[], Some("deploy"))],
            )
            .await
            .unwrap();
        let jobs = matcher(&store, true)
            .available_jobs(&runner(RunnerScope::Global, &[]), &[])
            .await
            .unwrap();
        assert_eq!(names(&jobs), vec!["B", "A"]);
    }

    #[tokio::test]
    async fn test_passthroughs() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_run(new_run(1, 10, 5), false, vec![job("A", &[], Some("deploy"))])
            .await
            .unwrap();
        store
            .create_run(new_run(1, 10, 5), false, vec![job("B", &[], Some("deploy"))])
            .await
            .unwrap();
        store
            .create_run(new_run(1, 10, 5), false, vec![job("C", &[], Some(""))])
            .await
            .unwrap();
        store
            .create_run(new_run(1, 10, 5), false, vec![job("D", &[], Some(""))])
            .await
            .unwrap();
        let mut unlimited = job("E", &[], Some("deploy"));
        unlimited.concurrency_type = ConcurrencyType::Unlimited;
        store
            .create_run(new_run(1, 10, 5), false, vec![unlimited])
            .await
            .unwrap();
        let r = runner(RunnerScope::Global, &[]);

        let on = matcher(&store, true).available_jobs(&r, &[]).await.unwrap();
        assert_eq!(names(&on), vec!["E", "D", "C", "A"]);

        let off = matcher(&store, false).available_jobs(&r, &[]).await.unwrap();
        assert_eq!(names(&off), vec!["E", "D", "C", "B", "A"]);
    }

    #[tokio::test]
    async fn test_pending_jobs_match_claim_order() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_run(new_run(1, 10, 5), false, vec![job("A", &["linux"], Some("g"))])
            .await
            .unwrap();
        store
            .create_run(new_run(1, 10, 5), false, vec![job("B", &["linux"], Some("g"))])
            .await
            .unwrap();
        store
            .create_run(new_run(1, 10, 5), false, vec![job("C", &["mac"], None)])
            .await
            .unwrap();
        store
            .create_run(new_run(2, 20, 5), false, vec![job("D", &["linux"], None)])
            .await
            .unwrap();
        let m = matcher(&store, true);

        let pending = m
            .pending_jobs(RunnerScope::Repository(10), &[])
            .await
            .unwrap();
        assert_eq!(names(&pending), vec!["C", "A"]);

        let linux = m
            .pending_jobs(RunnerScope::Global, &["linux".to_string()])
            .await
            .unwrap();
        assert_eq!(names(&linux), vec!["D", "A"]);
    }
}
