//! Run lifecycle at the dispatch front-end boundary.

use std::collections::BTreeSet;
use std::sync::Arc;

use hopper_core::{ConcurrencyType, Error, Job, NewJob, NewRun, ResourceId, Result, Run, labels};
use hopper_db::RunRepo;
use tracing::info;

use crate::{TrustGate, VersionNotifier};

pub struct RunService {
    runs: Arc<dyn RunRepo>,
    trust: Arc<TrustGate>,
    notifier: VersionNotifier,
}

impl RunService {
    pub fn new(runs: Arc<dyn RunRepo>, trust: Arc<TrustGate>, notifier: VersionNotifier) -> Self {
        Self {
            runs,
            trust,
            notifier,
        }
    }

    /// Create a run and its jobs.
    ///
    /// Jobs start blocked when the contributor needs approval. Jobs using
    /// `CancelInProgress` cancel unfinished jobs of other runs in their group.
    pub async fn enqueue(
        &self,
        run: NewRun,
        jobs: Vec<NewJob>,
        contributor_can_write: bool,
    ) -> Result<(Run, Vec<Job>)> {
        if jobs.is_empty() {
            return Err(Error::InvalidInput("a run needs at least one job".to_string()));
        }
        if run.repo_id <= 0 || run.owner_id <= 0 {
            return Err(Error::InvalidInput(
                "runs need a repository and an owner".to_string(),
            ));
        }
        let jobs: Vec<NewJob> = jobs
            .into_iter()
            .map(|job| NewJob {
                runs_on: labels::normalize(&job.runs_on),
                concurrency_group: job
                    .concurrency_group
                    .map(|g| g.trim().to_string())
                    .filter(|g| !g.is_empty()),
                ..job
            })
            .collect();

        let need_approval = self.trust.needs_approval(&run, contributor_can_write).await?;
        let (run, jobs) = self.runs.create_run(run, need_approval, jobs).await?;

        let superseding: BTreeSet<&str> = jobs
            .iter()
            .filter(|j| j.concurrency_type == ConcurrencyType::CancelInProgress)
            .filter_map(|j| j.group())
            .collect();
        let mut superseded = 0;
        for group in superseding {
            let cancelled = self
                .runs
                .cancel_superseded(run.repo_id, group, run.id)
                .await?;
            if !cancelled.is_empty() {
                info!(
                    run_id = %run.id,
                    repo_id = run.repo_id,
                    group,
                    cancelled = cancelled.len(),
                    "Cancelled superseded jobs"
                );
            }
            superseded += cancelled.len();
        }

        if !need_approval || superseded > 0 {
            self.notifier.notify();
        }
        info!(
            run_id = %run.id,
            repo_id = run.repo_id,
            jobs = jobs.len(),
            need_approval,
            "Enqueued run"
        );
        Ok((run, jobs))
    }

    pub async fn get(&self, run_id: ResourceId) -> Result<(Run, Vec<Job>)> {
        let run = self.runs.get_run(run_id).await?;
        let jobs = self.runs.list_run_jobs(run_id).await?;
        Ok((run, jobs))
    }

    /// Cancel a run. Runners holding its tasks see the cancellation on their
    /// next state report.
    pub async fn cancel(&self, run_id: ResourceId) -> Result<(Run, Vec<Job>)> {
        let cancelled = self.runs.cancel_run(run_id).await?;
        if !cancelled.is_empty() {
            self.notifier.notify();
        }
        info!(run_id = %run_id, cancelled = cancelled.len(), "Cancelled run");
        self.get(run_id).await
    }
}
