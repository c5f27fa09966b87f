//! Trust gate: approval of runs from untrusted fork contributors.

use std::sync::Arc;

use hopper_core::trust::{ApprovalContext, RunEffect};
use hopper_core::{Error, NewRun, ResourceId, Result, Run, TrustUpdate, UserId};
use hopper_db::{RunRepo, TrustRepo};
use tracing::info;

use crate::VersionNotifier;

pub struct TrustGate {
    runs: Arc<dyn RunRepo>,
    trust: Arc<dyn TrustRepo>,
    notifier: VersionNotifier,
}

impl TrustGate {
    pub fn new(
        runs: Arc<dyn RunRepo>,
        trust: Arc<dyn TrustRepo>,
        notifier: VersionNotifier,
    ) -> Self {
        Self {
            runs,
            trust,
            notifier,
        }
    }

    /// Whether a new run must wait for a maintainer before its jobs can run.
    pub async fn needs_approval(&self, run: &NewRun, contributor_can_write: bool) -> Result<bool> {
        if !run.is_fork_pull_request || contributor_can_write {
            return Ok(false);
        }
        let context = ApprovalContext {
            from_fork: run.is_fork_pull_request,
            contributor_can_write,
            always_trusted: self
                .trust
                .is_always_trusted(run.repo_id, run.trigger_user_id)
                .await?,
        };
        Ok(context.needs_approval())
    }

    /// Record a maintainer's decision on `run_id`.
    ///
    /// `Once` and `Deny` only apply to a run awaiting approval. `Always` and
    /// `Revoke` persist for the contributor whatever the run's state.
    pub async fn record(
        &self,
        run_id: ResourceId,
        doer_id: UserId,
        doer_can_write: bool,
        update: TrustUpdate,
    ) -> Result<Run> {
        if !doer_can_write {
            return Err(Error::Forbidden(
                "trust decisions need write access to the repository".to_string(),
            ));
        }
        let run = self.runs.get_run(run_id).await?;
        let contributor = run.trigger_user_id;

        match update {
            TrustUpdate::Always => {
                self.trust
                    .set_always_trusted(run.repo_id, contributor, doer_id)
                    .await?;
            }
            TrustUpdate::Revoke => {
                self.trust.revoke_trust(run.repo_id, contributor).await?;
            }
            TrustUpdate::Once | TrustUpdate::Deny if !run.need_approval => {
                return Err(Error::Conflict(format!(
                    "run {} is not awaiting approval",
                    run_id
                )));
            }
            TrustUpdate::Once | TrustUpdate::Deny => {}
        }

        match update.run_effect() {
            RunEffect::Approve => {
                let pending = if update.is_persistent() {
                    self.runs
                        .list_runs_awaiting_approval(run.repo_id, contributor)
                        .await?
                } else {
                    vec![run_id]
                };
                let mut approved = 0;
                for pending_id in pending {
                    if self.runs.approve_run(pending_id, doer_id).await? {
                        approved += 1;
                    }
                }
                if update == TrustUpdate::Once && approved == 0 {
                    return Err(Error::Conflict(format!(
                        "run {} is not awaiting approval",
                        run_id
                    )));
                }
                if approved > 0 {
                    self.notifier.notify();
                }
            }
            RunEffect::Cancel => {
                if !self.runs.deny_run(run_id, doer_id).await? {
                    return Err(Error::Conflict(format!(
                        "run {} is not awaiting approval",
                        run_id
                    )));
                }
            }
            RunEffect::None => {}
        }

        info!(
            run_id = %run_id,
            repo_id = run.repo_id,
            contributor,
            doer_id,
            decision = ?update.decision(),
            "Recorded trust decision"
        );
        Ok(self.runs.get_run(run_id).await?)
    }
}
