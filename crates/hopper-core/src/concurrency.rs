//! Concurrency gate.
//!
//! Serializes runs sharing a (repository, concurrency group) key. Nothing is
//! queued: every evaluation is recomputed from a snapshot of the group's
//! unfinished jobs.

use std::collections::{BTreeSet, HashMap};

use crate::{ConcurrencyType, Job, RepoId, Status};

/// Key of a concurrency group.
pub type GroupKey = (RepoId, String);

#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyGate {
    queue_enabled: bool,
}

impl ConcurrencyGate {
    pub fn new(queue_enabled: bool) -> Self {
        Self { queue_enabled }
    }

    pub fn queue_enabled(&self) -> bool {
        self.queue_enabled
    }

    /// Whether `job` takes part in group serialization at all.
    pub fn applies_to(&self, job: &Job) -> bool {
        self.queue_enabled
            && job.concurrency_type != ConcurrencyType::Unlimited
            && job.group().is_some()
    }

    /// Groups for which a member snapshot is needed to evaluate `candidates`.
    pub fn group_keys<'a, I>(&self, candidates: I) -> Vec<GroupKey>
    where
        I: IntoIterator<Item = &'a Job>,
    {
        let keys: BTreeSet<GroupKey> = candidates
            .into_iter()
            .filter(|job| self.applies_to(job))
            .filter_map(|job| job.group().map(|g| (job.repo_id, g.to_string())))
            .collect();
        keys.into_iter().collect()
    }

    /// Whether `job` is held back by another member of its group.
    ///
    /// A job is blocked by an unfinished job of a different run in the same group
    /// that is older, or that is already running. Jobs of the same run never block
    /// each other.
    pub fn is_blocked(&self, job: &Job, members: &[Job]) -> bool {
        if !self.applies_to(job) {
            return false;
        }
        members
            .iter()
            .any(|other| Self::blocks(other, job))
    }

    /// Keep the candidates not blocked by `members`, preserving order.
    pub fn filter(&self, candidates: Vec<Job>, members: &[Job]) -> Vec<Job> {
        let mut by_group: HashMap<(RepoId, &str), Vec<&Job>> = HashMap::new();
        for member in members {
            if let Some(group) = member.group() {
                by_group
                    .entry((member.repo_id, group))
                    .or_default()
                    .push(member);
            }
        }

        candidates
            .into_iter()
            .filter(|job| {
                if !self.applies_to(job) {
                    return true;
                }
                let Some(group) = job.group() else {
                    return true;
                };
                by_group
                    .get(&(job.repo_id, group))
                    .is_none_or(|peers| !peers.iter().any(|other| Self::blocks(other, job)))
            })
            .collect()
    }

    fn blocks(other: &Job, job: &Job) -> bool {
        other.id != job.id
            && other.run_id != job.run_id
            && other.repo_id == job.repo_id
            && other.group().is_some()
            && other.group() == job.group()
            && other.status.is_unfinished()
            && (other.index < job.index || other.status == Status::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceId;
    use chrono::Utc;

    fn job(run: ResourceId, index: i64, group: Option<&str>, status: Status) -> Job {
        Job {
            id: ResourceId::new(),
            run_id: run,
            repo_id: 1,
            owner_id: 1,
            index,
            name: format!("job-{}", index),
            runs_on: vec![],
            concurrency_group: group.map(String::from),
            concurrency_type: ConcurrencyType::QueueBehind,
            status,
            task_id: None,
            attempt: 0,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
        }
    }

    fn ids(jobs: &[Job]) -> Vec<i64> {
        jobs.iter().map(|j| j.index).collect()
    }

    #[test]
    fn test_older_run_blocks_newer_run() {
        let gate = ConcurrencyGate::new(true);
        let a = job(ResourceId::new(), 1, Some("deploy"), Status::Waiting);
        let b = job(ResourceId::new(), 2, Some("deploy"), Status::Waiting);
        let members = vec![a.clone(), b.clone()];

        assert!(!gate.is_blocked(&a, &members));
        assert!(gate.is_blocked(&b, &members));
        assert_eq!(ids(&gate.filter(members.clone(), &members)), vec![1]);
    }

    #[test]
    fn test_running_older_job_blocks() {
        let gate = ConcurrencyGate::new(true);
        let a = job(ResourceId::new(), 1, Some("deploy"), Status::Running);
        let b = job(ResourceId::new(), 2, Some("deploy"), Status::Waiting);
        assert!(gate.is_blocked(&b, &[a, b.clone()]));
    }

    #[test]
    fn test_terminal_older_job_releases_group() {
        let gate = ConcurrencyGate::new(true);
        let b = job(ResourceId::new(), 2, Some("deploy"), Status::Waiting);
        for done in [Status::Success, Status::Failure, Status::Cancelled] {
            let a = job(ResourceId::new(), 1, Some("deploy"), done);
            assert!(!gate.is_blocked(&b, &[a, b.clone()]), "{:?}", done);
        }
    }

    #[test]
    fn test_same_run_never_blocks() {
        let gate = ConcurrencyGate::new(true);
        let run = ResourceId::new();
        let a = job(run, 1, Some("deploy"), Status::Running);
        let b = job(run, 2, Some("deploy"), Status::Waiting);
        let c = job(run, 3, Some("deploy"), Status::Waiting);
        let members = vec![a, b.clone(), c.clone()];
        assert_eq!(
            ids(&gate.filter(vec![b, c], &members)),
            vec![2, 3]
        );
    }

    #[test]
    fn test_toggle_off_passes_through() {
        let gate = ConcurrencyGate::new(false);
        let a = job(ResourceId::new(), 1, Some("deploy"), Status::Running);
        let b = job(ResourceId::new(), 2, Some("deploy"), Status::Waiting);
        assert!(!gate.is_blocked(&b, &[a, b.clone()]));
        assert!(gate.group_keys([&b]).is_empty());
    }

    #[test]
    fn test_empty_or_null_group_passes_through() {
        let gate = ConcurrencyGate::new(true);
        let a = job(ResourceId::new(), 1, Some(""), Status::Waiting);
        let b = job(ResourceId::new(), 2, Some(""), Status::Waiting);
        let c = job(ResourceId::new(), 3, None, Status::Waiting);
        let members = vec![a.clone(), b.clone(), c.clone()];
        assert_eq!(ids(&gate.filter(members.clone(), &members)), vec![1, 2, 3]);
    }

    #[test]
    fn test_unlimited_passes_through() {
        let gate = ConcurrencyGate::new(true);
        let a = job(ResourceId::new(), 1, Some("deploy"), Status::Running);
        let mut b = job(ResourceId::new(), 2, Some("deploy"), Status::Waiting);
        b.concurrency_type = ConcurrencyType::Unlimited;
        assert!(!gate.is_blocked(&b, &[a, b.clone()]));
    }

    #[test]
    fn test_cancel_in_progress_is_still_gated() {
        let gate = ConcurrencyGate::new(true);
        let a = job(ResourceId::new(), 1, Some("deploy"), Status::Waiting);
        let mut b = job(ResourceId::new(), 2, Some("deploy"), Status::Waiting);
        b.concurrency_type = ConcurrencyType::CancelInProgress;
        assert!(gate.is_blocked(&b, &[a, b.clone()]));
    }

    #[test]
    fn test_running_newer_run_blocks_rerun_of_older() {
        let gate = ConcurrencyGate::new(true);
        let older = job(ResourceId::new(), 1, Some("deploy"), Status::Waiting);
        let newer = job(ResourceId::new(), 2, Some("deploy"), Status::Running);
        assert!(gate.is_blocked(&older, &[older.clone(), newer]));
    }

    #[test]
    fn test_groups_are_per_repository() {
        let gate = ConcurrencyGate::new(true);
        let a = job(ResourceId::new(), 1, Some("deploy"), Status::Running);
        let mut b = job(ResourceId::new(), 2, Some("deploy"), Status::Waiting);
        b.repo_id = 2;
        assert!(!gate.is_blocked(&b, &[a, b.clone()]));
        assert_eq!(gate.group_keys([&b]), vec![(2, "deploy".to_string())]);
    }
}
