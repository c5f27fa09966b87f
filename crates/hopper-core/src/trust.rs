//! Trust decisions gating runs from untrusted contributors.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Recorded trust of a contributor in a repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustDecision {
    #[default]
    Unset,
    TrustedOnce,
    AlwaysTrusted,
    Denied,
    Revoked,
}

impl TrustDecision {
    /// Whether future runs of the contributor skip approval.
    pub fn is_persistent_trust(&self) -> bool {
        matches!(self, TrustDecision::AlwaysTrusted)
    }
}

/// A maintainer action on a run awaiting approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustUpdate {
    Once,
    Always,
    Deny,
    Revoke,
}

/// What a trust update does to the run it is recorded on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEffect {
    /// Blocked jobs move to waiting.
    Approve,
    /// Blocked jobs move to cancelled.
    Cancel,
    /// Only future runs are affected.
    None,
}

impl TrustUpdate {
    pub fn decision(&self) -> TrustDecision {
        match self {
            TrustUpdate::Once => TrustDecision::TrustedOnce,
            TrustUpdate::Always => TrustDecision::AlwaysTrusted,
            TrustUpdate::Deny => TrustDecision::Denied,
            TrustUpdate::Revoke => TrustDecision::Revoked,
        }
    }

    pub fn run_effect(&self) -> RunEffect {
        match self {
            TrustUpdate::Once | TrustUpdate::Always => RunEffect::Approve,
            TrustUpdate::Deny => RunEffect::Cancel,
            TrustUpdate::Revoke => RunEffect::None,
        }
    }

    /// Whether the update is persisted for the (repository, contributor) pair.
    pub fn is_persistent(&self) -> bool {
        matches!(self, TrustUpdate::Always | TrustUpdate::Revoke)
    }
}

impl std::str::FromStr for TrustUpdate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "once" => Ok(TrustUpdate::Once),
            "always" => Ok(TrustUpdate::Always),
            "deny" => Ok(TrustUpdate::Deny),
            "revoke" => Ok(TrustUpdate::Revoke),
            other => Err(Error::InvalidInput(format!("unknown trust update: {}", other))),
        }
    }
}

/// Facts about a new run's contributor, gathered by the dispatch front-end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalContext {
    /// The run comes from a fork contribution.
    pub from_fork: bool,
    /// The contributor has write or admin rights on the target repository.
    pub contributor_can_write: bool,
    /// An `AlwaysTrusted` record exists for (repository, contributor).
    pub always_trusted: bool,
}

impl ApprovalContext {
    /// Whether the run must wait for a trust decision before its jobs may run.
    pub fn needs_approval(&self) -> bool {
        self.from_fork && !self.contributor_can_write && !self.always_trusted
    }
}
