//! Core domain types for the hopper Actions scheduler.
//!
//! This crate contains:
//! - Resource identifiers and the shared `Status` lifecycle
//! - Runs, jobs, runners and tasks
//! - The pure matching predicates: scope resolver, label matcher and
//!   concurrency gate
//! - Trust decision types

pub mod concurrency;
pub mod error;
pub mod id;
pub mod job;
pub mod labels;
pub mod run;
pub mod runner;
pub mod status;
pub mod task;
pub mod trust;

pub use error::{Error, Result};
pub use id::{OwnerId, RepoId, ResourceId, UserId};
pub use job::{ConcurrencyType, Job, NewJob};
pub use run::{NewRun, Run, TriggerEvent};
pub use runner::{Runner, RunnerScope, RunnerStatus};
pub use status::Status;
pub use task::{Task, TaskResult};
pub use trust::{TrustDecision, TrustUpdate};
