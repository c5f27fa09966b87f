//! Application state.

use std::sync::Arc;

use hopper_config::{ActionsConfig, ApiToken};
use hopper_db::Stores;
use hopper_scheduler::Scheduler;
use sqlx::PgPool;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    pub api_tokens: Arc<Vec<ApiToken>>,
    /// Pool checked by the readiness check; absent for the in-memory store.
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(
        stores: Stores,
        actions: &ActionsConfig,
        api_tokens: Vec<ApiToken>,
        pool: Option<PgPool>,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(stores, actions),
            api_tokens: Arc::new(api_tokens),
            pool,
        }
    }

    /// State over a fresh in-memory store.
    pub fn in_memory(actions: &ActionsConfig, api_tokens: Vec<ApiToken>) -> Self {
        Self::new(Stores::memory(), actions, api_tokens, None)
    }
}
