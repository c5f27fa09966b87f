//! HTTP server for hopper.
//!
//! Serves the runner RPC surface (`/api/actions/runner.v1`) and the
//! administrative REST API (`/api/v1`).

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
