//! KDL configuration parsing for hopper.
//!
//! This crate handles parsing of the server configuration (`hopper.kdl`):
//! listener, storage backend, scheduling knobs and API tokens.

pub mod error;
pub mod server;

pub use error::{ConfigError, ConfigResult};
pub use server::{
    Access, ActionsConfig, ApiToken, LogFormat, ServerConfig, StorageConfig, load_server_config,
    parse_server_config,
};
