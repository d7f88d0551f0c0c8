//! Orchestrator configuration.
//!
//! Layered: compile-time defaults, then `apiary.toml`, then `APIARY_*`
//! environment variables. See [`ConfigLoader`] for the merge order and
//! [`ApiaryConfig`] for the recognised keys.

mod error;
mod loader;
mod types;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use types::{
    ApiaryConfig, InterventionConfig, LimitsConfig, SchedulingConfig, ServerConfig,
};
