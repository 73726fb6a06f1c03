//! Declarative configuration for llama-swap.
//!
//! Translates a YAML document into fully expanded runtime process
//! specifications: ordered macro substitution, automatic port allocation,
//! alias and group validation. Pure apart from environment-variable reads.

pub mod config;
pub mod env;
pub mod error;
pub mod group;
pub mod macros;
pub mod model;

pub use config::{
    Config, DEFAULT_HEALTH_CHECK_TIMEOUT, DEFAULT_METRICS_MAX_IN_MEMORY, DEFAULT_START_PORT,
    HooksConfig, MIN_HEALTH_CHECK_TIMEOUT, PeerConfig, StartupHooks,
};
pub use error::ConfigError;
pub use group::{DEFAULT_GROUP_ID, GroupConfig};
pub use macros::{MacroEntry, MacroList, MacroValue};
pub use model::{CHECK_ENDPOINT_NONE, DEFAULT_CHECK_ENDPOINT, DEFAULT_PROXY_URL, ModelConfig, ModelFilters};
