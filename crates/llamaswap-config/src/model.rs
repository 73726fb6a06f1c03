//! Per-model configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::macros::MacroList;

/// Default upstream URL template; `${PORT}` is filled by the port allocator.
pub const DEFAULT_PROXY_URL: &str = "http://localhost:${PORT}";

/// Default health-check path on the upstream.
pub const DEFAULT_CHECK_ENDPOINT: &str = "/health";

/// Sentinel check endpoint that disables health probing entirely.
pub const CHECK_ENDPOINT_NONE: &str = "none";

/// Configuration for a single upstream model process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelConfig {
    /// Command template that launches the upstream server (shell-like).
    pub cmd: String,

    /// Optional command run instead of signalling on stop. `${PID}` is
    /// substituted with the child's PID at stop time.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cmd_stop: String,

    /// Upstream base URL. Schemes: `http`, `https`, `unix`.
    pub proxy: String,

    /// Alternate model identifiers accepted at request time.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,

    /// Extra environment for the child, `KEY=VALUE` entries.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Health-check path, or [`CHECK_ENDPOINT_NONE`] to skip probing.
    pub check_endpoint: String,

    /// Seconds of idleness before the process is unloaded. 0 = never.
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub ttl: u64,

    /// Hide this model from `/v1/models`.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub unlisted: bool,

    /// Rewrite the `model` field of request bodies to this name before
    /// forwarding.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub use_model_name: String,

    /// Maximum simultaneous upstream requests. 0 = unlimited.
    #[serde(skip_serializing_if = "is_zero_usize")]
    pub concurrency_limit: usize,

    /// Per-model macros; override globals with the same name in place.
    #[serde(skip_serializing_if = "MacroList::is_empty")]
    pub macros: MacroList,

    /// Opaque metadata surfaced through `/v1/models`. Macro references are
    /// expanded with scalar types preserved on whole-value matches.
    #[serde(skip_serializing_if = "is_yaml_null")]
    pub metadata: serde_yaml::Value,

    /// Override for streaming a loading notice to waiting clients.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_loading_state: Option<bool>,

    /// Request body filters applied before forwarding.
    #[serde(skip_serializing_if = "ModelFilters::is_empty")]
    pub filters: ModelFilters,

    /// Display name for `/v1/models`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Description for `/v1/models`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            cmd: String::new(),
            cmd_stop: String::new(),
            proxy: DEFAULT_PROXY_URL.to_string(),
            aliases: Vec::new(),
            env: Vec::new(),
            check_endpoint: DEFAULT_CHECK_ENDPOINT.to_string(),
            ttl: 0,
            unlisted: false,
            use_model_name: String::new(),
            concurrency_limit: 0,
            macros: MacroList::new(),
            metadata: serde_yaml::Value::Null,
            send_loading_state: None,
            filters: ModelFilters::default(),
            name: String::new(),
            description: String::new(),
        }
    }
}

impl ModelConfig {
    /// Whether probing is disabled for this model.
    pub fn skips_health_check(&self) -> bool {
        self.check_endpoint == CHECK_ENDPOINT_NONE
    }

    /// Metadata as JSON, for the `/v1/models` listing. `None` when empty.
    pub fn metadata_json(&self) -> Option<serde_json::Value> {
        match &self.metadata {
            serde_yaml::Value::Null => None,
            other => serde_json::to_value(other).ok(),
        }
    }
}

/// Request body filters: strip listed top-level keys, then set/override
/// others. The `model` key is protected from `set_params`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelFilters {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub strip_params: Vec<String>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub set_params: BTreeMap<String, serde_json::Value>,
}

impl ModelFilters {
    pub fn is_empty(&self) -> bool {
        self.strip_params.is_empty() && self.set_params.is_empty()
    }
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}

fn is_yaml_null(v: &serde_yaml::Value) -> bool {
    v.is_null()
}
