//! Top-level configuration and the resolve pipeline.
//!
//! `Config::from_yaml` is a pure function from raw YAML bytes to a fully
//! expanded configuration: environment references are substituted pre-parse,
//! macros are validated and expanded per model, ports are allocated, and the
//! group partition is checked. Errors never yield a partial config.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::env::substitute_env;
use crate::error::ConfigError;
use crate::group::{DEFAULT_GROUP_ID, GroupConfig};
use crate::macros::{self, MacroList, MacroValue};
use crate::model::ModelConfig;

/// Default seconds to wait for an upstream to become healthy.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: u64 = 120;

/// Lower bound on the health-check timeout; smaller values are clamped.
pub const MIN_HEALTH_CHECK_TIMEOUT: u64 = 15;

/// First port handed out by the automatic `${PORT}` allocator.
pub const DEFAULT_START_PORT: u16 = 5800;

/// Default capacity of the metrics ring kept in memory.
pub const DEFAULT_METRICS_MAX_IN_MEMORY: usize = 1000;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Fully resolved llama-swap configuration. Immutable after load; a reload
/// produces a fresh instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Seconds an upstream may take to pass its health probe.
    pub health_check_timeout: u64,

    /// First port assigned to models whose `cmd` uses `${PORT}`.
    pub start_port: u16,

    /// Process-wide log level.
    pub log_level: String,

    /// Capacity of the in-memory metrics buffer.
    pub metrics_max_in_memory: usize,

    /// Global macros, in declaration order.
    #[serde(skip_serializing_if = "MacroList::is_empty")]
    pub macros: MacroList,

    /// Model ID → model configuration.
    pub models: BTreeMap<String, ModelConfig>,

    /// Group ID → group policy.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, GroupConfig>,

    /// Startup hooks.
    #[serde(skip_serializing_if = "HooksConfig::is_empty")]
    pub hooks: HooksConfig,

    /// When non-empty, requests must present one of these keys upstream of
    /// the core (gateway-layer check).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub api_keys: Vec<String>,

    /// Remote llama-swap peers, by name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub peers: BTreeMap<String, PeerConfig>,

    /// Alias → canonical model ID, computed during resolve.
    #[serde(skip)]
    aliases: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            start_port: DEFAULT_START_PORT,
            log_level: "info".to_string(),
            metrics_max_in_memory: DEFAULT_METRICS_MAX_IN_MEMORY,
            macros: MacroList::new(),
            models: BTreeMap::new(),
            groups: BTreeMap::new(),
            hooks: HooksConfig::default(),
            api_keys: Vec::new(),
            peers: BTreeMap::new(),
            aliases: BTreeMap::new(),
        }
    }
}

/// Startup hook configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub on_startup: StartupHooks,
}

impl HooksConfig {
    pub fn is_empty(&self) -> bool {
        self.on_startup.preload.is_empty()
    }
}

/// Hooks run once when the manager comes up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupHooks {
    /// Models (or aliases) loaded eagerly at startup.
    pub preload: Vec<String>,
}

/// A remote llama-swap instance requests may be forwarded to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PeerConfig {
    pub proxy: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_key: String,
}

impl Config {
    /// Load and fully resolve a configuration from raw YAML bytes.
    pub fn from_yaml(bytes: &[u8]) -> Result<Self, ConfigError> {
        let raw = std::str::from_utf8(bytes)
            .map_err(|e| ConfigError::Validation(format!("config is not valid UTF-8: {e}")))?;
        let clean = substitute_env(raw)?;
        let mut config: Self = serde_yaml::from_str(&clean)?;
        config.resolve()?;
        Ok(config)
    }

    /// Load a configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path)?;
        Self::from_yaml(&bytes)
    }

    /// Resolve a requested model identifier: direct hit first, then the
    /// alias table.
    pub fn resolve_model_id<'a>(&'a self, requested: &'a str) -> Option<&'a str> {
        if self.models.contains_key(requested) {
            return Some(requested);
        }
        self.aliases.get(requested).map(String::as_str)
    }

    /// Alias → canonical ID table.
    pub fn aliases(&self) -> &BTreeMap<String, String> {
        &self.aliases
    }

    /// The group a model belongs to. Every model belongs to exactly one
    /// group after a successful resolve.
    pub fn group_of(&self, model_id: &str) -> Option<(&str, &GroupConfig)> {
        self.groups
            .iter()
            .find(|(_, g)| g.members.iter().any(|m| m == model_id))
            .map(|(id, g)| (id.as_str(), g))
    }

    fn resolve(&mut self) -> Result<(), ConfigError> {
        if self.start_port == 0 {
            return Err(ConfigError::Validation(
                "startPort must be >= 1".to_string(),
            ));
        }
        if self.health_check_timeout < MIN_HEALTH_CHECK_TIMEOUT {
            self.health_check_timeout = MIN_HEALTH_CHECK_TIMEOUT;
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logLevel must be one of {LOG_LEVELS:?}, got '{}'",
                self.log_level
            )));
        }

        self.macros.validate()?;
        self.expand_models()?;
        self.build_alias_table()?;
        self.partition_groups()?;
        self.validate_hooks()?;
        Ok(())
    }

    /// Expand macros and allocate ports, iterating models in sorted ID
    /// order so port assignment is deterministic.
    fn expand_models(&mut self) -> Result<(), ConfigError> {
        let mut next_port = self.start_port;

        // BTreeMap iteration is already sorted by model ID.
        for (id, model) in &mut self.models {
            if model.cmd.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "model '{id}': cmd is required"
                )));
            }
            model.macros.validate()?;

            // Merged ordered list: MODEL_ID first, then globals in order,
            // then per-model entries replacing in place or appending.
            let mut merged = MacroList::new();
            merged.set("MODEL_ID", MacroValue::String(id.clone()));
            for entry in &self.macros {
                merged.set(&entry.name, entry.value.clone());
            }
            for entry in &model.macros {
                merged.set(&entry.name, entry.value.clone());
            }

            model.cmd = merged.expand(&model.cmd);
            model.cmd_stop = merged.expand(&model.cmd_stop);
            model.proxy = merged.expand(&model.proxy);
            model.check_endpoint = merged.expand(&model.check_endpoint);
            for param in &mut model.filters.strip_params {
                *param = merged.expand(param);
            }
            merged.expand_tree(&mut model.metadata);

            let port_ref = macros::reference("PORT");
            if model.proxy.contains(&port_ref) && !model.cmd.contains(&port_ref) {
                return Err(ConfigError::PortNotInCmd(id.clone()));
            }
            if model.cmd.contains(&port_ref) {
                let mut port_macro = MacroList::new();
                port_macro.set("PORT", MacroValue::Int(i64::from(next_port)));
                next_port = next_port.wrapping_add(1);

                model.cmd = port_macro.expand(&model.cmd);
                model.cmd_stop = port_macro.expand(&model.cmd_stop);
                model.proxy = port_macro.expand(&model.proxy);
                port_macro.expand_tree(&mut model.metadata);
            }

            Self::check_unresolved(id, "cmd", &model.cmd)?;
            Self::check_unresolved(id, "proxy", &model.proxy)?;
            Self::check_unresolved(id, "checkEndpoint", &model.check_endpoint)?;
            for param in &model.filters.strip_params {
                Self::check_unresolved(id, "filters.stripParams", param)?;
            }
            // ${PID} survives in cmdStop; it is substituted at stop time.
            if let Some(name) = macros::find_unresolved(&model.cmd_stop) {
                if name != "PID" {
                    return Err(ConfigError::UnknownMacro {
                        model: id.clone(),
                        field: "cmdStop".to_string(),
                        name,
                    });
                }
            }
        }
        Ok(())
    }

    fn check_unresolved(model: &str, field: &str, value: &str) -> Result<(), ConfigError> {
        if let Some(name) = macros::find_unresolved(value) {
            return Err(ConfigError::UnknownMacro {
                model: model.to_string(),
                field: field.to_string(),
                name,
            });
        }
        Ok(())
    }

    fn build_alias_table(&mut self) -> Result<(), ConfigError> {
        self.aliases.clear();
        for (id, model) in &self.models {
            for alias in &model.aliases {
                if self.models.contains_key(alias) {
                    return Err(ConfigError::DuplicateAlias {
                        alias: alias.clone(),
                        model: id.clone(),
                        existing: format!("model '{alias}'"),
                    });
                }
                if let Some(existing) = self.aliases.get(alias) {
                    return Err(ConfigError::DuplicateAlias {
                        alias: alias.clone(),
                        model: id.clone(),
                        existing: format!("model '{existing}'"),
                    });
                }
                self.aliases.insert(alias.clone(), id.clone());
            }
        }
        Ok(())
    }

    /// Check that every model belongs to at most one group, then sweep the
    /// orphans into the synthetic `(default)` group, sorted.
    fn partition_groups(&mut self) -> Result<(), ConfigError> {
        let mut owner: BTreeMap<String, String> = BTreeMap::new();
        for (group_id, group) in &self.groups {
            for member in &group.members {
                if !self.models.contains_key(member) {
                    return Err(ConfigError::UnknownGroupMember {
                        group: group_id.clone(),
                        model: member.clone(),
                    });
                }
                if let Some(first) = owner.insert(member.clone(), group_id.clone()) {
                    return Err(ConfigError::DuplicateGroupMember {
                        model: member.clone(),
                        first,
                        second: group_id.clone(),
                    });
                }
            }
        }

        // Sorted because models is a BTreeMap.
        let orphans: Vec<String> = self
            .models
            .keys()
            .filter(|id| !owner.contains_key(*id))
            .cloned()
            .collect();
        if !orphans.is_empty() {
            self.groups
                .entry(DEFAULT_GROUP_ID.to_string())
                .or_default()
                .members
                .extend(orphans);
        }
        Ok(())
    }

    fn validate_hooks(&self) -> Result<(), ConfigError> {
        for entry in &self.hooks.on_startup.preload {
            if self.resolve_model_id(entry).is_none() {
                return Err(ConfigError::Validation(format!(
                    "hooks.on_startup.preload references unknown model '{entry}'"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(yaml: &str) -> Result<Config, ConfigError> {
        Config::from_yaml(yaml.as_bytes())
    }

    #[test]
    fn test_defaults_applied() {
        let config = load("models:\n  m1:\n    cmd: server --port ${PORT}\n").unwrap();
        assert_eq!(config.health_check_timeout, DEFAULT_HEALTH_CHECK_TIMEOUT);
        assert_eq!(config.start_port, DEFAULT_START_PORT);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.metrics_max_in_memory, DEFAULT_METRICS_MAX_IN_MEMORY);
    }

    #[test]
    fn test_health_check_timeout_clamped() {
        let config = load("healthCheckTimeout: 3\nmodels:\n  m:\n    cmd: x --port ${PORT}\n").unwrap();
        assert_eq!(config.health_check_timeout, MIN_HEALTH_CHECK_TIMEOUT);
    }

    #[test]
    fn test_zero_start_port_rejected() {
        let err = load("startPort: 0\nmodels:\n  m:\n    cmd: x --port ${PORT}\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let err = load("logLevel: loud\nmodels:\n  m:\n    cmd: x --port ${PORT}\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_port_allocation_is_sequential_and_sorted() {
        let config = load(concat!(
            "startPort: 6000\n",
            "models:\n",
            "  zeta:\n",
            "    cmd: server --port ${PORT}\n",
            "  alpha:\n",
            "    cmd: server --port ${PORT}\n",
        ))
        .unwrap();
        // alpha sorts first, so it gets the first port.
        assert!(config.models["alpha"].cmd.contains("--port 6000"));
        assert!(config.models["zeta"].cmd.contains("--port 6001"));
        assert_eq!(config.models["alpha"].proxy, "http://localhost:6000");
        assert_eq!(config.models["zeta"].proxy, "http://localhost:6001");
    }

    #[test]
    fn test_port_in_proxy_but_not_cmd_rejected() {
        let err = load(
            "models:\n  m:\n    cmd: server --port 9000\n    proxy: http://localhost:${PORT}\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::PortNotInCmd(model) if model == "m"));
    }

    #[test]
    fn test_explicit_proxy_without_port_is_fine() {
        let config = load(
            "models:\n  m:\n    cmd: server --port 9000\n    proxy: http://localhost:9000\n",
        )
        .unwrap();
        assert_eq!(config.models["m"].proxy, "http://localhost:9000");
    }

    #[test]
    fn test_model_id_macro_expansion() {
        let config = load(
            "macros:\n  run: \"podman run --name ${MODEL_ID} img\"\n\
             models:\n  my-m:\n    cmd: \"${run} -m x\"\n    proxy: http://localhost:9999\n",
        )
        .unwrap();
        assert_eq!(config.models["my-m"].cmd, "podman run --name my-m img -m x");
    }

    #[test]
    fn test_macro_lifo_backward_reference() {
        let config = load(
            "macros:\n  A: x\n  B: \"${A}\"\n\
             models:\n  m:\n    cmd: \"run ${B}\"\n    proxy: http://localhost:9999\n",
        )
        .unwrap();
        assert_eq!(config.models["m"].cmd, "run x");
    }

    #[test]
    fn test_macro_forward_reference_fails() {
        let err = load(
            "macros:\n  B: \"${A}\"\n  A: x\n\
             models:\n  m:\n    cmd: \"run ${B}\"\n    proxy: http://localhost:9999\n",
        )
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::UnknownMacro { ref name, .. } if name == "A"),
            "got {err:?}"
        );
    }

    #[test]
    fn test_unknown_macro_names_model_and_field() {
        let err = load(
            "models:\n  m:\n    cmd: \"run ${undefined}\"\n    proxy: http://localhost:9999\n",
        )
        .unwrap_err();
        match err {
            ConfigError::UnknownMacro { model, field, name } => {
                assert_eq!(model, "m");
                assert_eq!(field, "cmd");
                assert_eq!(name, "undefined");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_per_model_macro_overrides_global_in_place() {
        let config = load(concat!(
            "macros:\n",
            "  size: small\n",
            "  tail: \"end-${size}\"\n",
            "models:\n",
            "  m:\n",
            "    cmd: \"run ${tail}\"\n",
            "    proxy: http://localhost:9999\n",
            "    macros:\n",
            "      size: large\n",
        ))
        .unwrap();
        // The override keeps the global's position, so `tail` (defined
        // after `size`) still resolves against it.
        assert_eq!(config.models["m"].cmd, "run end-large");
    }

    #[test]
    fn test_pid_survives_in_cmd_stop_only() {
        let config = load(
            "models:\n  m:\n    cmd: server --port ${PORT}\n    cmdStop: \"kill ${PID}\"\n",
        )
        .unwrap();
        assert_eq!(config.models["m"].cmd_stop, "kill ${PID}");

        let err = load(
            "models:\n  m:\n    cmd: \"server ${PID}\"\n    proxy: http://localhost:9999\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownMacro { .. }));
    }

    #[test]
    fn test_metadata_macro_types_preserved() {
        let config = load(concat!(
            "macros:\n",
            "  ctx: 8192\n",
            "models:\n",
            "  m:\n",
            "    cmd: server --port ${PORT} -c ${ctx}\n",
            "    metadata:\n",
            "      context: \"${ctx}\"\n",
            "      port: \"${PORT}\"\n",
            "      label: \"ctx is ${ctx}\"\n",
        ))
        .unwrap();
        let json = config.models["m"].metadata_json().unwrap();
        assert_eq!(json["context"], serde_json::json!(8192));
        assert_eq!(json["port"], serde_json::json!(5800));
        assert_eq!(json["label"], serde_json::json!("ctx is 8192"));
    }

    #[test]
    fn test_group_partition_and_default_group() {
        let config = load(concat!(
            "models:\n",
            "  a:\n",
            "    cmd: x --port ${PORT}\n",
            "  b:\n",
            "    cmd: x --port ${PORT}\n",
            "  c:\n",
            "    cmd: x --port ${PORT}\n",
            "groups:\n",
            "  pair:\n",
            "    members: [b]\n",
        ))
        .unwrap();
        let default = &config.groups[DEFAULT_GROUP_ID];
        assert_eq!(default.members, ["a", "c"]);
        assert!(default.swap);
        assert!(default.exclusive);
        assert_eq!(config.group_of("b").unwrap().0, "pair");
    }

    #[test]
    fn test_model_in_two_groups_rejected() {
        let err = load(
            concat!(
                "models:\n  a:\n    cmd: x --port ${PORT}\n",
                "groups:\n",
                "  g1:\n    members: [a]\n",
                "  g2:\n    members: [a]\n",
            ),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateGroupMember { .. }));
    }

    #[test]
    fn test_unknown_group_member_rejected() {
        let err = load(
            "models:\n  a:\n    cmd: x --port ${PORT}\ngroups:\n  g:\n    members: [ghost]\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownGroupMember { .. }));
    }

    #[test]
    fn test_alias_resolution_and_conflicts() {
        let config = load(concat!(
            "models:\n",
            "  a:\n    cmd: x --port ${PORT}\n    aliases: [gpt-4o]\n",
            "  b:\n    cmd: x --port ${PORT}\n",
        ))
        .unwrap();
        assert_eq!(config.resolve_model_id("gpt-4o"), Some("a"));
        assert_eq!(config.resolve_model_id("b"), Some("b"));
        assert_eq!(config.resolve_model_id("nope"), None);

        let err = load(concat!(
            "models:\n",
            "  a:\n    cmd: x --port ${PORT}\n    aliases: [shared]\n",
            "  b:\n    cmd: x --port ${PORT}\n    aliases: [shared]\n",
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateAlias { .. }));

        let err = load(concat!(
            "models:\n",
            "  a:\n    cmd: x --port ${PORT}\n    aliases: [b]\n",
            "  b:\n    cmd: x --port ${PORT}\n",
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateAlias { .. }));
    }

    #[test]
    fn test_preload_must_resolve() {
        let err = load(
            "models:\n  a:\n    cmd: x --port ${PORT}\nhooks:\n  on_startup:\n    preload: [ghost]\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let config = load(
            "models:\n  a:\n    cmd: x --port ${PORT}\n    aliases: [quick]\n\
             hooks:\n  on_startup:\n    preload: [quick]\n",
        )
        .unwrap();
        assert_eq!(config.hooks.on_startup.preload, ["quick"]);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "models:\n  m:\n    cmd: server --port ${PORT}\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert!(config.models.contains_key("m"));

        let err = Config::from_file(dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_resolver_round_trip() {
        let config = load(concat!(
            "startPort: 7000\n",
            "macros:\n",
            "  base: \"--host 127.0.0.1\"\n",
            "models:\n",
            "  a:\n",
            "    cmd: server ${base} --port ${PORT}\n",
            "    aliases: [fast]\n",
            "    ttl: 30\n",
            "    metadata:\n",
            "      size: 7\n",
            "  b:\n",
            "    cmd: server ${base} --port ${PORT}\n",
            "groups:\n",
            "  main:\n",
            "    members: [a, b]\n",
        ))
        .unwrap();

        let marshalled = serde_yaml::to_string(&config).unwrap();
        let reparsed = Config::from_yaml(marshalled.as_bytes()).unwrap();
        assert_eq!(config, reparsed);
    }
}
