//! Configuration load errors.
//!
//! Every problem with a config file is surfaced at load time through this
//! enum; the resolver never returns a partially expanded [`crate::Config`].

use thiserror::Error;

/// Error produced while loading or resolving a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The YAML could not be parsed into the expected shape.
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// `${env.NAME}` referenced a variable that is not set.
    #[error("environment variable '{0}' is not set")]
    MissingEnv(String),

    /// An environment variable value cannot be spliced into YAML safely.
    #[error("environment variable '{0}' contains a newline or NUL byte")]
    UnsafeEnv(String),

    /// A macro failed name, type, or length validation.
    #[error("macro '{name}': {reason}")]
    InvalidMacro { name: String, reason: String },

    /// A `${...}` reference survived substitution.
    #[error("model '{model}': unknown macro '{name}' in {field}")]
    UnknownMacro {
        model: String,
        field: String,
        name: String,
    },

    /// `${PORT}` appeared in the proxy URL without a matching use in cmd.
    #[error("model '{0}': ${{PORT}} appears in proxy but not in cmd")]
    PortNotInCmd(String),

    /// A model was listed as a member of more than one group.
    #[error("model '{model}' is a member of both group '{first}' and group '{second}'")]
    DuplicateGroupMember {
        model: String,
        first: String,
        second: String,
    },

    /// A group member list named a model that does not exist.
    #[error("group '{group}' references unknown model '{model}'")]
    UnknownGroupMember { group: String, model: String },

    /// The same alias was claimed by two models, or shadows a model ID.
    #[error("alias '{alias}' of model '{model}' conflicts with '{existing}'")]
    DuplicateAlias {
        alias: String,
        model: String,
        existing: String,
    },

    /// A field value is out of its allowed range.
    #[error("{0}")]
    Validation(String),
}
