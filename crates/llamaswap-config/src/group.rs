//! Process group policy configuration.

use serde::{Deserialize, Serialize};

/// ID of the synthetic group that collects models not named in any
/// user-defined group.
pub const DEFAULT_GROUP_ID: &str = "(default)";

/// Swap/exclusive/persistent policy for a set of models.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Only one member may be running at a time; loading one stops the rest.
    pub swap: bool,

    /// Starting any member unloads the members of every *other* exclusive,
    /// non-persistent group.
    pub exclusive: bool,

    /// Members of this group are immune to exclusive eviction.
    pub persistent: bool,

    /// Member model IDs, in declaration order.
    pub members: Vec<String>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            swap: true,
            exclusive: true,
            persistent: false,
            members: Vec::new(),
        }
    }
}
