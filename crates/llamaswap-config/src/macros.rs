//! Ordered macro lists and single-pass LIFO substitution.
//!
//! Macros are `(name, value)` pairs whose *definition order matters*: the
//! expansion pass walks the merged list from last to first, so a macro may
//! reference any macro defined earlier in the list. Forward references are
//! unresolvable and surface as unknown-macro errors after the pass.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Maximum length of a string macro value.
pub const MAX_MACRO_VALUE_LEN: usize = 1023;

/// Names reserved for the resolver and runtime.
pub const RESERVED_MACRO_NAMES: &[&str] = &["PORT", "MODEL_ID", "PID"];

/// Valid macro names: 1-63 chars of `[A-Za-z0-9_-]`.
static MACRO_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,63}$").unwrap());

/// Matches any `${...}` reference, including dotted forms like `${env.HOME}`.
static MACRO_REF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap());

/// A scalar macro value. Integers, floats, and booleans keep their type so
/// whole-value metadata references can preserve it.
#[derive(Debug, Clone, PartialEq)]
pub enum MacroValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl MacroValue {
    /// Render the value as the text substituted into string fields.
    pub fn render(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }

    /// Convert a YAML scalar into a macro value. Returns `None` for
    /// sequences, mappings, and nulls.
    pub fn from_yaml(value: &serde_yaml::Value) -> Option<Self> {
        match value {
            serde_yaml::Value::String(s) => Some(Self::String(s.clone())),
            serde_yaml::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Self::Int(i))
                } else {
                    n.as_f64().map(Self::Float)
                }
            }
            _ => None,
        }
    }

    /// Convert back to a YAML scalar, preserving the original type.
    pub fn to_yaml(&self) -> serde_yaml::Value {
        match self {
            Self::String(s) => serde_yaml::Value::String(s.clone()),
            Self::Int(i) => serde_yaml::Value::Number((*i).into()),
            Self::Float(f) => serde_yaml::Value::Number(serde_yaml::Number::from(*f)),
            Self::Bool(b) => serde_yaml::Value::Bool(*b),
        }
    }
}

impl fmt::Display for MacroValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// One named macro definition.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroEntry {
    pub name: String,
    pub value: MacroValue,
}

/// An ordered sequence of macro definitions.
///
/// Backed by a list of pairs rather than a hash map: substitution is
/// single-pass and LIFO, so position is part of the contract.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MacroList(Vec<MacroEntry>);

impl MacroList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Replace an existing entry in place (keeping its position) or append.
    pub fn set(&mut self, name: &str, value: MacroValue) {
        if let Some(entry) = self.0.iter_mut().find(|e| e.name == name) {
            entry.value = value;
        } else {
            self.0.push(MacroEntry {
                name: name.to_string(),
                value,
            });
        }
    }

    /// Insert an entry at the front of the list.
    pub fn prepend(&mut self, name: &str, value: MacroValue) {
        self.0.insert(
            0,
            MacroEntry {
                name: name.to_string(),
                value,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&MacroValue> {
        self.0.iter().find(|e| e.name == name).map(|e| &e.value)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MacroEntry> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Validate every entry: name shape, reserved names, value length, and
    /// self-reference.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for entry in &self.0 {
            if !MACRO_NAME_RE.is_match(&entry.name) {
                return Err(ConfigError::InvalidMacro {
                    name: entry.name.clone(),
                    reason: "name must match [A-Za-z0-9_-]{1,63}".to_string(),
                });
            }
            if RESERVED_MACRO_NAMES.contains(&entry.name.as_str()) {
                return Err(ConfigError::InvalidMacro {
                    name: entry.name.clone(),
                    reason: "name is reserved".to_string(),
                });
            }
            if let MacroValue::String(s) = &entry.value {
                if s.len() > MAX_MACRO_VALUE_LEN {
                    return Err(ConfigError::InvalidMacro {
                        name: entry.name.clone(),
                        reason: format!("value exceeds {MAX_MACRO_VALUE_LEN} characters"),
                    });
                }
                if s.contains(&reference(&entry.name)) {
                    return Err(ConfigError::InvalidMacro {
                        name: entry.name.clone(),
                        reason: "value references itself".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Single-pass LIFO substitution over a string: iterate entries from
    /// last to first, replacing `${name}` with the rendered value.
    pub fn expand(&self, input: &str) -> String {
        if !input.contains("${") {
            return input.to_string();
        }
        let mut out = input.to_string();
        for entry in self.0.iter().rev() {
            let needle = reference(&entry.name);
            if out.contains(&needle) {
                out = out.replace(&needle, &entry.value.render());
            }
        }
        out
    }

    /// LIFO substitution over a YAML tree, recursing into mappings and
    /// sequences. A string leaf that is *exactly* `${name}` is replaced by
    /// the raw typed value; any other occurrence is stringified in place.
    pub fn expand_tree(&self, value: &mut serde_yaml::Value) {
        for entry in self.0.iter().rev() {
            expand_tree_one(value, &entry.name, &entry.value);
        }
    }
}

impl<'a> IntoIterator for &'a MacroList {
    type Item = &'a MacroEntry;
    type IntoIter = std::slice::Iter<'a, MacroEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// Serialized as a YAML mapping; `serde_yaml::Mapping` preserves document
// order on both directions, which is what keeps the list ordered across a
// marshal/unmarshal round trip.
impl Serialize for MacroList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for entry in &self.0 {
            map.serialize_entry(&entry.name, &entry.value.to_yaml())?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MacroList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mapping = serde_yaml::Mapping::deserialize(deserializer)?;
        let mut list = Self::new();
        for (key, value) in &mapping {
            let name = key
                .as_str()
                .ok_or_else(|| de::Error::custom("macro names must be strings"))?;
            let value = MacroValue::from_yaml(value).ok_or_else(|| {
                de::Error::custom(format!(
                    "macro '{name}' must be a string, integer, float, or boolean"
                ))
            })?;
            // Duplicate keys in a YAML mapping already fail parsing, so a
            // plain push preserves document order.
            list.0.push(MacroEntry {
                name: name.to_string(),
                value,
            });
        }
        Ok(list)
    }
}

/// The `${name}` form of a macro reference.
pub fn reference(name: &str) -> String {
    format!("${{{name}}}")
}

/// Find the first remaining `${...}` reference in a string, if any.
pub fn find_unresolved(input: &str) -> Option<String> {
    MACRO_REF_RE
        .captures(input)
        .map(|caps| caps[1].to_string())
}

fn expand_tree_one(value: &mut serde_yaml::Value, name: &str, macro_value: &MacroValue) {
    match value {
        serde_yaml::Value::String(s) => {
            let needle = reference(name);
            if s.as_str() == needle {
                // Whole-value match keeps the macro's scalar type.
                *value = macro_value.to_yaml();
            } else if s.contains(&needle) {
                *s = s.replace(&needle, &macro_value.render());
            }
        }
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                expand_tree_one(item, name, macro_value);
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                expand_tree_one(v, name, macro_value);
            }
        }
        _ => {}
    }
}
