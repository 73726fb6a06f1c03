//! `${env.NAME}` substitution.
//!
//! Environment references are resolved on the raw YAML *before* parsing, so
//! they may appear anywhere a scalar can. The text is first round-tripped
//! through the YAML parser, which strips comments and normalizes quoting;
//! the clean form is then scanned for references.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ConfigError;

static ENV_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{env\.([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Substitute every `${env.NAME}` in `raw` from the process environment.
///
/// Returns the comment-stripped YAML with references replaced. A missing
/// variable is fatal, as is a value containing a newline or NUL byte
/// (either would corrupt the YAML structure).
pub fn substitute_env(raw: &str) -> Result<String, ConfigError> {
    substitute_env_with(raw, |name| std::env::var(name).ok())
}

/// [`substitute_env`] with an injectable lookup, for tests.
pub fn substitute_env_with<F>(raw: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // Round-trip to drop comments so commented-out references are ignored.
    let value: serde_yaml::Value = serde_yaml::from_str(raw)?;
    let clean = serde_yaml::to_string(&value)?;
    if !clean.contains("${env.") {
        return Ok(clean);
    }

    let mut out = String::with_capacity(clean.len());
    let mut last = 0;
    for caps in ENV_REF_RE.captures_iter(&clean) {
        let whole = caps.get(0).expect("capture 0 always present");
        let name = &caps[1];
        let replacement = lookup(name).ok_or_else(|| ConfigError::MissingEnv(name.to_string()))?;
        if replacement.contains('\n') || replacement.contains('\0') {
            return Err(ConfigError::UnsafeEnv(name.to_string()));
        }
        out.push_str(&clean[last..whole.start()]);
        out.push_str(&replacement);
        last = whole.end();
    }
    out.push_str(&clean[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_env(name: &str) -> Option<String> {
        match name {
            "MODEL_DIR" => Some("/srv/models".to_string()),
            "THREADS" => Some("8".to_string()),
            "EVIL" => Some("a\nb".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_substitutes_known_variables() {
        let yaml = "cmd: server -m ${env.MODEL_DIR}/x.gguf -t ${env.THREADS}\n";
        let out = substitute_env_with(yaml, fake_env).unwrap();
        assert!(out.contains("/srv/models/x.gguf"));
        assert!(out.contains("-t 8"));
    }

    #[test]
    fn test_missing_variable_is_fatal() {
        let yaml = "cmd: ${env.NOPE}\n";
        let err = substitute_env_with(yaml, fake_env).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv(name) if name == "NOPE"));
    }

    #[test]
    fn test_newline_value_rejected() {
        let yaml = "cmd: ${env.EVIL}\n";
        let err = substitute_env_with(yaml, fake_env).unwrap_err();
        assert!(matches!(err, ConfigError::UnsafeEnv(name) if name == "EVIL"));
    }

    #[test]
    fn test_commented_reference_ignored() {
        let yaml = "cmd: ok\n# unused: ${env.NOPE}\n";
        let out = substitute_env_with(yaml, fake_env).unwrap();
        assert!(out.contains("ok"));
        assert!(!out.contains("NOPE"));
    }

    #[test]
    fn test_no_references_passes_through() {
        let yaml = "cmd: plain\n";
        let out = substitute_env_with(yaml, fake_env).unwrap();
        assert!(out.contains("plain"));
    }
}
