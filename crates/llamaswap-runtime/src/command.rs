//! Command template parsing and child construction.
//!
//! Command templates are shell-like multi-line strings: `#`-comment lines
//! are stripped and trailing `\` continuations joined before tokenization.

use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;

/// Error parsing or building a command template.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command is empty after stripping comments")]
    Empty,

    #[error("failed to tokenize command: {0}")]
    Tokenize(#[from] shell_words::ParseError),

    #[error("invalid environment entry '{0}', expected KEY=VALUE")]
    BadEnvEntry(String),
}

/// Tokenize a command template into argv.
///
/// Comment lines are dropped, trailing `\` joins the next line, and the
/// remainder is split with POSIX shell quoting rules.
pub fn split_command(template: &str) -> Result<Vec<String>, CommandError> {
    let mut joined = String::with_capacity(template.len());
    for line in template.lines() {
        if line.trim_start().starts_with('#') {
            continue;
        }
        let trimmed = line.trim_end();
        if let Some(stripped) = trimmed.strip_suffix('\\') {
            joined.push_str(stripped);
            joined.push(' ');
        } else {
            joined.push_str(trimmed);
            joined.push(' ');
        }
    }

    let args = shell_words::split(&joined)?;
    if args.is_empty() {
        return Err(CommandError::Empty);
    }
    Ok(args)
}

/// Build a [`Command`] from argv and `KEY=VALUE` environment entries, with
/// stdio piped for log capture.
pub fn build_command(args: &[String], env: &[String]) -> Result<Command, CommandError> {
    let (program, rest) = args.split_first().ok_or(CommandError::Empty)?;
    let mut cmd = Command::new(program);
    cmd.args(rest);
    for entry in env {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| CommandError::BadEnvEntry(entry.clone()))?;
        cmd.env(key, value);
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_simple() {
        let args = split_command("server -m model.gguf --port 9001").unwrap();
        assert_eq!(args, ["server", "-m", "model.gguf", "--port", "9001"]);
    }

    #[test]
    fn test_split_respects_quotes() {
        let args = split_command("server -m \"my model.gguf\"").unwrap();
        assert_eq!(args, ["server", "-m", "my model.gguf"]);
    }

    #[test]
    fn test_comment_lines_stripped() {
        let args = split_command("# launch settings\nserver --port 9001\n# done\n").unwrap();
        assert_eq!(args, ["server", "--port", "9001"]);
    }

    #[test]
    fn test_trailing_backslash_continuation() {
        let args = split_command("server \\\n  --port 9001 \\\n  --slots 4\n").unwrap();
        assert_eq!(args, ["server", "--port", "9001", "--slots", "4"]);
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(split_command("# nothing"), Err(CommandError::Empty)));
        assert!(matches!(split_command("   "), Err(CommandError::Empty)));
    }

    #[test]
    fn test_unbalanced_quote_rejected() {
        assert!(matches!(
            split_command("server -m \"oops"),
            Err(CommandError::Tokenize(_))
        ));
    }

    #[test]
    fn test_build_command_bad_env() {
        let args = vec!["echo".to_string()];
        let err = build_command(&args, &["NOEQUALS".to_string()]).unwrap_err();
        assert!(matches!(err, CommandError::BadEnvEntry(e) if e == "NOEQUALS"));
    }
}
