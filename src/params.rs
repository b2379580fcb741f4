/// Query parameter evaluation: `$(command)` parameters are replaced with the
/// trimmed stdout of running that command through `/bin/sh -c`.
use regex::Regex;
use serde::Deserialize;
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;
use tokio::process::Command;

static COMMAND_SUBSTITUTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A\$\((.*)\)\z").unwrap());

/// A positional query parameter as written in the query file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Param {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Null,
}

/// Errors from running a `$(...)` parameter command.
#[derive(Debug)]
pub enum CommandSubstitutionError {
    /// The shell could not be started.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// The command ran but exited unsuccessfully.
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

impl std::fmt::Display for CommandSubstitutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandSubstitutionError::Spawn { command, source } => {
                write!(f, "failed to run parameter command {command:?}: {source}")
            }
            CommandSubstitutionError::Failed {
                command,
                status,
                stderr,
            } => {
                write!(f, "parameter command {command:?} failed ({status})")?;
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for CommandSubstitutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandSubstitutionError::Spawn { source, .. } => Some(source),
            CommandSubstitutionError::Failed { .. } => None,
        }
    }
}

/// Evaluate `params` in order. Non-string parameters and strings that are not
/// entirely `$(...)` pass through unchanged. Any failing command fails the
/// whole evaluation.
pub async fn eval_params(params: &[Param]) -> Result<Vec<Param>, CommandSubstitutionError> {
    let mut evaluated = Vec::with_capacity(params.len());

    for param in params {
        let command = match param {
            Param::Text(s) => COMMAND_SUBSTITUTION
                .captures(s)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string()),
            _ => None,
        };

        match command {
            Some(command) => evaluated.push(Param::Text(run_command(&command).await?)),
            None => evaluated.push(param.clone()),
        }
    }

    Ok(evaluated)
}

async fn run_command(command: &str) -> Result<String, CommandSubstitutionError> {
    tracing::debug!(command, "evaluating parameter command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| CommandSubstitutionError::Spawn {
            command: command.to_string(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(CommandSubstitutionError::Failed {
            command: command.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
