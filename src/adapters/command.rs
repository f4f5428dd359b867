//! Subprocess collaborators.
//!
//! Used for an externally provided training job and for the `up`/`down`
//! infrastructure hooks. The child is killed if the call is dropped (for
//! example when the stage timeout fires).

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::core::CollaboratorError;

use super::{Collaborator, StageContext, StageOutput};

/// How much stderr to keep in a failure message
const STDERR_TAIL: usize = 2000;

/// A command line from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment for the child
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory (defaults to the current one)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Program and arguments as one display string
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured output of a successful command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Last non-empty stdout line, used as a summary
    pub fn last_line(&self) -> Option<&str> {
        self.stdout.lines().rev().map(str::trim).find(|l| !l.is_empty())
    }
}

/// Run a command to completion; a non-zero exit is an error carrying the stderr tail
pub async fn run_command(
    spec: &CommandSpec,
    extra_env: &[(&str, String)],
    limit: Option<Duration>,
) -> Result<CommandOutput, CollaboratorError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(&spec.env)
        .envs(extra_env.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref cwd) = spec.cwd {
        command.current_dir(cwd);
    }

    debug!(command = %spec.display(), "Spawning command");
    let child = command.spawn()?;

    let output = match limit {
        Some(limit) => timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| CollaboratorError::Timeout(limit))??,
        None => child.wait_with_output().await?,
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(CollaboratorError::Command {
            command: spec.display(),
            code: output.status.code().unwrap_or(-1),
            stderr: tail(stderr.trim(), STDERR_TAIL),
        });
    }

    Ok(CommandOutput { stdout, stderr })
}

fn tail(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    let skip = count - max;
    format!("...{}", s.chars().skip(skip).collect::<String>())
}

/// Stage collaborator that runs a configured command
pub struct CommandCollaborator {
    name: String,
    spec: CommandSpec,
}

impl CommandCollaborator {
    pub fn new(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Run with the run context exported as environment variables
    pub async fn run(&self, ctx: &StageContext, extra_env: &[(&str, String)]) -> Result<CommandOutput, CollaboratorError> {
        let mut env = vec![
            ("HEALTHPIPE_RUN_ID", ctx.run_id.to_string()),
            ("HEALTHPIPE_STAGE", ctx.stage.to_string()),
            ("HEALTHPIPE_ATTEMPT", ctx.attempt.to_string()),
        ];
        env.extend(extra_env.iter().map(|(k, v)| (*k, v.clone())));
        run_command(&self.spec, &env, None).await
    }
}

#[async_trait]
impl Collaborator for CommandCollaborator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, CollaboratorError> {
        let output = self.run(ctx, &[]).await?;
        info!(command = %self.spec.display(), "Command completed");

        let summary = output
            .last_line()
            .map(str::to_string)
            .unwrap_or_else(|| format!("'{}' completed", self.spec.display()));
        Ok(StageOutput::materialized(0, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunId, Stage};

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    fn ctx() -> StageContext {
        StageContext {
            run_id: RunId::generate(),
            stage: Stage::Train,
            attempt: 1,
            upstream: None,
        }
    }

    #[test]
    fn test_spec_parsing() {
        let spec: CommandSpec = serde_yaml::from_str(
            "program: python\nargs: [ml/train.py]\nenv:\n  MLFLOW_TRACKING_URI: http://localhost:5000\n",
        )
        .unwrap();
        assert_eq!(spec.display(), "python ml/train.py");
        assert_eq!(spec.env.len(), 1);
    }

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("abcdef", 3), "...def");
        assert_eq!(tail("abc", 3), "abc");
    }

    #[tokio::test]
    async fn test_command_success_summary() {
        let collaborator = CommandCollaborator::new("train", sh("echo fitting; echo best model: ridge"));
        let output = collaborator.execute(&ctx()).await.unwrap();
        let StageOutput::Materialized { summary, .. } = output else {
            panic!("commands materialize");
        };
        assert_eq!(summary, "best model: ridge");
    }

    #[tokio::test]
    async fn test_command_sees_run_context() {
        let collaborator = CommandCollaborator::new("train", sh("test \"$HEALTHPIPE_STAGE\" = train"));
        assert!(collaborator.execute(&ctx()).await.is_ok());
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let collaborator = CommandCollaborator::new("train", sh("echo 'no data' >&2; exit 3"));
        let err = collaborator.execute(&ctx()).await.unwrap_err();
        assert!(matches!(
            err,
            CollaboratorError::Command { code: 3, ref stderr, .. } if stderr == "no data"
        ));
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let err = run_command(&sh("sleep 5"), &[], Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Timeout(_)));
    }
}
