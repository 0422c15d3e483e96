use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use super::command::{self, Outcome};

/// Per-command timeout for the list stages (init/setup/cleanup). The
/// grade command gets its own configured budget.
pub const STAGE_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Setup,
    Grade,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Init => write!(f, "init"),
            Stage::Setup => write!(f, "setup"),
            Stage::Grade => write!(f, "grade"),
            Stage::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Run every command of a list stage in order. A failing command (bad
/// exit, timeout, spawn error) is logged and the rest of the stage still
/// runs; grading reports a best-effort score either way.
pub async fn run_stage(
    stage: Stage,
    commands: &[Vec<String>],
    dir: &Path,
    env: &HashMap<String, String>,
    gid: &str,
) {
    for (index, argv) in commands.iter().enumerate() {
        tracing::info!(gid, stage = %stage, index, command = %argv.join(" "), "running stage command");
        match command::run(argv, dir, env, STAGE_COMMAND_TIMEOUT).await {
            Outcome::Completed { exit_code, output } => {
                tracing::debug!(
                    gid,
                    stage = %stage,
                    index,
                    output = %String::from_utf8_lossy(&output).trim_end(),
                    "stage command output"
                );
                if exit_code != 0 {
                    tracing::warn!(gid, stage = %stage, index, exit_code, "stage command failed");
                }
            }
            Outcome::TimedOut => {
                tracing::warn!(
                    gid,
                    stage = %stage,
                    index,
                    timeout_secs = STAGE_COMMAND_TIMEOUT.as_secs(),
                    "stage command timed out"
                );
            }
            Outcome::SpawnFailed(reason) => {
                tracing::warn!(gid, stage = %stage, index, reason = %reason, "stage command could not run");
            }
        }
    }
}

/// Run the single grade command and hand its outcome to the caller; the
/// exit code doubles as the score.
pub async fn run_grade(
    argv: &[String],
    dir: &Path,
    env: &HashMap<String, String>,
    gid: &str,
    timeout: Duration,
) -> Outcome {
    tracing::info!(gid, stage = %Stage::Grade, command = %argv.join(" "), "running grade command");
    let outcome = command::run(argv, dir, env, timeout).await;
    match &outcome {
        Outcome::Completed { exit_code, output } => {
            tracing::debug!(
                gid,
                stage = %Stage::Grade,
                output = %String::from_utf8_lossy(output).trim_end(),
                "grade command output"
            );
            tracing::info!(gid, stage = %Stage::Grade, score = *exit_code, "grade command exited");
        }
        Outcome::TimedOut => {
            tracing::warn!(gid, stage = %Stage::Grade, timeout_secs = timeout.as_secs(), "grade command timed out");
        }
        Outcome::SpawnFailed(reason) => {
            tracing::warn!(gid, stage = %Stage::Grade, reason = %reason, "grade command could not run");
        }
    }
    outcome
}
