//! Job execution engine.
//!
//! [`Grader`] turns one raw queue payload into a [`GradeReport`]: it
//! parses the job identifier, sets up an ephemeral workspace, drives the
//! setup → grade → cleanup pipeline over it, and maps the grade command's
//! outcome to a score. The workspace is removed on every exit path,
//! including panics inside a stage.

pub mod command;
pub mod stage;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::config::StageConfig;
use crate::error::{GraderdError, Result};
use self::command::Outcome;
use self::stage::Stage;

/// Directory under the worker root holding the synced grading assets.
pub const GRADER_DIR: &str = "_grader";
/// Well-known file name the raw job payload is persisted under, so stage
/// commands can read job details from `${GRADERD_JOB_DIR}`.
pub const JOB_FILE_NAME: &str = "job.json";

pub const ENV_GRADER_ROOT: &str = "GRADERD_GRADER_ROOT";
pub const ENV_JOB_DIR: &str = "GRADERD_JOB_DIR";

/// Sentinel score when the grade command exceeds its timeout. Follows the
/// `timeout(1)` convention so it can never be confused with a real zero
/// exit.
pub const SCORE_TIMED_OUT: i32 = 124;
/// Sentinel score when the grade command cannot be started at all.
pub const SCORE_SPAWN_FAILED: i32 = 127;

pub fn grader_root(root: &Path) -> PathBuf {
    root.join(GRADER_DIR)
}

/// Outcome of one grading job, assembled from the grade stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradeReport {
    pub gid: String,
    pub score: i32,
    pub feedback: String,
}

#[derive(Deserialize)]
struct JobEnvelope {
    gid: String,
}

/// Extract the job identifier from a raw payload. Anything without a
/// non-empty `gid` is a malformed job and never reaches a workspace.
pub fn parse_gid(payload: &[u8]) -> Result<String> {
    let envelope: JobEnvelope = serde_json::from_slice(payload)
        .map_err(|err| GraderdError::MalformedJob(err.to_string()))?;
    if envelope.gid.is_empty() {
        return Err(GraderdError::MalformedJob("empty gid".to_string()));
    }
    Ok(envelope.gid)
}

pub struct Grader {
    root: PathBuf,
    stages: StageConfig,
    grade_timeout: Duration,
}

impl Grader {
    pub fn new(root: impl Into<PathBuf>, stages: StageConfig) -> Self {
        let grade_timeout = Duration::from_secs(stages.grade_timeout);
        Self {
            root: root.into(),
            stages,
            grade_timeout,
        }
    }

    pub fn grader_root(&self) -> PathBuf {
        grader_root(&self.root)
    }

    /// One-time init pipeline, run at process startup outside any job's
    /// lifetime. No workspace is involved; commands run in the grading
    /// assets directory with only the grader root in their environment.
    pub async fn run_init(&self) {
        let root = self.grader_root();
        let env = HashMap::from([(ENV_GRADER_ROOT.to_string(), root.display().to_string())]);
        stage::run_stage(Stage::Init, &self.stages.init_commands, &root, &env, "").await;
    }

    /// Grade one job payload.
    ///
    /// Setup, grade, and cleanup always run in that order irrespective of
    /// each other's outcomes: a broken setup still grades (best-effort
    /// score), and cleanup always gets its chance to tear down whatever
    /// the earlier stages left behind outside the workspace.
    pub async fn grade(&self, payload: &[u8]) -> Result<GradeReport> {
        let gid = parse_gid(payload)?;
        tracing::info!(gid = %gid, "starting grading job");

        // Dropped (and thus removed) on every path out of this function.
        let workspace = tempfile::Builder::new()
            .prefix("job_")
            .tempdir_in(&self.root)?;
        tokio::fs::write(workspace.path().join(JOB_FILE_NAME), payload).await?;

        let env = HashMap::from([
            (
                ENV_GRADER_ROOT.to_string(),
                self.grader_root().display().to_string(),
            ),
            (
                ENV_JOB_DIR.to_string(),
                workspace.path().display().to_string(),
            ),
        ]);

        stage::run_stage(
            Stage::Setup,
            &self.stages.setup_commands,
            workspace.path(),
            &env,
            &gid,
        )
        .await;
        let outcome = stage::run_grade(
            &self.stages.grade_command,
            workspace.path(),
            &env,
            &gid,
            self.grade_timeout,
        )
        .await;
        stage::run_stage(
            Stage::Cleanup,
            &self.stages.cleanup_commands,
            workspace.path(),
            &env,
            &gid,
        )
        .await;

        let (score, feedback) = match outcome {
            Outcome::Completed { exit_code, output } => {
                (exit_code, String::from_utf8_lossy(&output).into_owned())
            }
            Outcome::TimedOut => (
                SCORE_TIMED_OUT,
                format!(
                    "grade command timed out after {}s",
                    self.grade_timeout.as_secs()
                ),
            ),
            Outcome::SpawnFailed(reason) => (
                SCORE_SPAWN_FAILED,
                format!("grade command could not run: {reason}"),
            ),
        };
        tracing::info!(gid = %gid, score, "grading finished");
        Ok(GradeReport {
            gid,
            score,
            feedback,
        })
    }
}
