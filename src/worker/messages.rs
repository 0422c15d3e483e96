use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::grader::GradeReport;

/// Published to the started queue before a job begins grading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedMessage {
    pub gid: String,
    pub time: DateTime<Utc>,
}

/// Published to the result queue once a job finishes grading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub gid: String,
    pub grading: Grading,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grading {
    pub score: i32,
    pub feedback: String,
}

impl From<GradeReport> for ResultMessage {
    fn from(report: GradeReport) -> Self {
        Self {
            gid: report.gid,
            grading: Grading {
                score: report.score,
                feedback: report.feedback,
            },
        }
    }
}
