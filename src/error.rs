use thiserror::Error;

use crate::broker::BrokerError;

#[derive(Error, Debug)]
pub enum GraderdError {
    #[error("malformed job payload: {0}")]
    MalformedJob(String),

    #[error("workspace: {0}")]
    Workspace(#[from] std::io::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("configuration: {0}")]
    Config(String),

    #[error("configuration parse: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("repository sync: {0}")]
    RepoSync(#[from] git2::Error),
}

pub type Result<T> = std::result::Result<T, GraderdError>;
