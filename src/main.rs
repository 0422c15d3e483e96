use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use graderd::broker::amqp::AmqpConnector;
use graderd::config::{Config, GraderConfig};
use graderd::error::GraderdError;
use graderd::grader::{self, Grader};
use graderd::repo::{self, SshKeyAuth};
use graderd::shutdown::install_shutdown_handler;
use graderd::worker::Worker;

const ROOT_ENV_KEY: &str = "GRADERD_ROOT";

#[derive(Parser, Debug)]
#[command(name = "graderd")]
#[command(version)]
#[command(about = "Queue-driven autograding worker")]
struct Args {
    /// Worker root directory holding configuration.yml and the grading
    /// assets; defaults to $GRADERD_ROOT.
    #[arg(long)]
    root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let root = match args
        .root
        .or_else(|| std::env::var(ROOT_ENV_KEY).ok().map(PathBuf::from))
    {
        Some(root) => root,
        None => {
            return Err(
                GraderdError::Config(format!("--root not given and {ROOT_ENV_KEY} not set"))
                    .into(),
            )
        }
    };
    tracing::info!(root = %root.display(), "starting graderd");

    let config = Config::load(&root)?;

    // git2 is blocking; keep the sync off the runtime workers.
    let grader_root = grader::grader_root(&root);
    let repo_config = config.grader_repo.clone();
    let sync_dest = grader_root.clone();
    tokio::task::spawn_blocking(move || {
        let auth = SshKeyAuth::from(&repo_config.credentials);
        repo::sync(&repo_config.repo_url, &repo_config.commit, &sync_dest, &auth)
    })
    .await??;

    let grader_config = GraderConfig::load(&grader_root)?;
    let grader = Arc::new(Grader::new(&root, grader_config.grader));
    grader.run_init().await;

    let shutdown = install_shutdown_handler();
    let worker = Worker::new(Arc::new(AmqpConnector), grader, config.amqp.clone());
    worker.run(shutdown).await;

    Ok(())
}
