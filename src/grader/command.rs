use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time;

/// Classification of a single command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { exit_code: i32, output: Vec<u8> },
    TimedOut,
    SpawnFailed(String),
}

/// Run one command under `dir` with `env` layered over the ambient
/// environment, bounded by `timeout` of wall-clock time.
///
/// `${NAME}` placeholders in the argv are expanded before the process is
/// spawned: the invocation env wins, the ambient process environment is
/// the fallback, and unresolved names expand to the empty string.
/// Stdout and stderr are captured into one buffer. A process that
/// outlives `timeout` is killed and reported as [`Outcome::TimedOut`];
/// its exit wait is reaped on a detached task so the caller never blocks
/// on the kill.
pub async fn run(
    argv: &[String],
    dir: &Path,
    env: &HashMap<String, String>,
    timeout: Duration,
) -> Outcome {
    if argv.is_empty() {
        return Outcome::SpawnFailed("empty command".to_string());
    }
    let argv = expand_args(argv, env);

    let mut child = match Command::new(&argv[0])
        .args(&argv[1..])
        .current_dir(dir)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => return Outcome::SpawnFailed(format!("{}: {err}", argv[0])),
    };
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let finished = {
        let wait = async {
            let mut output = Vec::new();
            let mut trailer = Vec::new();
            let _ = tokio::join!(
                drain_pipe(stdout, &mut output),
                drain_pipe(stderr, &mut trailer)
            );
            output.extend_from_slice(&trailer);
            (child.wait().await, output)
        };
        tokio::pin!(wait);
        tokio::select! {
            finished = &mut wait => Some(finished),
            _ = time::sleep(timeout) => None,
        }
    };

    match finished {
        Some((Ok(status), output)) => Outcome::Completed {
            exit_code: exit_code_of(status),
            output,
        },
        Some((Err(err), _)) => Outcome::SpawnFailed(format!("wait for {}: {err}", argv[0])),
        None => {
            if let Err(err) = child.start_kill() {
                return Outcome::SpawnFailed(format!(
                    "timed out after {}s, kill failed: {err}",
                    timeout.as_secs()
                ));
            }
            // The child must still be reaped after the kill; do it off to
            // the side and discard the result.
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            Outcome::TimedOut
        }
    }
}

async fn drain_pipe<R>(pipe: Option<R>, buf: &mut Vec<u8>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(buf).await;
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

pub fn expand_args(argv: &[String], env: &HashMap<String, String>) -> Vec<String> {
    argv.iter().map(|arg| expand(arg, env)).collect()
}

fn expand(arg: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if let Some(value) = env.get(name) {
                    out.push_str(value);
                } else if let Ok(value) = std::env::var(name) {
                    out.push_str(&value);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                // Unterminated placeholder, keep it literal.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
