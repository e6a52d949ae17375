//! Process runner: spawn a shell command for a session and stream its output.

use super::pump::StreamPump;
use super::registry::{ProcessRunner, Session, SessionRegistry};
use crate::exec::{CommandLine, QuoteError};
use crate::gateway::{EventSink, StreamKind};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// How long to let pumps flush trailing output after the process exits.
const PUMP_DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error(transparent)]
    Quote(#[from] QuoteError),
    #[error("failed to start `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process for `{0}` exited before its pid was known")]
    NoPid(String),
    #[error("session was stopped before the command started")]
    Cancelled,
}

/// Output of a process run to completion without streaming.
#[derive(Debug, Clone)]
pub struct Captured {
    pub pid: u32,
    pub status: i32,
    pub stdout: String,
}

fn shell(line: &str) -> Command {
    #[cfg(windows)]
    let mut cmd = {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(line);
        c
    };
    #[cfg(not(windows))]
    let mut cmd = {
        let mut c = Command::new("sh");
        c.arg("-c").arg(line);
        c
    };
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

/// Exit code, or minus the signal number for a killed process.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

/// Run `command` through the shell for `session`, streaming stdout/stderr lines
/// tagged with `id`, and return the exit status once the process exits.
///
/// Evicts whatever the session was running first. The finished process stays
/// registered until the session's next run, halt, or disconnect.
pub async fn start(
    registry: &SessionRegistry,
    session: &Session,
    command: &CommandLine,
    id: &str,
    env: &[(String, String)],
    sink: Arc<dyn EventSink>,
) -> Result<i32, SpawnError> {
    let Some(gate) = registry.take_over(session).await else {
        return Err(SpawnError::Cancelled);
    };
    let line = command.joined()?;
    log::info!("running cmd: {} with id: {}", line, id);

    let mut child = shell(&line)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .spawn()
        .map_err(|source| SpawnError::Io {
            command: line.clone(),
            source,
        })?;
    let Some(pid) = child.id() else {
        return Err(SpawnError::NoPid(line));
    };
    let ticket = registry.register(session.id(), pid).await;

    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(StreamPump::spawn(stdout, StreamKind::Stdout, id.to_string(), sink.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(StreamPump::spawn(stderr, StreamKind::Stderr, id.to_string(), sink));
    }
    let done: Vec<_> = pumps.iter().map(StreamPump::token).collect();
    if let (Some(stderr), Some(stdout)) = (pumps.pop(), pumps.pop()) {
        registry
            .track(
                session.id(),
                ticket,
                ProcessRunner {
                    pid,
                    stdout,
                    stderr,
                },
            )
            .await;
    }
    drop(gate);

    let status = child.wait().await.map_err(|source| SpawnError::Io {
        command: line.clone(),
        source,
    })?;
    registry.mark_exited(session.id(), ticket).await;
    let code = exit_code(status);
    log::debug!("cmd with id {} exited with {}", id, code);

    let drained = tokio::time::timeout(PUMP_DRAIN_GRACE, async {
        for token in &done {
            token.cancelled().await;
        }
    })
    .await;
    if drained.is_err() {
        log::debug!("output of {} still open after exit (background child?)", id);
    }
    Ok(code)
}

/// Run `line` to completion and capture stdout, as part of `run`. The pid is registered
/// under the session without pumps, so a halt or disconnect still kills it.
pub async fn run_captured(
    registry: &SessionRegistry,
    session: &Session,
    run: &CancellationToken,
    line: &str,
) -> Result<Captured, SpawnError> {
    let Some(gate) = registry.enter(session, run).await else {
        return Err(SpawnError::Cancelled);
    };
    let child = shell(line).spawn().map_err(|source| SpawnError::Io {
        command: line.to_string(),
        source,
    })?;
    let Some(pid) = child.id() else {
        return Err(SpawnError::NoPid(line.to_string()));
    };
    let ticket = registry.register(session.id(), pid).await;
    drop(gate);

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| SpawnError::Io {
            command: line.to_string(),
            source,
        })?;
    registry.mark_exited(session.id(), ticket).await;
    Ok(Captured {
        pid,
        status: exit_code(output.status),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
    })
}
