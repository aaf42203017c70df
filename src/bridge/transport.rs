//! Byte streams a bridge session can run over: this process's stdio, or
//! the stdio of a spawned agent process.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::session::{ProtocolBridge, SessionInfo};
use crate::error::AppError;

/// How long a spawned agent gets to exit on its own once its session ends.
pub const AGENT_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Serve one session on stdin/stdout. Logging must go to stderr.
pub async fn serve_stdio(bridge: &ProtocolBridge) -> Result<SessionInfo, AppError> {
    bridge
        .serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
}

/// Pick an interpreter for script agents: `.py` runs under python3,
/// `.js`/`.mjs` under node, anything else is executed directly.
pub fn resolve_program(program: &str, args: &[String]) -> (String, Vec<String>) {
    let interpreter = match std::path::Path::new(program)
        .extension()
        .and_then(|e| e.to_str())
    {
        Some("py") => Some("python3"),
        Some("js" | "mjs") => Some("node"),
        _ => None,
    };
    match interpreter {
        Some(interpreter) => {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(program.to_string());
            full.extend(args.iter().cloned());
            (interpreter.to_string(), full)
        }
        None => (program.to_string(), args.to_vec()),
    }
}

fn spawn_agent(program: &str, args: &[String]) -> Result<Child, AppError> {
    let (command, args) = resolve_program(program, args);
    let mut child = Command::new(&command)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::Transport {
            message: format!("Failed to spawn agent {command}: {e}"),
        })?;

    if let Some(stderr) = child.stderr.take() {
        let agent = command.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(agent = %agent, "{line}");
            }
        });
    }

    tracing::info!(agent = %command, args = ?args, pid = ?child.id(), "agent spawned");
    Ok(child)
}

/// Spawn an agent process and serve one session over its stdio. The agent
/// is killed if it has not exited shortly after the session ends.
pub async fn connect(
    bridge: &ProtocolBridge,
    program: &str,
    args: &[String],
) -> Result<SessionInfo, AppError> {
    let mut child = spawn_agent(program, args)?;
    let stdin = child.stdin.take().ok_or_else(|| AppError::Transport {
        message: "Failed to capture agent stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| AppError::Transport {
        message: "Failed to capture agent stdout".into(),
    })?;

    let result = bridge.serve(BufReader::new(stdout), stdin).await;
    stop_agent(&mut child).await;
    result
}

/// An agent session running on its own task, next to whatever else the
/// process is doing with the same dispatcher.
pub struct AgentSession {
    handle: JoinHandle<Result<SessionInfo, AppError>>,
}

impl AgentSession {
    /// Wait up to `grace` for the session to end on its own, then stop it.
    /// `None` means the session had to be stopped.
    pub async fn finish(self, grace: Duration) -> Result<Option<SessionInfo>, AppError> {
        let mut handle = self.handle;
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(joined) => joined
                .map_err(|e| AppError::Transport {
                    message: format!("agent session task failed: {e}"),
                })?
                .map(Some),
            Err(_) => {
                tracing::warn!("agent session still running, stopping it");
                // Dropping the session kills the agent process.
                handle.abort();
                Ok(None)
            }
        }
    }
}

/// [`connect`] on a background task.
pub fn spawn_connect(bridge: ProtocolBridge, program: String, args: Vec<String>) -> AgentSession {
    let handle = tokio::spawn(async move { connect(&bridge, &program, &args).await });
    AgentSession { handle }
}

async fn stop_agent(child: &mut Child) {
    match tokio::time::timeout(AGENT_EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) => tracing::info!(%status, "agent exited"),
        Ok(Err(e)) => tracing::warn!(error = %e, "could not wait for agent"),
        Err(_) => {
            tracing::warn!("agent did not exit, killing it");
            let _ = child.kill().await;
        }
    }
}
