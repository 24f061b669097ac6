//! Agent CLI engine.
//!
//! Spawns the configured agent CLI and reads one [`ExecutionEvent`] per
//! stdout line.
//!
//! - One-shot runs get the prompt on stdin, then stdin is closed.
//! - Pooled workers are started with `worker_args` and speak the line
//!   protocol in [`protocol`].

mod protocol;
mod worker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{AgentEngine, EngineError, EventPump, ExecutionEvent, RunRequest, WorkerSession};
use crate::util::preview;
use crate::workspace::Workspace;

pub use worker::CliWorker;

/// Buffer between the stdout reader and the consumer.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Agent executable.
    pub program: PathBuf,
    /// Arguments for one-shot runs.
    pub args: Vec<String>,
    /// Arguments that start a long-lived worker.
    pub worker_args: Vec<String>,
    /// Extra environment for every spawned process.
    pub env: HashMap<String, String>,
    /// How long a worker may take to exit after `shutdown` before it is killed.
    pub shutdown_grace: Duration,
    /// How long a worker may take to acknowledge a cancelled query.
    pub drain_timeout: Duration,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("agent"),
            args: Vec::new(),
            worker_args: vec!["--worker".to_string()],
            env: HashMap::new(),
            shutdown_grace: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Engine backed by an agent CLI on the host.
pub struct CliEngine {
    config: CliConfig,
}

impl CliEngine {
    pub fn new(config: CliConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CliConfig {
        &self.config
    }
}

#[async_trait]
impl AgentEngine for CliEngine {
    fn name(&self) -> &str {
        "cli"
    }

    async fn spawn_worker(
        &self,
        workspace: &Workspace,
    ) -> Result<Arc<dyn WorkerSession>, EngineError> {
        let worker = CliWorker::spawn(&self.config, workspace).await?;
        Ok(Arc::new(worker))
    }

    async fn run_once(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<EventPump, EngineError> {
        request
            .workspace
            .ensure_dir()
            .await
            .map_err(EngineError::Workspace)?;

        let mut command = build_command(&self.config, &self.config.args, &request.workspace);
        command.env("AGENT_REQUEST_ID", &request.request_id);
        if let Some(model) = &request.model {
            command.env("AGENT_MODEL", model);
        }

        let mut child = spawn(command, &self.config, &self.config.args)?;
        let mut stdin = child.stdin.take().ok_or(EngineError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(EngineError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(EngineError::MissingPipe("stderr"))?;

        tracing::info!(
            request_id = %request.request_id,
            workspace = %request.workspace.key,
            pid = child.id().unwrap_or(0),
            "Started one-shot agent process"
        );

        spawn_stderr_logger(stderr, request.request_id.clone());

        let prompt = request.prompt;
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                tracing::warn!("Failed to write prompt to agent stdin: {}", e);
            }
            // Closing stdin marks the end of the prompt.
            drop(stdin);
        });

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let handle = tokio::spawn(pump_one_shot(
            child,
            stdout,
            tx,
            cancel,
            request.request_id,
        ));
        Ok((rx, handle))
    }
}

fn build_command(config: &CliConfig, args: &[String], workspace: &Workspace) -> Command {
    let mut command = Command::new(&config.program);
    command
        .args(args)
        .current_dir(&workspace.path)
        .env("AGENT_WORKSPACE", &workspace.path)
        .env("AGENT_WORKSPACE_KEY", &workspace.key)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

fn spawn(mut command: Command, config: &CliConfig, args: &[String]) -> Result<Child, EngineError> {
    command.spawn().map_err(|source| {
        let command_line = format_command(config, args);
        tracing::error!(command = %command_line, error = %source, "Failed to spawn agent process");
        EngineError::Spawn {
            command: command_line,
            source,
        }
    })
}

fn format_command(config: &CliConfig, args: &[String]) -> String {
    let mut parts = vec![config.program.display().to_string()];
    parts.extend(args.iter().cloned());
    parts.join(" ")
}

fn spawn_stderr_logger(stderr: ChildStderr, label: String) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(source = %label, "agent stderr: {}", preview(&line, 500));
        }
    });
}

async fn pump_one_shot(
    mut child: Child,
    stdout: ChildStdout,
    tx: mpsc::Sender<ExecutionEvent>,
    cancel: CancellationToken,
    request_id: String,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut saw_error = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(request_id = %request_id, "One-shot run cancelled, killing process");
                let _ = child.kill().await;
                return;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let event: ExecutionEvent = match serde_json::from_str(line) {
                            Ok(event) => event,
                            Err(e) => {
                                tracing::warn!(
                                    "Failed to parse agent event: {} - line: {}",
                                    e,
                                    preview(line, 200)
                                );
                                continue;
                            }
                        };
                        if event.error_message().is_some() {
                            saw_error = true;
                        }
                        if tx.send(event).await.is_err() {
                            tracing::debug!(request_id = %request_id, "Event receiver dropped, killing process");
                            let _ = child.kill().await;
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        saw_error = true;
                        let _ = tx
                            .send(ExecutionEvent::error(format!("Failed reading agent output: {}", e)))
                            .await;
                        break;
                    }
                }
            }
        }
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return;
        }
        status = child.wait() => status,
    };

    match status {
        Ok(status) if !status.success() && !saw_error => {
            let _ = tx
                .send(ExecutionEvent::error(format!("Agent exited with {}", status)))
                .await;
        }
        Err(e) if !saw_error => {
            let _ = tx
                .send(ExecutionEvent::error(format!("Failed waiting for agent: {}", e)))
                .await;
        }
        _ => {}
    }
    tracing::debug!(request_id = %request_id, "One-shot agent process finished");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh_engine(script: &str) -> CliEngine {
        CliEngine::new(CliConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            ..CliConfig::default()
        })
    }

    fn request(root: &std::path::Path) -> RunRequest {
        RunRequest {
            request_id: "req-1".to_string(),
            prompt: "hello".to_string(),
            workspace: Workspace::resolve(root, "ws").unwrap(),
            model: None,
        }
    }

    async fn collect(mut rx: super::super::EventStream) -> Vec<ExecutionEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn one_shot_streams_parsed_events_and_skips_noise() {
        let root = tempfile::tempdir().unwrap();
        let engine = sh_engine(
            r#"read prompt; echo '{"type":"message","content":"'"$prompt"'"}'; echo 'not json'; echo '{"type":"message_complete"}'"#,
        );

        let (rx, _handle) = engine
            .run_once(request(root.path()), CancellationToken::new())
            .await
            .unwrap();
        let events = collect(rx).await;

        assert_eq!(
            events,
            vec![
                ExecutionEvent::Message {
                    content: "hello".to_string()
                },
                ExecutionEvent::MessageComplete { session_id: None },
            ]
        );
    }

    #[tokio::test]
    async fn non_zero_exit_becomes_error_event() {
        let root = tempfile::tempdir().unwrap();
        let engine = sh_engine("exit 3");

        let (rx, _handle) = engine
            .run_once(request(root.path()), CancellationToken::new())
            .await
            .unwrap();
        let events = collect(rx).await;

        assert_eq!(events.len(), 1);
        assert!(events[0].error_message().unwrap().contains("exited"));
    }

    #[tokio::test]
    async fn cancel_kills_a_long_running_process() {
        let root = tempfile::tempdir().unwrap();
        let engine = sh_engine(r#"echo '{"type":"thinking","content":"a"}'; sleep 30"#);
        let cancel = CancellationToken::new();

        let (mut rx, handle) = engine
            .run_once(request(root.path()), cancel.clone())
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(ExecutionEvent::Thinking { .. })));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("pump should stop promptly")
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let root = tempfile::tempdir().unwrap();
        let engine = CliEngine::new(CliConfig {
            program: PathBuf::from("/nonexistent/agent-binary"),
            ..CliConfig::default()
        });

        let err = engine
            .run_once(request(root.path()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }
}
