//! Worker gateway backed by the `claude` CLI.
//!
//! The prompt goes in on stdin; stdout is read line by line as stream-json and
//! translated into [`WorkerEvent`]s. A reader task owns the child process. It is
//! spawned with `kill_on_drop`, and dropping or terminating the invocation kills it.

use super::stream::{ContentBlock, StreamEvent, describe_tool_use, truncate_str};
use super::{
    InvocationControl, RawWorkerError, WorkerEvent, WorkerGateway, WorkerInvocation,
    WorkerRequest, WorkerTerminal,
};
use crate::errors::WorkerError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const EVENT_BUFFER: usize = 256;
const STDERR_TAIL: usize = 2000;

/// Starts `claude` processes for phase attempts.
#[derive(Debug, Clone)]
pub struct ClaudeGateway {
    command: String,
    flags: Vec<String>,
    log_dir: Option<PathBuf>,
}

impl ClaudeGateway {
    pub fn new(command: impl Into<String>, flags: Vec<String>) -> Self {
        Self {
            command: command.into(),
            flags,
            log_dir: None,
        }
    }

    /// Write each attempt's prompt to `<log_dir>/<milestone>-<phase>-<attempt>-prompt.md`.
    pub fn with_log_dir(mut self, log_dir: PathBuf) -> Self {
        self.log_dir = Some(log_dir);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn write_prompt_log(&self, request: &WorkerRequest) {
        let Some(dir) = &self.log_dir else {
            return;
        };
        let path = dir.join(format!(
            "{}-{}-{}-prompt.md",
            request.milestone, request.phase, request.attempt
        ));
        if let Err(e) = std::fs::write(&path, &request.payload) {
            tracing::warn!(path = %path.display(), error = %e, "failed to write prompt log");
        }
    }
}

#[async_trait]
impl WorkerGateway for ClaudeGateway {
    async fn start(&self, request: WorkerRequest) -> Result<WorkerInvocation, WorkerError> {
        self.write_prompt_log(&request);

        let mut child = Command::new(&self.command)
            .args(&self.flags)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&request.workdir)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::SpawnFailed {
                command: self.command.clone(),
                source,
            })?;

        tracing::info!(
            phase = %request.phase,
            attempt = request.attempt,
            pid = child.id().unwrap_or(0),
            "spawned worker"
        );

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.payload.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Protocol("worker stdout was not captured".into()))?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (kill_tx, kill_rx) = oneshot::channel();
        let reader = tokio::spawn(drive_child(child, stdout, stderr, tx, kill_rx));

        Ok(WorkerInvocation::new(
            rx,
            Box::new(ChildControl {
                kill: Some(kill_tx),
                reader: Some(reader),
            }),
        ))
    }
}

struct ChildControl {
    kill: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
}

#[async_trait]
impl InvocationControl for ChildControl {
    async fn terminate(&mut self) -> Result<(), WorkerError> {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        if let Some(reader) = self.reader.take() {
            reader
                .await
                .map_err(|e| WorkerError::Protocol(format!("worker reader task failed: {}", e)))?;
        }
        Ok(())
    }
}

/// Read stdout until EOF or a kill request, translating stream-json lines into events.
///
/// Dropping the kill sender counts as a kill request, so an abandoned invocation
/// never leaves its process running.
async fn drive_child(
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    stderr: Option<tokio::process::ChildStderr>,
    tx: mpsc::Sender<WorkerEvent>,
    mut kill_rx: oneshot::Receiver<()>,
) {
    let stderr_task = stderr.map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        })
    });

    let mut lines = BufReader::new(stdout).lines();
    let mut translator = StreamTranslator::default();

    loop {
        tokio::select! {
            _ = &mut kill_rx => {
                tracing::debug!("terminating worker process");
                let _ = child.kill().await;
                if let Some(task) = &stderr_task {
                    task.abort();
                }
                return;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        for event in translator.translate(&line) {
                            if tx.send(event).await.is_err() {
                                let _ = child.kill().await;
                                return;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed reading worker stdout");
                        break;
                    }
                }
            }
        }
    }

    let status = tokio::select! {
        _ = &mut kill_rx => {
            let _ = child.kill().await;
            return;
        }
        status = child.wait() => status,
    };

    let stderr_text = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    if translator.terminal_sent {
        return;
    }

    let terminal = match status {
        Ok(status) if status.success() => WorkerTerminal::Error(RawWorkerError::transport(
            "worker exited without reporting a result",
        )),
        Ok(status) => WorkerTerminal::Error(RawWorkerError::process(
            status.code(),
            tail(&stderr_text, STDERR_TAIL),
        )),
        Err(e) => WorkerTerminal::Error(RawWorkerError::transport(format!(
            "failed waiting for worker: {}",
            e
        ))),
    };
    let _ = tx.send(WorkerEvent::Terminal(terminal)).await;
}

fn tail(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        trimmed.to_string()
    } else {
        trimmed.chars().skip(count - max_chars).collect()
    }
}

/// Stateful translation of stream-json lines into worker events.
#[derive(Debug, Default)]
struct StreamTranslator {
    session_announced: bool,
    terminal_sent: bool,
}

impl StreamTranslator {
    fn translate(&mut self, line: &str) -> Vec<WorkerEvent> {
        if line.trim().is_empty() || self.terminal_sent {
            return Vec::new();
        }
        let event = match serde_json::from_str::<StreamEvent>(line) {
            Ok(event) => event,
            Err(_) => {
                return vec![WorkerEvent::Output {
                    text: truncate_str(line, 200),
                }];
            }
        };

        let mut events = Vec::new();
        match event {
            StreamEvent::System { session_id, .. } => {
                self.announce(session_id, &mut events);
            }
            StreamEvent::Assistant {
                message,
                session_id,
            } => {
                if !session_id.is_empty() {
                    self.announce(Some(session_id), &mut events);
                }
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            events.push(WorkerEvent::Output { text });
                        }
                        ContentBlock::ToolUse { name, input, .. } => {
                            events.push(WorkerEvent::Output {
                                text: describe_tool_use(&name, &input),
                            });
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            StreamEvent::User {} => {}
            StreamEvent::Result {
                subtype,
                result,
                is_error,
                session_id,
                total_cost_usd,
                usage,
            } => {
                self.announce(session_id, &mut events);
                let usage = usage.unwrap_or_default();
                events.push(WorkerEvent::Usage {
                    cost_usd: total_cost_usd.unwrap_or(0.0),
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                });
                let terminal = if is_error || subtype != "success" {
                    let message = match result {
                        Some(text) if !text.trim().is_empty() => {
                            format!("{}: {}", subtype, text)
                        }
                        _ => subtype,
                    };
                    WorkerTerminal::Error(RawWorkerError::reported(message))
                } else {
                    WorkerTerminal::Success {
                        summary: result.unwrap_or_default(),
                    }
                };
                events.push(WorkerEvent::Terminal(terminal));
                self.terminal_sent = true;
            }
        }
        events
    }

    fn announce(&mut self, session_id: Option<String>, events: &mut Vec<WorkerEvent>) {
        if self.session_announced {
            return;
        }
        if let Some(id) = session_id.filter(|id| !id.is_empty()) {
            self.session_announced = true;
            events.push(WorkerEvent::Session { id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::DrainStatus;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_translate_success_result() {
        let mut t = StreamTranslator::default();
        let events = t.translate(
            r#"{"type":"result","subtype":"success","is_error":false,"result":"all done","session_id":"s1","total_cost_usd":1.5}"#,
        );
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], WorkerEvent::Session { id: "s1".into() });
        assert!(matches!(events[1], WorkerEvent::Usage { cost_usd, .. } if cost_usd == 1.5));
        assert_eq!(
            events[2],
            WorkerEvent::Terminal(WorkerTerminal::Success {
                summary: "all done".into()
            })
        );
        assert!(t.translate(r#"{"type":"system","subtype":"late"}"#).is_empty());
    }

    #[test]
    fn test_translate_error_result() {
        let mut t = StreamTranslator::default();
        let events = t.translate(
            r#"{"type":"result","subtype":"error_max_turns","is_error":true,"result":""}"#,
        );
        match events.last() {
            Some(WorkerEvent::Terminal(WorkerTerminal::Error(err))) => {
                assert_eq!(err.kind, crate::worker::RawErrorKind::Reported);
                assert_eq!(err.message, "error_max_turns");
            }
            other => panic!("expected error terminal, got {:?}", other),
        }
    }

    #[test]
    fn test_translate_announces_session_once() {
        let mut t = StreamTranslator::default();
        let first = t.translate(r#"{"type":"system","subtype":"init","session_id":"abc"}"#);
        assert_eq!(first, vec![WorkerEvent::Session { id: "abc".into() }]);
        let second = t.translate(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]},"session_id":"abc"}"#,
        );
        assert_eq!(second, vec![WorkerEvent::Output { text: "hi".into() }]);
    }

    #[test]
    fn test_translate_non_json_line_becomes_output() {
        let mut t = StreamTranslator::default();
        let events = t.translate("plain text from worker");
        assert_eq!(
            events,
            vec![WorkerEvent::Output {
                text: "plain text from worker".into()
            }]
        );
    }

    async fn wait_terminal(inv: &mut WorkerInvocation) -> WorkerTerminal {
        for _ in 0..200 {
            if let DrainStatus::Terminal(t) = inv.drain() {
                return t;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("no terminal event");
    }

    fn request(dir: &std::path::Path) -> WorkerRequest {
        WorkerRequest {
            milestone: "m".into(),
            phase: "p".into(),
            attempt: 1,
            payload: "hello".into(),
            workdir: dir.to_path_buf(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_gateway_reads_stream_json_from_process() {
        let dir = tempdir().unwrap();
        let script = r#"cat >/dev/null; echo '{"type":"system","subtype":"init","session_id":"sess-1"}'; echo '{"type":"result","subtype":"success","is_error":false,"result":"ok","total_cost_usd":0.1}'"#;
        let gateway = ClaudeGateway::new("sh", vec!["-c".into(), script.into()]);

        let mut inv = gateway.start(request(dir.path())).await.unwrap();
        let terminal = wait_terminal(&mut inv).await;
        assert_eq!(
            terminal,
            WorkerTerminal::Success {
                summary: "ok".into()
            }
        );
        assert_eq!(inv.session_id(), "sess-1");
        assert!((inv.cost_usd() - 0.1).abs() < 1e-9);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_gateway_reports_process_failure_with_stderr() {
        let dir = tempdir().unwrap();
        let script = "cat >/dev/null; echo 'rate limit exceeded' >&2; exit 3";
        let gateway = ClaudeGateway::new("sh", vec!["-c".into(), script.into()]);

        let mut inv = gateway.start(request(dir.path())).await.unwrap();
        match wait_terminal(&mut inv).await {
            WorkerTerminal::Error(err) => {
                assert_eq!(err.exit_code, Some(3));
                assert!(err.message.contains("rate limit"));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_gateway_terminate_kills_hanging_process() {
        let dir = tempdir().unwrap();
        let gateway = ClaudeGateway::new("sh", vec!["-c".into(), "sleep 30".into()]);

        let mut inv = gateway.start(request(dir.path())).await.unwrap();
        assert_eq!(inv.drain(), DrainStatus::Pending);
        tokio::time::timeout(Duration::from_secs(5), inv.terminate())
            .await
            .expect("terminate should not hang")
            .unwrap();
    }

    #[tokio::test]
    async fn test_gateway_spawn_failure() {
        let dir = tempdir().unwrap();
        let gateway = ClaudeGateway::new("definitely-not-a-real-binary-xyz", vec![]);
        let err = gateway.start(request(dir.path())).await.unwrap_err();
        assert!(matches!(err, WorkerError::SpawnFailed { .. }));
    }

    #[test]
    fn test_prompt_log_written() {
        let dir = tempdir().unwrap();
        let gateway = ClaudeGateway::new("claude", vec![]).with_log_dir(dir.path().to_path_buf());
        gateway.write_prompt_log(&request(dir.path()));
        let content = std::fs::read_to_string(dir.path().join("m-p-1-prompt.md")).unwrap();
        assert_eq!(content, "hello");
    }
}
