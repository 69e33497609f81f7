//! A worker gateway that replays prepared attempts.
//!
//! Each phase gets a queue of [`ScriptedAttempt`]s. An attempt can touch the
//! working directory (to simulate artifacts), emit events after a delay, or hang
//! until terminated. When a phase's queue is empty the fallback attempt is used.

use super::{
    InvocationControl, RawWorkerError, WorkerEvent, WorkerGateway, WorkerInvocation,
    WorkerRequest, WorkerTerminal,
};
use crate::errors::WorkerError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Effect = Arc<dyn Fn(&Path) -> std::io::Result<()> + Send + Sync>;

/// One prepared worker attempt.
#[derive(Clone)]
pub struct ScriptedAttempt {
    delay: Duration,
    effect: Option<Effect>,
    events: Vec<WorkerEvent>,
    hang: bool,
    spawn_error: Option<String>,
}

impl ScriptedAttempt {
    fn with_events(events: Vec<WorkerEvent>) -> Self {
        Self {
            delay: Duration::ZERO,
            effect: None,
            events,
            hang: false,
            spawn_error: None,
        }
    }

    /// Report success.
    pub fn succeed() -> Self {
        Self::with_events(vec![WorkerEvent::Terminal(WorkerTerminal::Success {
            summary: "done".to_string(),
        })])
    }

    /// Report an error result with the given message.
    pub fn fail(message: &str) -> Self {
        Self::with_events(vec![WorkerEvent::Terminal(WorkerTerminal::Error(
            RawWorkerError::reported(message),
        ))])
    }

    /// Report a specific raw error.
    pub fn fail_with(error: RawWorkerError) -> Self {
        Self::with_events(vec![WorkerEvent::Terminal(WorkerTerminal::Error(error))])
    }

    /// Never produce a terminal event; only termination ends it.
    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::with_events(Vec::new())
        }
    }

    /// Refuse to start, as if the worker binary were missing.
    pub fn spawn_error(message: &str) -> Self {
        Self {
            spawn_error: Some(message.to_string()),
            ..Self::with_events(Vec::new())
        }
    }

    /// Wait before emitting events.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Report cost before the terminal event.
    pub fn costing(mut self, cost_usd: f64) -> Self {
        self.events.insert(
            0,
            WorkerEvent::Usage {
                cost_usd,
                input_tokens: 0,
                output_tokens: 0,
            },
        );
        self
    }

    /// Run a side effect on the working directory before emitting events.
    pub fn touching<F>(mut self, effect: F) -> Self
    where
        F: Fn(&Path) -> std::io::Result<()> + Send + Sync + 'static,
    {
        self.effect = Some(Arc::new(effect));
        self
    }

    /// Write a file (creating parent directories) before emitting events.
    pub fn writing(self, relative: &str, content: &str) -> Self {
        let relative = relative.to_string();
        let content = content.to_string();
        self.touching(move |dir| {
            let path = dir.join(&relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &content)
        })
    }
}

#[derive(Default)]
struct ScriptState {
    queues: HashMap<String, VecDeque<ScriptedAttempt>>,
    requests: Vec<WorkerRequest>,
}

/// Replays prepared attempts per phase and records every request.
#[derive(Clone)]
pub struct ScriptedGateway {
    state: Arc<Mutex<ScriptState>>,
    fallback: ScriptedAttempt,
    terminations: Arc<AtomicUsize>,
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedGateway {
    /// A gateway whose unscripted attempts succeed.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState::default())),
            fallback: ScriptedAttempt::succeed(),
            terminations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replace the attempt used when a phase has nothing queued.
    pub fn with_fallback(mut self, attempt: ScriptedAttempt) -> Self {
        self.fallback = attempt;
        self
    }

    /// Queue an attempt for a phase.
    pub fn push(&self, phase: &str, attempt: ScriptedAttempt) -> &Self {
        if let Ok(mut state) = self.state.lock() {
            state
                .queues
                .entry(phase.to_string())
                .or_default()
                .push_back(attempt);
        }
        self
    }

    /// Every request received so far, in start order.
    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.state
            .lock()
            .map(|s| s.requests.clone())
            .unwrap_or_default()
    }

    /// Requests received for one phase.
    pub fn requests_for(&self, phase: &str) -> Vec<WorkerRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.phase == phase)
            .collect()
    }

    /// How many invocations were terminated before finishing.
    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerGateway for ScriptedGateway {
    async fn start(&self, request: WorkerRequest) -> Result<WorkerInvocation, WorkerError> {
        let attempt = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| WorkerError::Protocol("scripted gateway lock poisoned".into()))?;
            state.requests.push(request.clone());
            state
                .queues
                .get_mut(&request.phase)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| self.fallback.clone())
        };

        if let Some(message) = attempt.spawn_error {
            return Err(WorkerError::SpawnFailed {
                command: "scripted".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, message),
            });
        }

        let (tx, rx) = mpsc::channel(32);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let workdir = request.workdir.clone();

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = &mut stop_rx => return,
                _ = tokio::time::sleep(attempt.delay) => {}
            }
            if let Some(effect) = &attempt.effect
                && let Err(e) = effect(&workdir)
            {
                let _ = tx
                    .send(WorkerEvent::Terminal(WorkerTerminal::Error(
                        RawWorkerError::transport(format!("scripted effect failed: {}", e)),
                    )))
                    .await;
                return;
            }
            for event in attempt.events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            if attempt.hang {
                let _ = stop_rx.await;
                drop(tx);
            }
        });

        Ok(WorkerInvocation::new(
            rx,
            Box::new(ScriptedControl {
                stop: Some(stop_tx),
                task: Some(task),
                terminations: self.terminations.clone(),
            }),
        ))
    }
}

struct ScriptedControl {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    terminations: Arc<AtomicUsize>,
}

#[async_trait]
impl InvocationControl for ScriptedControl {
    async fn terminate(&mut self) -> Result<(), WorkerError> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| WorkerError::Protocol(format!("scripted task failed: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::DrainStatus;
    use tempfile::tempdir;

    fn request(dir: &Path, phase: &str) -> WorkerRequest {
        WorkerRequest {
            milestone: "m".into(),
            phase: phase.into(),
            attempt: 1,
            payload: format!("do {}", phase),
            workdir: dir.to_path_buf(),
        }
    }

    async fn terminal_of(inv: &mut WorkerInvocation) -> WorkerTerminal {
        for _ in 0..100 {
            if let DrainStatus::Terminal(t) = inv.drain() {
                return t;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no terminal");
    }

    #[tokio::test]
    async fn test_queued_attempts_replay_in_order_then_fallback() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway::new();
        gateway.push("lint", ScriptedAttempt::fail("lint broke"));

        let mut first = gateway.start(request(dir.path(), "lint")).await.unwrap();
        assert!(matches!(
            terminal_of(&mut first).await,
            WorkerTerminal::Error(_)
        ));

        let mut second = gateway.start(request(dir.path(), "lint")).await.unwrap();
        assert!(matches!(
            terminal_of(&mut second).await,
            WorkerTerminal::Success { .. }
        ));

        assert_eq!(gateway.requests_for("lint").len(), 2);
    }

    #[tokio::test]
    async fn test_writing_effect_creates_file_before_terminal() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway::new();
        gateway.push(
            "research",
            ScriptedAttempt::succeed().writing("docs/research.md", "notes"),
        );

        let mut inv = gateway
            .start(request(dir.path(), "research"))
            .await
            .unwrap();
        terminal_of(&mut inv).await;
        assert_eq!(
            std::fs::read_to_string(dir.path().join("docs/research.md")).unwrap(),
            "notes"
        );
    }

    #[tokio::test]
    async fn test_hang_ends_only_on_terminate() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway::new().with_fallback(ScriptedAttempt::hang());

        let mut inv = gateway.start(request(dir.path(), "e2e")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(inv.drain(), DrainStatus::Pending);

        inv.terminate().await.unwrap();
        assert_eq!(gateway.terminations(), 1);
    }

    #[tokio::test]
    async fn test_spawn_error_is_reported_at_start() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway::new();
        gateway.push("research", ScriptedAttempt::spawn_error("missing"));
        let err = gateway
            .start(request(dir.path(), "research"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::SpawnFailed { .. }));
        assert_eq!(gateway.requests().len(), 1);
    }
}
