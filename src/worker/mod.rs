//! Worker gateway: starting code-generation invocations and observing their events.
//!
//! A [`WorkerGateway`] starts one invocation per phase attempt and hands back a
//! [`WorkerInvocation`]. The invocation owns a finite, non-restartable event
//! stream that carries exactly one terminal event. Timeouts are never produced by
//! the worker itself; the poller synthesizes them.
//!
//! Implementations:
//! - [`claude::ClaudeGateway`] drives the `claude` CLI in stream-json mode
//! - [`scripted::ScriptedGateway`] replays prepared attempts, for tests and dry runs

pub mod claude;
pub mod scripted;
pub mod stream;

use crate::errors::WorkerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// Input for one worker invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    pub milestone: String,
    pub phase: String,
    pub attempt: u32,
    pub payload: String,
    pub workdir: PathBuf,
}

/// Where a raw worker error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawErrorKind {
    /// The event stream or the process could not be reached
    Transport,
    /// The process exited abnormally without reporting a result
    Process,
    /// The worker reported an error result
    Reported,
    /// The attempt exceeded its deadline
    Timeout,
}

impl fmt::Display for RawErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawErrorKind::Transport => write!(f, "transport"),
            RawErrorKind::Process => write!(f, "process"),
            RawErrorKind::Reported => write!(f, "reported"),
            RawErrorKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// An unclassified error surfaced by a worker invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawWorkerError {
    pub kind: RawErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl RawWorkerError {
    pub fn new(kind: RawErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn reported(message: impl Into<String>) -> Self {
        Self::new(RawErrorKind::Reported, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(RawErrorKind::Transport, message)
    }

    pub fn process(exit_code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            kind: RawErrorKind::Process,
            message: message.into(),
            exit_code,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            RawErrorKind::Timeout,
            format!("worker timed out after {}s", after.as_secs()),
        )
    }
}

impl fmt::Display for RawWorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "[{} exit {}] {}", self.kind, code, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

/// The single terminal outcome of an invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerTerminal {
    Success { summary: String },
    Error(RawWorkerError),
}

/// A typed progress event emitted by a worker invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Session {
        id: String,
    },
    Usage {
        cost_usd: f64,
        input_tokens: u64,
        output_tokens: u64,
    },
    Output {
        text: String,
    },
    Terminal(WorkerTerminal),
}

/// Starts worker invocations.
#[async_trait]
pub trait WorkerGateway: Send + Sync {
    /// Start a new invocation. Errors here mean nothing was started.
    async fn start(&self, request: WorkerRequest) -> Result<WorkerInvocation, WorkerError>;
}

/// Control half of an invocation, used to stop the underlying worker.
#[async_trait]
pub trait InvocationControl: Send {
    /// Stop the worker and wait until its resources are released.
    async fn terminate(&mut self) -> Result<(), WorkerError>;
}

/// What [`WorkerInvocation::drain`] observed.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainStatus {
    /// No terminal event yet
    Pending,
    /// The terminal event arrived
    Terminal(WorkerTerminal),
}

/// A running worker invocation.
///
/// Owned by the attempt that created it and discarded once terminal. Only its
/// distilled outcome (cost, session id, terminal result) survives in the checkpoint.
pub struct WorkerInvocation {
    session_id: String,
    started_at: DateTime<Utc>,
    cost_usd: f64,
    input_tokens: u64,
    output_tokens: u64,
    last_output: Option<String>,
    terminal: Option<WorkerTerminal>,
    events: mpsc::Receiver<WorkerEvent>,
    control: Box<dyn InvocationControl>,
}

impl WorkerInvocation {
    /// Wrap an event receiver and its control handle. The session id starts as a
    /// synthesized uuid and is replaced when the worker announces its own.
    pub fn new(events: mpsc::Receiver<WorkerEvent>, control: Box<dyn InvocationControl>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            cost_usd: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            last_output: None,
            terminal: None,
            events,
            control,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Cost reported so far.
    pub fn cost_usd(&self) -> f64 {
        self.cost_usd
    }

    pub fn tokens(&self) -> (u64, u64) {
        (self.input_tokens, self.output_tokens)
    }

    /// Most recent output text, if any.
    pub fn last_output(&self) -> Option<&str> {
        self.last_output.as_deref()
    }

    /// Consume every event currently available without waiting.
    ///
    /// A stream that closes without a terminal event yields a synthesized
    /// transport error so callers always observe exactly one terminal result.
    pub fn drain(&mut self) -> DrainStatus {
        if let Some(terminal) = &self.terminal {
            return DrainStatus::Terminal(terminal.clone());
        }
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    if let Some(terminal) = self.apply(event) {
                        self.terminal = Some(terminal.clone());
                        return DrainStatus::Terminal(terminal);
                    }
                }
                Err(TryRecvError::Empty) => return DrainStatus::Pending,
                Err(TryRecvError::Disconnected) => {
                    let terminal = WorkerTerminal::Error(RawWorkerError::transport(
                        "event stream ended without a terminal event",
                    ));
                    self.terminal = Some(terminal.clone());
                    return DrainStatus::Terminal(terminal);
                }
            }
        }
    }

    fn apply(&mut self, event: WorkerEvent) -> Option<WorkerTerminal> {
        match event {
            WorkerEvent::Session { id } => {
                tracing::debug!(session_id = %id, "worker session assigned");
                self.session_id = id;
                None
            }
            WorkerEvent::Usage {
                cost_usd,
                input_tokens,
                output_tokens,
            } => {
                self.cost_usd += cost_usd;
                self.input_tokens += input_tokens;
                self.output_tokens += output_tokens;
                None
            }
            WorkerEvent::Output { text } => {
                self.last_output = Some(text);
                None
            }
            WorkerEvent::Terminal(terminal) => Some(terminal),
        }
    }

    /// Stop the worker and wait for cleanup.
    pub async fn terminate(&mut self) -> Result<(), WorkerError> {
        self.events.close();
        self.control.terminate().await
    }
}

impl fmt::Debug for WorkerInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerInvocation")
            .field("session_id", &self.session_id)
            .field("started_at", &self.started_at)
            .field("cost_usd", &self.cost_usd)
            .field("terminal", &self.terminal)
            .finish()
    }
}
