//! Execution queue for script requests.
//!
//! Requests are handed to the engine strictly in submission order over an
//! mpsc channel; the channel also serializes concurrent submitters. The
//! queue never reorders, batches, or coalesces, and memory grows only with
//! outstanding requests. Completion flows back through a single-use sender
//! carried by the request, so each request produces at most one result and
//! a waiter that gave up (dropped its handle) makes a late completion land
//! nowhere.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::bridge::exceptions::ScriptException;

/// What the submitter expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Result delivered to a blocked waiter.
    Evaluate,
    /// Fire-and-forget; success discarded, failure goes to the
    /// asynchronous exception path.
    Execute,
}

/// Result of one script request: a marshalled value or a script error.
pub type ScriptOutcome = std::result::Result<Value, ScriptException>;

/// Why a wait on a completion handle ended without an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline elapsed; the request may still complete later and its
    /// result will be discarded.
    TimedOut,
    /// The engine dropped the request without completing it (terminated).
    EngineGone,
}

/// The queue was closed because the engine is no longer consuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

/// One host-submitted script operation.
#[derive(Debug)]
pub struct ScriptRequest {
    seq: u64,
    source: String,
    kind: RequestKind,
    timeout: Option<Duration>,
    completion: Option<SyncSender<ScriptOutcome>>,
}

impl ScriptRequest {
    /// Build an evaluation request and the handle its waiter blocks on.
    pub fn evaluate<S: Into<String>>(
        source: S,
        timeout: Option<Duration>,
    ) -> (Self, CompletionHandle) {
        let (tx, rx) = mpsc::sync_channel(1);
        let request = Self {
            seq: 0,
            source: source.into(),
            kind: RequestKind::Evaluate,
            timeout,
            completion: Some(tx),
        };
        (request, CompletionHandle { rx })
    }

    /// Build a fire-and-forget execution request.
    pub fn execute<S: Into<String>>(source: S) -> Self {
        Self {
            seq: 0,
            source: source.into(),
            kind: RequestKind::Execute,
            timeout: None,
            completion: None,
        }
    }

    /// Submission sequence number, assigned by the queue.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Script source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Request kind.
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Waiter-side timeout, when one was supplied.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether a waiter is blocked on this request.
    pub fn has_waiter(&self) -> bool {
        self.completion.is_some()
    }

    /// Deliver the outcome.
    ///
    /// For requests with a waiter the outcome is sent to it (silently
    /// dropped when the waiter already timed out and released its handle).
    /// For fire-and-forget requests the outcome is handed back so the
    /// engine can route failures to the uncaught-error channel.
    pub fn complete(self, outcome: ScriptOutcome) -> Option<ScriptOutcome> {
        match self.completion {
            Some(tx) => {
                let _ = tx.send(outcome);
                None
            }
            None => Some(outcome),
        }
    }
}

/// Receiving side of a request's single-use completion channel.
#[derive(Debug)]
pub struct CompletionHandle {
    rx: Receiver<ScriptOutcome>,
}

impl CompletionHandle {
    /// Block until the outcome arrives, the timeout elapses, or the engine
    /// goes away. Dropping the handle after a timeout detaches the waiter.
    pub fn wait(&self, timeout: Duration) -> std::result::Result<ScriptOutcome, WaitError> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Ok(outcome),
            Err(RecvTimeoutError::Timeout) => Err(WaitError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(WaitError::EngineGone),
        }
    }
}

/// FIFO queue of script requests shared by all host threads.
#[derive(Debug, Clone)]
pub struct ExecutionQueue {
    tx: Sender<ScriptRequest>,
    seq: Arc<AtomicU64>,
}

impl ExecutionQueue {
    /// Create the queue and the engine-side receiver.
    pub fn new() -> (Self, Receiver<ScriptRequest>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                tx,
                seq: Arc::new(AtomicU64::new(1)),
            },
            rx,
        )
    }

    /// Stamp the request with the next sequence number and enqueue it.
    pub fn submit(
        &self,
        mut request: ScriptRequest,
    ) -> std::result::Result<u64, QueueClosed> {
        request.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let seq = request.seq;
        self.tx.send(request).map_err(|_| QueueClosed)?;
        Ok(seq)
    }
}
