//! Engine backend contract.
//!
//! The underlying script engine is a collaborator behind a trait: it drains
//! the request channel strictly in order and reports lifecycle and uncaught
//! errors over the event channel. The bridge never assumes anything about
//! the engine's wire format or language, only this contract.

use std::fmt;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;

use crate::bridge::exceptions::ScriptException;
use crate::bridge::queue::ScriptRequest;
use crate::bridge::registry::HostRegistry;

/// Why the engine stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Orderly shutdown requested by the host.
    Shutdown,
    /// The engine failed to start or aborted.
    Failure(String),
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Shutdown => write!(f, "shutdown"),
            TerminationReason::Failure(reason) => write!(f, "engine failure: {}", reason),
        }
    }
}

/// Notifications emitted by a backend while it runs.
#[derive(Debug)]
pub enum EngineEvent {
    /// The engine finished initializing and will accept requests.
    Ready,
    /// A script error with no pending waiter (uncaught, or raised by a
    /// fire-and-forget execution).
    UncaughtError(ScriptException),
    /// The engine stopped. Always the backend's final event.
    Terminated(TerminationReason),
}

/// Everything a backend needs to serve the bridge.
pub struct EngineContext {
    /// Queued requests, already in submission order.
    pub requests: Receiver<ScriptRequest>,
    /// Lifecycle and uncaught-error notifications back to the bridge.
    pub events: Sender<EngineEvent>,
    /// Host objects visible to scripts.
    pub host: Arc<HostRegistry>,
}

/// A script engine implementation.
///
/// `run` is invoked on a dedicated thread owned by the bridge and must not
/// return until the engine is done; engine state that is not `Send` (such
/// as an interpreter handle) can therefore live on the stack of `run`.
/// Implementations must:
///
/// - send [`EngineEvent::Ready`] once initialization completes,
/// - execute each request to completion, in order, before taking the next,
/// - complete every request through its completion sender (when present),
/// - route completion-less failures to [`EngineEvent::UncaughtError`],
/// - send [`EngineEvent::Terminated`] last, whatever the exit path.
pub trait EngineBackend: Send + 'static {
    /// Run the engine loop until the request channel closes or the engine
    /// fails.
    fn run(self: Box<Self>, ctx: EngineContext);
}
