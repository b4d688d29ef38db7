//! Host-side entry point: the [`ScriptBridge`] facade.
//!
//! The bridge wires the execution queue, the engine backend, the host
//! object registry, and the exception pipeline together. Evaluation looks
//! synchronous to the caller but rides the asynchronous queue underneath:
//! submit, then block on the request's completion handle with a deadline.
//! A timed-out waiter detaches, so a late engine completion is dropped on
//! a closed channel instead of being delivered to nobody.

use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::bridge::backend::{EngineBackend, EngineContext, EngineEvent, TerminationReason};
use crate::bridge::dispatcher::Dispatcher;
use crate::bridge::exceptions::{ExceptionHub, ScriptException};
use crate::bridge::marshal;
use crate::bridge::queue::{ExecutionQueue, ScriptRequest, WaitError};
use crate::bridge::registry::{HostObject, HostRegistry};
use crate::config::BridgeConfig;
use crate::engine::lua::LuaBackend;
use crate::{BridgeError, Result};

type TerminationListener = Box<dyn Fn(&TerminationReason) + Send + Sync>;

/// Readiness and termination state shared between the event pump and the
/// evaluation callers.
struct EngineState {
    inner: Mutex<StateInner>,
    changed: Condvar,
}

struct StateInner {
    ready: bool,
    terminated: Option<TerminationReason>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            inner: Mutex::new(StateInner {
                ready: false,
                terminated: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn mark_ready(&self) {
        self.inner.lock().unwrap().ready = true;
        self.changed.notify_all();
    }

    fn mark_terminated(&self, reason: TerminationReason) {
        self.inner.lock().unwrap().terminated = Some(reason);
        self.changed.notify_all();
    }

    fn termination(&self) -> Option<TerminationReason> {
        self.inner.lock().unwrap().terminated.clone()
    }

    /// Block until the engine is ready, it terminated, or the deadline
    /// passed (in which case the engine counts as not initialized).
    fn wait_ready(&self, deadline: Instant) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(reason) = &inner.terminated {
                return Err(BridgeError::Terminated(reason.clone()));
            }
            if inner.ready {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BridgeError::EngineNotReady);
            }
            let (guard, _timeout) = self
                .changed
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }
    }
}

/// Cloneable submitter for evaluations and executions.
///
/// Handles can be captured by host callables (for re-entrant evaluation)
/// or moved to other threads. Every live handle keeps the engine's request
/// queue open; the engine shuts down once the bridge and all handles are
/// gone, so a handle captured inside a registered object lives until that
/// object is unregistered.
#[derive(Clone)]
pub struct BridgeHandle {
    queue: ExecutionQueue,
    state: Arc<EngineState>,
    default_timeout: Duration,
}

impl BridgeHandle {
    /// Evaluate a script expression with the configured default timeout.
    pub fn evaluate<T: DeserializeOwned>(&self, script: &str) -> Result<T> {
        self.evaluate_with_timeout(script, self.default_timeout)
    }

    /// Evaluate a script expression, blocking the calling thread until the
    /// marshalled result arrives or the timeout elapses.
    ///
    /// The timeout cancels only the waiter. The engine may still run the
    /// script to completion; its late result is discarded.
    pub fn evaluate_with_timeout<T: DeserializeOwned>(
        &self,
        script: &str,
        timeout: Duration,
    ) -> Result<T> {
        let deadline = Instant::now() + timeout;
        self.state.wait_ready(deadline)?;

        let (request, completion) = ScriptRequest::evaluate(script, Some(timeout));
        self.queue
            .submit(request)
            .map_err(|_| self.terminated_error())?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        match completion.wait(remaining) {
            Ok(Ok(value)) => marshal::from_script(value),
            Ok(Err(exception)) => Err(BridgeError::Script(exception)),
            Err(WaitError::TimedOut) => Err(BridgeError::Timeout(timeout)),
            Err(WaitError::EngineGone) => Err(self.terminated_error()),
        }
    }

    /// Queue a script for execution and return immediately.
    ///
    /// Success is discarded; failure surfaces through the asynchronous
    /// exception pipeline. Requests queued before the engine is ready run
    /// once initialization finishes.
    pub fn execute(&self, script: &str) -> Result<()> {
        self.queue
            .submit(ScriptRequest::execute(script))
            .map_err(|_| self.terminated_error())?;
        Ok(())
    }

    fn terminated_error(&self) -> BridgeError {
        BridgeError::Terminated(
            self.state
                .termination()
                .unwrap_or(TerminationReason::Shutdown),
        )
    }
}

/// The embedded script engine bridge.
pub struct ScriptBridge {
    handle: BridgeHandle,
    registry: Arc<HostRegistry>,
    exceptions: Arc<ExceptionHub>,
    dispatcher: Arc<Dispatcher>,
    state: Arc<EngineState>,
    termination_listeners: Arc<RwLock<Vec<TerminationListener>>>,
}

impl ScriptBridge {
    /// Create a bridge running the built-in Lua backend.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let backend = LuaBackend::new(config.engine.clone());
        Self::with_backend(backend, config)
    }

    /// Create a bridge running a custom engine backend.
    pub fn with_backend<B: EngineBackend>(backend: B, config: BridgeConfig) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher::spawn("bridge-dispatcher")?);
        let exceptions = Arc::new(ExceptionHub::new());
        let registry = Arc::new(HostRegistry::new(
            Arc::clone(&dispatcher),
            Arc::clone(&exceptions),
        ));
        let state = Arc::new(EngineState::new());
        let termination_listeners: Arc<RwLock<Vec<TerminationListener>>> =
            Arc::new(RwLock::new(Vec::new()));

        let (queue, requests) = ExecutionQueue::new();
        let (events_tx, events_rx) = mpsc::channel();

        let ctx = EngineContext {
            requests,
            events: events_tx,
            host: Arc::clone(&registry),
        };
        let _ = thread::Builder::new()
            .name("script-engine".to_string())
            .spawn(move || Box::new(backend).run(ctx))?;

        {
            let state = Arc::clone(&state);
            let exceptions = Arc::clone(&exceptions);
            let listeners = Arc::clone(&termination_listeners);
            let _ = thread::Builder::new()
                .name("bridge-events".to_string())
                .spawn(move || pump_events(events_rx, state, exceptions, listeners))?;
        }

        info!("script bridge started");

        Ok(Self {
            handle: BridgeHandle {
                queue,
                state: Arc::clone(&state),
                default_timeout: config.evaluation.default_timeout(),
            },
            registry,
            exceptions,
            dispatcher,
            state,
            termination_listeners,
        })
    }

    /// Evaluate a script expression with the default timeout.
    pub fn evaluate<T: DeserializeOwned>(&self, script: &str) -> Result<T> {
        self.handle.evaluate(script)
    }

    /// Evaluate a script expression with an explicit timeout.
    pub fn evaluate_with_timeout<T: DeserializeOwned>(
        &self,
        script: &str,
        timeout: Duration,
    ) -> Result<T> {
        self.handle.evaluate_with_timeout(script, timeout)
    }

    /// Queue a fire-and-forget script execution.
    pub fn execute(&self, script: &str) -> Result<()> {
        self.handle.execute(script)
    }

    /// A cloneable submitter sharing this bridge's queue.
    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }

    /// Expose a host object to scripts, replacing any previous object
    /// registered under the same name.
    pub fn register_object(&self, object: HostObject) {
        self.registry.register(object);
    }

    /// Hide a host object from future script lookups.
    pub fn unregister_object(&self, name: &str) -> bool {
        self.registry.unregister(name)
    }

    /// The shared host object registry.
    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    /// The designated thread for thread-affine host callables.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Install the first-tier handler for asynchronous script errors.
    /// Returning `true` marks the error handled and stops escalation.
    pub fn set_exception_handler<F>(&self, handler: F)
    where
        F: Fn(&ScriptException) -> bool + Send + Sync + 'static,
    {
        self.exceptions.set_local_handler(handler);
    }

    /// Remove the first-tier handler.
    pub fn clear_exception_handler(&self) {
        self.exceptions.clear_local_handler();
    }

    /// Subscribe to second-tier (escalated) unhandled script errors.
    pub fn on_unhandled_exception<F>(&self, listener: F)
    where
        F: Fn(&ScriptException) + Send + Sync + 'static,
    {
        self.exceptions.add_escalation_listener(listener);
    }

    /// Subscribe to engine termination.
    pub fn on_engine_terminated<F>(&self, listener: F)
    where
        F: Fn(&TerminationReason) + Send + Sync + 'static,
    {
        self.termination_listeners
            .write()
            .unwrap()
            .push(Box::new(listener));
    }

    /// Whether the engine has terminated, and why.
    pub fn termination(&self) -> Option<TerminationReason> {
        self.state.termination()
    }
}

/// Route backend events: readiness to waiting evaluators, uncaught errors
/// to the exception pipeline, termination to listeners. In-flight waiters
/// are released by their completion senders dying with the backend; here
/// only the recorded reason and notifications remain.
fn pump_events(
    events: Receiver<EngineEvent>,
    state: Arc<EngineState>,
    exceptions: Arc<ExceptionHub>,
    listeners: Arc<RwLock<Vec<TerminationListener>>>,
) {
    let mut terminated = false;
    while let Ok(event) = events.recv() {
        match event {
            EngineEvent::Ready => {
                debug!("engine ready");
                state.mark_ready();
            }
            EngineEvent::UncaughtError(exception) => {
                exceptions.raise(&exception);
            }
            EngineEvent::Terminated(reason) => {
                info!(%reason, "engine terminated");
                terminated = true;
                state.mark_terminated(reason.clone());
                for listener in listeners.read().unwrap().iter() {
                    listener(&reason);
                }
            }
        }
    }

    // The backend vanished without its final event.
    if !terminated {
        let reason =
            TerminationReason::Failure("engine stopped without a termination signal".to_string());
        state.mark_terminated(reason.clone());
        for listener in listeners.read().unwrap().iter() {
            listener(&reason);
        }
    }
}
