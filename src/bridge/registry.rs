//! Host object registry: the script-to-host half of the bridge.
//!
//! Host code registers named objects whose methods scripts can call.
//! Invocation marshals arguments first, then either runs the callable
//! inline on the engine thread or, for thread-affine objects, posts it to
//! the dispatcher and returns control to the engine immediately. The
//! script never blocks on an affine call, which is what keeps a nested
//! synchronous evaluation from deadlocking.
//!
//! An interceptor, when registered, receives a zero-argument callable
//! standing for "invoke the original method with the already-marshalled
//! arguments" and fully decides whether to invoke it and what to return.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::bridge::dispatcher::Dispatcher;
use crate::bridge::exceptions::{ExceptionHub, ScriptException};
use crate::{BridgeError, Result};

/// A host callable taking marshalled arguments.
pub type HostMethod = Arc<dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync>;

/// The deferred original call handed to an interceptor.
pub type OriginalCall<'a> = Box<dyn FnOnce() -> Result<Value> + 'a>;

/// Wraps every method invocation on an object.
pub type Interceptor = Arc<dyn Fn(OriginalCall<'_>) -> Result<Value> + Send + Sync>;

/// A named host object exposed to scripts.
pub struct HostObject {
    name: String,
    methods: HashMap<String, HostMethod>,
    interceptor: Option<Interceptor>,
    thread_affinity: bool,
}

impl HostObject {
    /// Start building an object with the given script-visible name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
            interceptor: None,
            thread_affinity: false,
        }
    }

    /// Add a method.
    pub fn method<S, F>(mut self, name: S, f: F) -> Self
    where
        S: Into<String>,
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(f));
        self
    }

    /// Install an interceptor wrapping every method call on this object.
    pub fn with_interceptor<F>(mut self, f: F) -> Self
    where
        F: Fn(OriginalCall<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        self.interceptor = Some(Arc::new(f));
        self
    }

    /// Require this object's methods to run on the dispatcher thread.
    pub fn with_thread_affinity(mut self, affinity: bool) -> Self {
        self.thread_affinity = affinity;
        self
    }

    /// Script-visible name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether calls are redirected to the dispatcher thread.
    pub fn thread_affinity(&self) -> bool {
        self.thread_affinity
    }
}

/// An in-flight script-to-host invocation awaiting its affine execution.
pub struct PendingCall {
    object: Arc<HostObject>,
    method: String,
    args: Vec<Value>,
    completion: SyncSender<Result<Value>>,
}

impl PendingCall {
    fn new(
        object: Arc<HostObject>,
        method: String,
        args: Vec<Value>,
    ) -> (Self, PendingCallHandle) {
        let (tx, rx) = mpsc::sync_channel(1);
        (
            Self {
                object,
                method,
                args,
                completion: tx,
            },
            PendingCallHandle { rx },
        )
    }

    /// Execute the call on the current thread and signal completion.
    ///
    /// Returns the failure, if any, so the caller can route it onward; the
    /// completion handle receives the result either way.
    fn run(self) -> Option<String> {
        let result = HostRegistry::call(&self.object, &self.method, self.args);
        let failure = result.as_ref().err().map(|e| e.to_string());
        let _ = self.completion.send(result);
        failure
    }
}

/// Completion side of a dispatched affine call.
pub struct PendingCallHandle {
    rx: Receiver<Result<Value>>,
}

impl PendingCallHandle {
    /// Wait for the affine call to finish. `None` on timeout.
    pub fn wait(&self, timeout: Duration) -> Option<Result<Value>> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Shared registry of host objects, safe for concurrent lookup and
/// mutation across the engine and host threads.
pub struct HostRegistry {
    objects: RwLock<HashMap<String, Arc<HostObject>>>,
    dispatcher: Arc<Dispatcher>,
    exceptions: Arc<ExceptionHub>,
}

impl HostRegistry {
    /// Create an empty registry bound to the affinity dispatcher and the
    /// asynchronous exception pipeline.
    pub fn new(dispatcher: Arc<Dispatcher>, exceptions: Arc<ExceptionHub>) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            dispatcher,
            exceptions,
        }
    }

    /// Register an object, replacing any previous registration of the
    /// same name.
    pub fn register(&self, object: HostObject) {
        debug!(name = object.name(), "registering host object");
        self.objects
            .write()
            .unwrap()
            .insert(object.name.clone(), Arc::new(object));
    }

    /// Remove an object from future script lookups. In-flight calls keep
    /// their reference and complete normally.
    pub fn unregister(&self, name: &str) -> bool {
        self.objects.write().unwrap().remove(name).is_some()
    }

    /// Whether an object with this name is currently visible to scripts.
    pub fn contains(&self, name: &str) -> bool {
        self.objects.read().unwrap().contains_key(name)
    }

    /// Look up a registered object.
    pub fn get(&self, name: &str) -> Option<Arc<HostObject>> {
        self.objects.read().unwrap().get(name).cloned()
    }

    /// Invoke `object.method(args)` on behalf of a script.
    ///
    /// Thread-affine objects are dispatched and the call returns null to
    /// the engine immediately; everything else runs inline and returns the
    /// callable's marshalled result. Failures surface as errors for the
    /// engine to rethrow into the script.
    pub fn invoke(&self, object: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        let entry = self.get(object).ok_or_else(|| {
            BridgeError::HostCallable(format!("no host object named '{}'", object))
        })?;

        if entry.thread_affinity {
            let _ = self.dispatch(entry, method, args)?;
            return Ok(Value::Null);
        }

        Self::call(&entry, method, args)
    }

    /// Post an affine call to the dispatcher thread without blocking.
    ///
    /// The returned handle observes completion; failures are additionally
    /// raised through the exception hub, since the originating script has
    /// already moved on.
    pub fn dispatch(
        &self,
        object: Arc<HostObject>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<PendingCallHandle> {
        let (pending, handle) = PendingCall::new(object, method.to_string(), args);
        let hub = Arc::clone(&self.exceptions);

        let posted = self.dispatcher.post(move || {
            if let Some(failure) = pending.run() {
                hub.raise(&ScriptException::new(failure));
            }
        });
        if !posted {
            return Err(BridgeError::HostCallable(
                "dispatcher is not running".to_string(),
            ));
        }
        Ok(handle)
    }

    /// Run the target method, routed through the interceptor when one is
    /// registered.
    fn call(object: &Arc<HostObject>, method: &str, args: Vec<Value>) -> Result<Value> {
        let target = object.methods.get(method).cloned().ok_or_else(|| {
            BridgeError::HostCallable(format!(
                "host object '{}' has no method '{}'",
                object.name, method
            ))
        })?;

        let original: OriginalCall<'_> = Box::new(move || (*target)(args));
        match &object.interceptor {
            Some(interceptor) => (**interceptor)(original),
            None => original(),
        }
    }
}
