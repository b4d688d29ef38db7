//! Bridge core: ordered two-way calls between host code and scripts.
//!
//! Host-to-script traffic flows through the execution queue into the
//! engine backend and back through per-request completion channels;
//! script-to-host traffic goes through the host object registry, with
//! optional thread-affine dispatch. Failures without a waiting caller are
//! routed through the two-tier exception pipeline.

pub mod backend;
pub mod dispatcher;
pub mod exceptions;
pub mod host;
pub mod marshal;
pub mod queue;
pub mod registry;

pub use backend::{EngineBackend, EngineContext, EngineEvent, TerminationReason};
pub use dispatcher::Dispatcher;
pub use exceptions::{ExceptionHub, ScriptException, StackFrame};
pub use host::{BridgeHandle, ScriptBridge};
pub use queue::{
    CompletionHandle, ExecutionQueue, RequestKind, ScriptOutcome, ScriptRequest, WaitError,
};
pub use registry::{HostObject, HostRegistry, Interceptor, OriginalCall, PendingCallHandle};
