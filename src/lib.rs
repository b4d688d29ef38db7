//! scriptbridge - embedded script engine bridge.
//!
//! Mediates two-way calls between host code and scripts running in an
//! embedded engine: synchronous-looking typed evaluation and ordered
//! fire-and-forget execution from the host, and dispatch into registered
//! host objects from scripts, with thread-affinity enforcement and a
//! two-tier unhandled-exception pipeline.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;

pub use bridge::{
    BridgeHandle, Dispatcher, EngineBackend, EngineContext, EngineEvent, ExceptionHub,
    ExecutionQueue, HostObject, HostRegistry, RequestKind, ScriptBridge, ScriptException,
    ScriptRequest, StackFrame, TerminationReason,
};
pub use config::{BridgeConfig, EngineConfig, EvaluationConfig, LoggingConfig};
pub use engine::LuaBackend;
pub use error::{BridgeError, Result};
