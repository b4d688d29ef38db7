//! Lua engine backend with sandboxing and resource limits.
//!
//! The Lua state is not `Send`, so it lives entirely on the engine thread:
//! [`LuaBackend::run`] builds it, signals readiness, and drains the request
//! channel in submission order. Sources are compiled expression-first
//! (`return <source>`), falling back to a statement chunk, so both
//! `"2+1"` and `"local x = 1; return 5"` evaluate. Script errors are
//! captured together with a `debug.traceback` snapshot and parsed into
//! structured stack frames.
//!
//! Registered host objects surface to scripts through an `__index`
//! metamethod on the global table, resolved per lookup so unregistering an
//! object hides it immediately. A `null` global (the `mlua` null sentinel)
//! lets scripts pass true nulls, including inside arrays.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{
    DeserializeOptions, Function, HookTriggers, Lua, LuaOptions, LuaSerdeExt, StdLib,
    Table, Value as LuaValue, Variadic, VmState,
};
use serde_json::Value;
use tracing::{debug, error};

use crate::bridge::backend::{EngineBackend, EngineContext, EngineEvent, TerminationReason};
use crate::bridge::exceptions::{ScriptException, StackFrame};
use crate::bridge::queue::ScriptOutcome;
use crate::bridge::registry::HostRegistry;
use crate::config::EngineConfig;

/// Error handler installed around every chunk call. Captured before the
/// sandbox removes the `debug` library.
const CALL_WRAPPER: &str = r#"
local debug_traceback = debug.traceback
return function(f)
    local captured
    local ok, result = xpcall(f, function(msg)
        captured = debug_traceback("", 2)
        return msg
    end)
    if ok then
        return true, result, nil
    end
    return false, tostring(result), captured
end
"#;

/// The built-in Lua backend.
pub struct LuaBackend {
    limits: EngineConfig,
}

impl LuaBackend {
    /// Create a backend with the given resource limits.
    pub fn new(limits: EngineConfig) -> Self {
        Self { limits }
    }
}

impl EngineBackend for LuaBackend {
    fn run(self: Box<Self>, ctx: EngineContext) {
        let inner = match EngineInner::create(self.limits.clone(), Arc::clone(&ctx.host)) {
            Ok(inner) => inner,
            Err(e) => {
                error!(error = %e, "failed to initialize Lua engine");
                let _ = ctx.events.send(EngineEvent::Terminated(TerminationReason::Failure(
                    e.to_string(),
                )));
                return;
            }
        };

        if ctx.events.send(EngineEvent::Ready).is_err() {
            return;
        }
        debug!("lua engine ready");

        while let Ok(request) = ctx.requests.recv() {
            debug!(seq = request.seq(), kind = ?request.kind(), "running script request");
            let outcome = inner.run_source(request.source());
            if let Some(Err(exception)) = request.complete(outcome) {
                if ctx
                    .events
                    .send(EngineEvent::UncaughtError(exception))
                    .is_err()
                {
                    break;
                }
            }
        }

        let _ = ctx
            .events
            .send(EngineEvent::Terminated(TerminationReason::Shutdown));
    }
}

/// Engine state confined to the engine thread.
struct EngineInner {
    lua: Lua,
    wrapper: Function,
    limits: EngineConfig,
}

impl EngineInner {
    fn create(limits: EngineConfig, host: Arc<HostRegistry>) -> mlua::Result<Self> {
        // Load the standard-safe libraries plus `debug`, which the call
        // wrapper needs for `debug.traceback` before the sandbox strips it.
        let lua = unsafe { Lua::unsafe_new_with(StdLib::ALL_SAFE | StdLib::DEBUG, LuaOptions::default()) };

        // The wrapper grabs debug.traceback before the sandbox removes it.
        let wrapper: Function = lua.load(CALL_WRAPPER).eval()?;

        apply_sandbox(&lua)?;

        if limits.max_memory_mb > 0 {
            lua.set_memory_limit(limits.max_memory_mb * 1024 * 1024)?;
        }

        lua.globals().set("null", lua.null())?;
        install_host_lookup(&lua, host)?;

        Ok(Self {
            lua,
            wrapper,
            limits,
        })
    }

    /// Compile and run one request's source, returning the marshalled
    /// result or a structured script exception.
    fn run_source(&self, source: &str) -> ScriptOutcome {
        let chunk = match self.compile(source) {
            Ok(chunk) => chunk,
            Err(e) => return Err(exception_from_mlua(&e)),
        };

        self.arm_instruction_limit();
        let outcome = self
            .wrapper
            .call::<(bool, LuaValue, Option<String>)>(chunk);
        self.lua.remove_hook();

        match outcome {
            Ok((true, value, _)) => {
                match self
                    .lua
                    .from_value_with::<Value>(value, deserialize_options())
                {
                    Ok(json) => Ok(json),
                    Err(e) => Err(ScriptException::new(format!(
                        "result is not marshallable: {}",
                        e
                    ))),
                }
            }
            Ok((false, message, traceback)) => {
                let raw = match message {
                    LuaValue::String(s) => s.to_str().map(|s| s.to_string()).unwrap_or_default(),
                    other => format!("{:?}", other),
                };
                Err(script_exception(&raw, traceback.as_deref()))
            }
            Err(e) => Err(exception_from_mlua(&e)),
        }
    }

    /// Expression-first compilation: `"2+1"` becomes `return 2+1`; sources
    /// that are not expressions load as plain chunks.
    fn compile(&self, source: &str) -> mlua::Result<Function> {
        match self
            .lua
            .load(format!("return {}", source))
            .set_name("eval")
            .into_function()
        {
            Ok(chunk) => Ok(chunk),
            Err(_) => self.lua.load(source).set_name("eval").into_function(),
        }
    }

    fn arm_instruction_limit(&self) {
        if self.limits.max_instructions == 0 {
            return;
        }
        let count = Arc::new(AtomicU64::new(0));
        let limit = self.limits.max_instructions;

        self.lua.set_hook(
            HookTriggers::new().every_nth_instruction(10_000),
            move |_lua, _debug| {
                let current = count.fetch_add(10_000, Ordering::SeqCst) + 10_000;
                if current > limit {
                    Err(mlua::Error::RuntimeError(
                        "script exceeded instruction limit".to_string(),
                    ))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );
    }
}

/// Remove everything that reaches outside the engine.
fn apply_sandbox(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in [
        "os",
        "io",
        "loadfile",
        "dofile",
        "load",
        "require",
        "package",
        "debug",
        "collectgarbage",
    ] {
        globals.set(name, LuaValue::Nil)?;
    }
    Ok(())
}

/// Resolve registered host objects through an `__index` metamethod on the
/// global table. The proxy is rebuilt per lookup, so registration changes
/// take effect on the next script access.
fn install_host_lookup(lua: &Lua, host: Arc<HostRegistry>) -> mlua::Result<()> {
    let lookup = lua.create_function(move |lua, (_globals, key): (Table, LuaValue)| {
        let name = match key {
            LuaValue::String(s) => s.to_str().map(|s| s.to_string())?,
            _ => return Ok(LuaValue::Nil),
        };
        if !host.contains(&name) {
            return Ok(LuaValue::Nil);
        }

        let proxy = lua.create_table()?;
        let meta = lua.create_table()?;
        let registry = Arc::clone(&host);
        meta.set(
            "__index",
            lua.create_function(move |lua, (_proxy, method_key): (Table, LuaValue)| {
                let method = match method_key {
                    LuaValue::String(s) => s.to_str().map(|s| s.to_string())?,
                    _ => return Ok(LuaValue::Nil),
                };
                let registry = Arc::clone(&registry);
                let object = name.clone();
                let call = lua.create_function(move |lua, args: Variadic<LuaValue>| {
                    let mut marshalled = Vec::with_capacity(args.len());
                    for arg in args.iter() {
                        marshalled.push(
                            lua.from_value_with::<Value>(arg.clone(), deserialize_options())?,
                        );
                    }
                    match registry.invoke(&object, &method, marshalled) {
                        Ok(value) => lua.to_value(&value),
                        Err(e) => Err(mlua::Error::RuntimeError(e.to_string())),
                    }
                })?;
                Ok(LuaValue::Function(call))
            })?,
        )?;
        proxy.set_metatable(Some(meta));
        Ok(LuaValue::Table(proxy))
    })?;

    let meta = lua.create_table()?;
    meta.set("__index", lookup)?;
    lua.globals().set_metatable(Some(meta));
    Ok(())
}

fn deserialize_options() -> DeserializeOptions {
    // Functions and other unmarshallable values become null instead of
    // failing the whole conversion; recursive tables still error.
    DeserializeOptions::new().deny_unsupported_types(false)
}

/// Build a [`ScriptException`] from a raw Lua error message and an
/// optional traceback captured at the error site.
fn script_exception(raw: &str, traceback: Option<&str>) -> ScriptException {
    let (head, inline_traceback) = match raw.split_once("\nstack traceback:") {
        Some((head, tail)) => (head, Some(tail)),
        None => (raw, None),
    };
    let head = head.strip_prefix("runtime error: ").unwrap_or(head);
    let message = strip_location_prefix(head).to_string();
    let frames = traceback
        .or(inline_traceback)
        .map(parse_traceback_frames)
        .unwrap_or_default();
    ScriptException::with_frames(message, frames)
}

fn exception_from_mlua(error: &mlua::Error) -> ScriptException {
    match error {
        mlua::Error::SyntaxError { message, .. } => script_exception(message, None),
        mlua::Error::RuntimeError(message) | mlua::Error::MemoryError(message) => {
            script_exception(message, None)
        }
        mlua::Error::CallbackError { traceback, cause } => {
            script_exception(&cause.to_string(), Some(traceback.as_str()))
        }
        other => script_exception(&other.to_string(), None),
    }
}

/// Strip the `<chunk>:<line>: ` prefix Lua prepends to error messages; the
/// location is redundant with the stack frames.
fn strip_location_prefix(message: &str) -> &str {
    let rest = if let Some(bracketed) = message.strip_prefix("[string ") {
        match bracketed.find("]:") {
            Some(idx) => &bracketed[idx + 2..],
            None => return message,
        }
    } else if let Some(idx) = message.find(':') {
        let (chunk, rest) = message.split_at(idx);
        if chunk.is_empty() || chunk.contains(' ') {
            return message;
        }
        &rest[1..]
    } else {
        return message;
    };

    if let Some(idx) = rest.find(": ") {
        let (line, text) = rest.split_at(idx);
        if !line.is_empty() && line.chars().all(|c| c.is_ascii_digit()) {
            return &text[2..];
        }
    }
    message
}

/// Parse a `debug.traceback` dump into frames, innermost first. Engine
/// `[C]` frames are dropped; parsing stops at the request's main chunk so
/// harness frames below it never leak into the stack.
fn parse_traceback_frames(traceback: &str) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    for line in traceback.lines() {
        let line = line.trim();
        let Some((location, what)) = line.split_once(": in ") else {
            continue;
        };
        if location == "[C]" {
            continue;
        }
        if what == "main chunk" {
            frames.push(StackFrame::at("main chunk", location));
            break;
        }
        let function = match what.split_once('\'') {
            Some((_, rest)) => rest.split('\'').next().unwrap_or(rest).to_string(),
            None => what.to_string(),
        };
        frames.push(StackFrame::at(function, location));
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::dispatcher::Dispatcher;
    use crate::bridge::exceptions::ExceptionHub;
    use crate::bridge::registry::HostObject;
    use crate::BridgeError;
    use serde_json::json;

    fn engine() -> (EngineInner, Arc<HostRegistry>) {
        engine_with_limits(EngineConfig::default())
    }

    fn engine_with_limits(limits: EngineConfig) -> (EngineInner, Arc<HostRegistry>) {
        let dispatcher = Arc::new(Dispatcher::spawn("lua-test").unwrap());
        let host = Arc::new(HostRegistry::new(dispatcher, Arc::new(ExceptionHub::new())));
        (
            EngineInner::create(limits, Arc::clone(&host)).unwrap(),
            host,
        )
    }

    #[test]
    fn test_basic_execution() {
        let (engine, _host) = engine();
        engine.run_source("x = 1 + 2").unwrap();
        assert_eq!(engine.run_source("x").unwrap(), json!(3));
    }

    #[test]
    fn test_expression_evaluation() {
        let (engine, _host) = engine();
        assert_eq!(engine.run_source("2+1").unwrap(), json!(3));
        assert_eq!(engine.run_source("2+1 -- some comments").unwrap(), json!(3));
    }

    #[test]
    fn test_declarations_before_expression() {
        let (engine, _host) = engine();
        assert_eq!(engine.run_source("local x = 1; return 5").unwrap(), json!(5));
    }

    #[test]
    fn test_string_operations() {
        let (engine, _host) = engine();
        assert_eq!(
            engine.run_source("string.upper('hello')").unwrap(),
            json!("HELLO")
        );
    }

    #[test]
    fn test_statement_result_is_null() {
        let (engine, _host) = engine();
        assert_eq!(engine.run_source("y = 10").unwrap(), Value::Null);
    }

    #[test]
    fn test_null_sentinel_round_trip() {
        let (engine, _host) = engine();
        assert_eq!(engine.run_source("null").unwrap(), Value::Null);
        assert_eq!(engine.run_source("nil").unwrap(), Value::Null);
    }

    #[test]
    fn test_table_marshals_to_object() {
        let (engine, _host) = engine();
        let value = engine
            .run_source("({ name = 'Snows', age = 32, parent = { name = 'Snows Parent' } })")
            .unwrap();
        assert_eq!(
            value,
            json!({ "name": "Snows", "age": 32, "parent": { "name": "Snows Parent" } })
        );
    }

    #[test]
    fn test_array_with_embedded_null_preserved() {
        let (engine, _host) = engine();
        let value = engine.run_source("{'hello', null, 'world'}").unwrap();
        assert_eq!(value, json!(["hello", null, "world"]));
    }

    #[test]
    fn test_sandbox_disables_os_io_require() {
        let (engine, _host) = engine();
        assert!(engine.run_source("os.execute('ls')").is_err());
        assert!(engine.run_source("io.open('/etc/passwd', 'r')").is_err());
        assert!(engine.run_source("require('os')").is_err());
        assert!(engine.run_source("debug.traceback()").is_err());
    }

    #[test]
    fn test_syntax_error() {
        let (engine, _host) = engine();
        let err = engine.run_source("this is not valid lua").unwrap_err();
        assert!(!err.message.is_empty());
    }

    #[test]
    fn test_runtime_error_message_is_stripped() {
        let (engine, _host) = engine();
        let err = engine.run_source("error('test error')").unwrap_err();
        assert_eq!(err.message, "test error");
    }

    #[test]
    fn test_error_message_passes_through_verbatim() {
        let (engine, _host) = engine();
        let err = engine.run_source("error('Error: ups')").unwrap_err();
        assert_eq!(err.message, "Error: ups");
    }

    #[test]
    fn test_nested_error_has_ordered_frames() {
        let (engine, _host) = engine();
        let err = engine
            .run_source(
                r#"
function bar()
    error('Error: ups')
end
function foo()
    bar()
end
foo()
"#,
            )
            .unwrap_err();

        assert_eq!(err.message, "Error: ups");
        assert!(err.frames.len() > 2);
        assert_eq!(err.frames[0].function, "bar");
        assert_eq!(err.frames[1].function, "foo");
        assert_eq!(err.frames.last().unwrap().function, "main chunk");

        let stack_trace = err.stack_trace();
        let stack: Vec<&str> = stack_trace.lines().collect();
        assert!(stack[0].starts_with("at bar"));
        assert!(stack[1].starts_with("at foo"));
    }

    #[test]
    fn test_instruction_limit() {
        let (engine, _host) = engine_with_limits(EngineConfig {
            max_instructions: 1000,
            max_memory_mb: 0,
        });
        let err = engine.run_source("while true do end").unwrap_err();
        assert!(err.message.contains("instruction limit"));
    }

    #[test]
    fn test_host_object_invocation() {
        let (engine, host) = engine();
        host.register(HostObject::new("Calc").method("add", |args| {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        }));

        assert_eq!(engine.run_source("Calc.add(2, 3)").unwrap(), json!(5));
    }

    #[test]
    fn test_unregistered_object_is_nil() {
        let (engine, host) = engine();
        host.register(HostObject::new("Obj").method("f", |_| Ok(Value::Null)));

        assert_eq!(engine.run_source("Obj ~= nil").unwrap(), json!(true));
        host.unregister("Obj");
        assert_eq!(engine.run_source("Obj == nil").unwrap(), json!(true));
    }

    #[test]
    fn test_host_error_rethrown_into_script() {
        let (engine, host) = engine();
        host.register(HostObject::new("Obj").method("fail", |_| {
            Err(BridgeError::HostCallable("boom".to_string()))
        }));

        let err = engine.run_source("Obj.fail()").unwrap_err();
        assert!(err.message.contains("boom"));

        // The thrown error is catchable from script code.
        let caught = engine
            .run_source("local ok = pcall(function() Obj.fail() end); return ok")
            .unwrap();
        assert_eq!(caught, json!(false));
    }

    #[test]
    fn test_strip_location_prefix() {
        assert_eq!(strip_location_prefix("[string \"eval\"]:3: ups"), "ups");
        assert_eq!(strip_location_prefix("eval:1: ups"), "ups");
        assert_eq!(strip_location_prefix("Error: ups"), "Error: ups");
        assert_eq!(strip_location_prefix("plain message"), "plain message");
    }

    #[test]
    fn test_parse_traceback_frames() {
        let traceback = "\nstack traceback:\n\
            \t[C]: in function 'error'\n\
            \t[string \"eval\"]:2: in function 'bar'\n\
            \t[string \"eval\"]:5: in local 'foo'\n\
            \t[string \"eval\"]:7: in main chunk\n\
            \t[C]: in function 'xpcall'\n\
            \t[string \"wrapper\"]:4: in function <[string \"wrapper\"]:2>";

        let frames = parse_traceback_frames(traceback);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].function, "bar");
        assert_eq!(frames[0].location.as_deref(), Some("[string \"eval\"]:2"));
        assert_eq!(frames[1].function, "foo");
        // Parsing stops at the main chunk; harness frames are dropped.
        assert_eq!(frames[2].function, "main chunk");
    }
}
