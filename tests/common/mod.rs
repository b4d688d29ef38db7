//! Shared helpers for bridge integration tests.

use scriptbridge::{BridgeConfig, ScriptBridge};

/// Bridge with default limits over the built-in Lua backend.
pub fn bridge() -> ScriptBridge {
    ScriptBridge::new(BridgeConfig::default()).unwrap()
}

/// Bridge without instruction/memory limits, for long-running scripts.
#[allow(dead_code)]
pub fn bridge_without_limits() -> ScriptBridge {
    let mut config = BridgeConfig::default();
    config.engine.max_instructions = 0;
    config.engine.max_memory_mb = 0;
    ScriptBridge::new(config).unwrap()
}
