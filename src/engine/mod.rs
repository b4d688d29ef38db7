//! Concrete script engine backends.
//!
//! The bridge core only knows the [`crate::bridge::backend::EngineBackend`]
//! contract; this module provides the built-in Lua implementation.

pub mod lua;

pub use lua::LuaBackend;
