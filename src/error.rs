//! Error types for the script bridge.

use std::time::Duration;

use thiserror::Error;

use crate::bridge::backend::TerminationReason;
use crate::bridge::exceptions::ScriptException;

/// Common error type for bridge operations.
///
/// Script-side failures carry the full [`ScriptException`] (message plus
/// stack frames); the remaining variants classify host-side failures so
/// callers can match on them instead of parsing messages.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The engine has not signalled readiness yet.
    ///
    /// The message is stable so callers waiting on startup can detect the
    /// condition by substring as well as by variant.
    #[error("script engine is not initialized")]
    EngineNotReady,

    /// The waiter's deadline elapsed before the engine completed the request.
    #[error("Timeout: script evaluation exceeded {0:?}")]
    Timeout(Duration),

    /// A syntax or runtime error reported by the engine for this request.
    #[error("{0}")]
    Script(ScriptException),

    /// The script value did not fit the requested host type.
    #[error("marshalling error: {0}")]
    Marshal(String),

    /// A registered host callable (or its interceptor) failed.
    #[error("host callable error: {0}")]
    HostCallable(String),

    /// The engine terminated; in-flight requests resolve with this.
    #[error("script engine terminated: {0}")]
    Terminated(TerminationReason),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// True when the error is the waiter-side evaluation timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout(_))
    }

    /// True when the error reports an uninitialized engine.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, BridgeError::EngineNotReady)
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_display() {
        let err = BridgeError::EngineNotReady;
        assert!(err.to_string().contains("not initialized"));
        assert!(err.is_not_ready());
    }

    #[test]
    fn test_timeout_display() {
        let err = BridgeError::Timeout(Duration::from_millis(50));
        assert!(err.to_string().contains("Timeout"));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_marshal_display() {
        let err = BridgeError::Marshal("expected integer, found string".to_string());
        assert_eq!(
            err.to_string(),
            "marshalling error: expected integer, found string"
        );
    }

    #[test]
    fn test_host_callable_display() {
        let err = BridgeError::HostCallable("boom".to_string());
        assert_eq!(err.to_string(), "host callable error: boom");
    }

    #[test]
    fn test_terminated_display() {
        let err = BridgeError::Terminated(TerminationReason::Shutdown);
        assert!(err.to_string().contains("terminated"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BridgeError = io_err.into();
        assert!(matches!(err, BridgeError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_result_alias() {
        fn sample_ok() -> Result<i32> {
            Ok(42)
        }

        fn sample_err() -> Result<i32> {
            Err(BridgeError::EngineNotReady)
        }

        assert_eq!(sample_ok().unwrap(), 42);
        assert!(sample_err().is_err());
    }
}
