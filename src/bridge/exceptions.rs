//! Script exception representation and the two-tier unhandled-exception
//! pipeline.
//!
//! Failures tied to a pending evaluation are raised directly to the waiter.
//! Everything else (fire-and-forget failures, uncaught engine errors) goes
//! through the [`ExceptionHub`]: a local handler first, which may mark the
//! error handled, and only when it does not is every escalation listener
//! notified, each exactly once per error.

use std::fmt;
use std::sync::RwLock;

use tracing::error;

/// One frame of a script stack trace, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Function name, or a synthetic name such as `main chunk`.
    pub function: String,
    /// Source location as reported by the engine, when available.
    pub location: Option<String>,
}

impl StackFrame {
    /// Create a frame with a function name only.
    pub fn named<S: Into<String>>(function: S) -> Self {
        Self {
            function: function.into(),
            location: None,
        }
    }

    /// Create a frame with a function name and source location.
    pub fn at<S: Into<String>, L: Into<String>>(function: S, location: L) -> Self {
        Self {
            function: function.into(),
            location: Some(location.into()),
        }
    }
}

/// An error raised by script code, immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptException {
    /// The script error message, passed through verbatim.
    pub message: String,
    /// Stack frames, innermost first. Empty when the engine supplied none.
    pub frames: Vec<StackFrame>,
}

impl ScriptException {
    /// Create an exception with no stack information.
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            frames: Vec::new(),
        }
    }

    /// Create an exception with stack frames.
    pub fn with_frames<S: Into<String>>(message: S, frames: Vec<StackFrame>) -> Self {
        Self {
            message: message.into(),
            frames,
        }
    }

    /// Render the stack trace, one `at <frame>` line per frame, innermost
    /// frame first.
    pub fn stack_trace(&self) -> String {
        let mut lines = Vec::with_capacity(self.frames.len());
        for frame in &self.frames {
            match &frame.location {
                Some(location) => lines.push(format!("at {} ({})", frame.function, location)),
                None => lines.push(format!("at {}", frame.function)),
            }
        }
        lines.join("\n")
    }
}

impl fmt::Display for ScriptException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Local (first-tier) handler. Returns `true` when the error was handled.
pub type LocalHandler = Box<dyn Fn(&ScriptException) -> bool + Send + Sync>;

/// Escalation (second-tier) listener.
pub type EscalationListener = Box<dyn Fn(&ScriptException) + Send + Sync>;

/// Two-stage unhandled-exception notifier.
///
/// Stage 1 is a single replaceable handler returning a handled flag; the
/// flag defaults to unhandled when no handler is set. Stage 2 is a list of
/// listeners, each invoked exactly once per error that stage 1 left
/// unhandled. The error and flag travel through the stages explicitly;
/// there is no shared "last exception" state.
#[derive(Default)]
pub struct ExceptionHub {
    local: RwLock<Option<LocalHandler>>,
    escalation: RwLock<Vec<EscalationListener>>,
}

impl ExceptionHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the local handler, replacing any previous one.
    pub fn set_local_handler<F>(&self, handler: F)
    where
        F: Fn(&ScriptException) -> bool + Send + Sync + 'static,
    {
        *self.local.write().unwrap() = Some(Box::new(handler));
    }

    /// Remove the local handler; errors then escalate unconditionally.
    pub fn clear_local_handler(&self) {
        *self.local.write().unwrap() = None;
    }

    /// Subscribe an escalation listener.
    pub fn add_escalation_listener<F>(&self, listener: F)
    where
        F: Fn(&ScriptException) + Send + Sync + 'static,
    {
        self.escalation.write().unwrap().push(Box::new(listener));
    }

    /// Raise an asynchronous script error through both tiers.
    pub fn raise(&self, exception: &ScriptException) {
        let handled = {
            let local = self.local.read().unwrap();
            match local.as_ref() {
                Some(handler) => handler(exception),
                None => false,
            }
        };

        if handled {
            return;
        }

        let listeners = self.escalation.read().unwrap();
        if listeners.is_empty() {
            error!(
                error = %exception.message,
                stack = %exception.stack_trace(),
                "unhandled script exception"
            );
        } else {
            for listener in listeners.iter() {
                listener(exception);
            }
        }
    }
}
