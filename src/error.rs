//! Error types for luabox
//!
//! This module defines all error types surfaced by the sandbox. Guest-level
//! failures keep the exact message the engine produced; the host-facing enum
//! only classifies them.

use std::error::Error as StdError;
use std::fmt;

use crate::sandbox::State;

/// Main error type for sandbox operations
#[derive(Debug)]
pub enum SandboxError {
    /// Script load, compilation, or execution failed inside the engine
    Script(String),

    /// The engine refused an allocation or hit its memory ceiling
    OutOfMemory(String),

    /// Operation attempted in a lifecycle state that does not allow it
    InvalidState {
        /// The operation that was attempted
        operation: &'static str,
        /// The state the sandbox was in
        state: State,
    },

    /// The guest entry point is missing or returned the wrong type
    EntryPoint(String),

    /// Sandbox construction failed
    Setup(String),
}

/// Type alias for Results throughout luabox
pub type Result<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
    /// The message to record into the sandbox's bounded error slot.
    pub fn message(&self) -> String {
        match self {
            SandboxError::Script(msg) => msg.clone(),
            SandboxError::OutOfMemory(msg) => msg.clone(),
            SandboxError::InvalidState { operation, state } => {
                format!("{} not allowed in state {}", operation, state)
            }
            SandboxError::EntryPoint(msg) => msg.clone(),
            SandboxError::Setup(msg) => msg.clone(),
        }
    }
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::Script(msg) => write!(f, "Script error: {}", msg),
            SandboxError::OutOfMemory(msg) => write!(f, "Out of memory: {}", msg),
            SandboxError::InvalidState { operation, state } => {
                write!(f, "Invalid state: {} not allowed in state {}", operation, state)
            }
            SandboxError::EntryPoint(msg) => write!(f, "Entry point error: {}", msg),
            SandboxError::Setup(msg) => write!(f, "Setup error: {}", msg),
        }
    }
}

impl StdError for SandboxError {}

impl From<mlua::Error> for SandboxError {
    fn from(err: mlua::Error) -> Self {
        match root_cause(&err) {
            mlua::Error::MemoryError(msg) => SandboxError::OutOfMemory(msg.clone()),
            _ => SandboxError::Script(guest_message(&err)),
        }
    }
}

/// Unwrap callback-error chains down to the error the guest actually raised.
fn root_cause(err: &mlua::Error) -> &mlua::Error {
    match err {
        mlua::Error::CallbackError { cause, .. } => root_cause(cause),
        other => other,
    }
}

/// Engine messages may carry a traceback after the first newline; the error
/// slot keeps only the message proper.
fn first_line(msg: &str) -> &str {
    msg.lines().next().unwrap_or("")
}

/// Extract the message a guest error should surface as, stripping the
/// engine's "runtime error: " prefix and any traceback.
pub(crate) fn guest_message(err: &mlua::Error) -> String {
    let raw = match root_cause(err) {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::MemoryError(msg) => msg.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        other => other.to_string(),
    };
    let line = first_line(&raw);
    line.strip_prefix("runtime error: ").unwrap_or(line).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SandboxError::Script("attempt to call a nil value".to_string());
        assert_eq!(err.to_string(), "Script error: attempt to call a nil value");

        let err = SandboxError::InvalidState { operation: "invoke", state: State::Terminated };
        assert_eq!(err.to_string(), "Invalid state: invoke not allowed in state terminated");
    }

    #[test]
    fn test_guest_message_unwraps_callback_chain() {
        let lua = mlua::Lua::new();
        let raise = lua
            .create_function(|_, ()| -> mlua::Result<()> {
                Err(mlua::Error::RuntimeError(
                    "instruction_limit exceeded".to_string(),
                ))
            })
            .unwrap();
        let err = raise.call::<()>(()).unwrap_err();
        assert_eq!(guest_message(&err), "instruction_limit exceeded");
    }

    #[test]
    fn test_guest_message_strips_traceback() {
        let err = mlua::Error::RuntimeError("output_limit exceeded\nstack traceback:".to_string());
        assert_eq!(guest_message(&err), "output_limit exceeded");
    }
}
