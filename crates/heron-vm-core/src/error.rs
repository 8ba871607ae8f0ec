//! VM error types.
//!
//! JS exceptions are *values*: a throw writes the runtime's thrown-value
//! slot and failure propagates as the zero-sized [`Thrown`] marker through
//! `Result`. Rust-level errors ([`VmError`]) only appear at the embedding
//! boundary, where an uncaught thrown value is rendered into a
//! [`JsError`].

use thiserror::Error;

/// Marker that the runtime's thrown-value slot holds a pending exception.
///
/// Functions returning `JsResult` either produced a value or raised; the
/// caller handles the exception or propagates the marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thrown;

/// Result type for operations that may raise a JS exception.
pub type JsResult<T> = Result<T, Thrown>;

/// An uncaught JS exception, rendered for the embedder.
#[derive(Debug, Clone)]
pub struct JsError {
    /// `String(value)` of the thrown value (`name: message` for Error
    /// objects)
    pub message: String,
    /// The `stack` accessor captured at throw time, one line per frame
    pub stack: Vec<String>,
}

impl std::fmt::Display for JsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for line in &self.stack {
            write!(f, "\n    at {line}")?;
        }
        Ok(())
    }
}

/// Errors surfaced by the embedding API.
#[derive(Debug, Error)]
pub enum VmError {
    /// A JS exception reached the native boundary unhandled
    #[error("uncaught exception: {0}")]
    Uncaught(JsError),

    /// The bytecode module failed to load or validate
    #[error("bytecode error: {0}")]
    Bytecode(#[from] heron_vm_bytecode::BytecodeError),

    /// The runtime hit an unrecoverable internal state; the fatal handler
    /// already ran
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Result type for embedding-level operations.
pub type VmResult<T> = Result<T, VmError>;

/// The JS error kinds the core itself raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Calling a non-callable, invalid property stores, bad coercions
    TypeError,
    /// Unresolvable references (`TryGetById` misses)
    ReferenceError,
    /// Out of memory, stack overflow, invalid lengths
    RangeError,
}

impl ErrorKind {
    /// The `name` property of errors of this kind.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::TypeError => "TypeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::RangeError => "RangeError",
        }
    }
}
