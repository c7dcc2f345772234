//! Error types crossing the engine's public boundary
//!
//! Compile-time failures abort before any bytecode runs and carry the file
//! and byte offset that produced them. Runtime failures surface to the host
//! as an [`EngineError`] holding the thrown value, a message derived from
//! it, and the captured call stack.

use crate::value::Value;
use skiff_core::Position;
use std::fmt;

/// What kind of compile-time failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// Malformed or disallowed program text (duplicate strict parameters,
    /// octal literals under strict mode, nesting deeper than 255 stashes).
    Syntax,
    /// A name used in a position inconsistent with its declaration.
    Reference,
}

/// A failure raised by the lexer, parser or compiler.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
    pub file: String,
    pub offset: usize,
    pub position: Position,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            CompileErrorKind::Syntax => "SyntaxError",
            CompileErrorKind::Reference => "ReferenceError",
        };
        write!(
            f,
            "{}: {} ({}:{})",
            label, self.message, self.file, self.position
        )
    }
}

impl std::error::Error for CompileError {}

/// One frame of a captured script stack: innermost first.
#[derive(Debug, Clone)]
pub struct StackFrame {
    /// Function name, or `None` for top-level code.
    pub func_name: Option<String>,
    pub file: String,
    pub position: Position,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.func_name {
            Some(name) => write!(f, "{} ({}:{})", name, self.file, self.position),
            None => write!(f, "{}:{}", self.file, self.position),
        }
    }
}

/// A failure surfaced to the embedder.
#[derive(Debug)]
pub enum EngineError {
    /// Compilation failed before execution.
    Compile(CompileError),
    /// A script value was thrown and never caught. The message is derived
    /// from the value; the value itself stays available for inspection.
    Script {
        value: Value,
        message: String,
        stack: Vec<StackFrame>,
    },
    /// The host interrupted execution; carries the host-provided payload.
    Interrupted { payload: String },
    /// A host conversion could not represent the value (cyclic data,
    /// functions in JSON export).
    Conversion(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Compile(e) => write!(f, "{}", e),
            EngineError::Script { message, stack, .. } => {
                write!(f, "{}", message)?;
                for frame in stack {
                    write!(f, "\n    at {}", frame)?;
                }
                Ok(())
            }
            EngineError::Interrupted { payload } => write!(f, "interrupted: {}", payload),
            EngineError::Conversion(msg) => write!(f, "conversion error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<CompileError> for EngineError {
    fn from(e: CompileError) -> Self {
        EngineError::Compile(e)
    }
}
