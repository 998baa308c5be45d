//! Error types for the step engine
//!
//! Each stage owns a thiserror enum carrying typed positional context; the
//! top-level [`EngineError`] wraps them so callers can match on the stage
//! that failed.

use thiserror::Error;

use crate::program::Location;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// Parsing the program document failed
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Static validation rejected the program
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Validation collected several errors
    #[error("Validation failed with {} error(s)", .0.len())]
    ValidationReport(Vec<ValidationError>),

    /// Execution failed
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Lowering or host compilation failed
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    /// Source emission failed
    #[error("Transpile error: {0}")]
    Transpile(#[from] TranspileError),

    /// Program exceeds the configured step limit
    #[error("Program has {actual} steps, limit is {limit}")]
    TooManySteps {
        /// Configured limit
        limit: usize,
        /// Steps in the program
        actual: usize,
    },
}

/// Structural errors raised while parsing a program document
#[derive(Debug, Error)]
pub enum ParseError {
    /// Input text is not JSON
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Document root is not an object
    #[error("Program document must be a JSON object")]
    NotAnObject,

    /// Document has no `steps` array
    #[error("Program document has no `steps` array")]
    MissingSteps,

    /// Result reference index is negative or does not fit a step index
    #[error("Invalid result reference index {index}")]
    InvalidReference {
        /// Index as written in the document
        index: i64,
    },
}

/// Static validation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// Called function is not part of the API surface
    #[error("Function '{name}' not found ({location})")]
    FunctionNotFound {
        /// Position of the call
        location: Location,
        /// Function name as written
        name: String,
    },

    /// Argument count does not match the signature
    #[error("Function '{name}' expects {expected} argument(s), got {actual} ({location})")]
    ArgumentCountMismatch {
        /// Position of the call
        location: Location,
        /// Function name
        name: String,
        /// Declared parameter count
        expected: usize,
        /// Supplied argument count
        actual: usize,
    },

    /// Argument shape is not assignable to the declared parameter type
    #[error("Argument {argument} of '{name}' expects {expected}, found {found} ({location})")]
    ArgumentTypeMismatch {
        /// Position of the call
        location: Location,
        /// Function name
        name: String,
        /// Argument index within the call
        argument: usize,
        /// Declared parameter type
        expected: String,
        /// Static shape of the supplied argument
        found: String,
    },

    /// Result reference does not point at an earlier step
    #[error("Step {step} references result {index}, which is not an earlier step")]
    InvalidReference {
        /// Step containing the reference
        step: usize,
        /// Referenced step index
        index: u32,
    },

    /// Expression could not be classified by the parser
    #[error("Unrecognized expression {fragment} ({location})")]
    NotExecutable {
        /// Position of the fragment
        location: Location,
        /// Raw source fragment
        fragment: String,
    },
}

/// Failure reported by a host [`ApiSurface`](crate::api::ApiSurface) call
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// Host function failed
    #[error("{message}")]
    Failed {
        /// Host supplied description
        message: String,
    },

    /// Host rejected one argument
    #[error("invalid argument {index}: {message}")]
    InvalidArgument {
        /// Argument index
        index: usize,
        /// Host supplied description
        message: String,
    },

    /// Host has no implementation for the function
    #[error("function '{name}' is not available")]
    Unavailable {
        /// Function name
        name: String,
    },

    /// Host observed cancellation while the call was in flight
    #[error("call cancelled")]
    Cancelled,
}

impl CallError {
    /// Shorthand for [`CallError::Failed`]
    pub fn failed(message: impl Into<String>) -> Self {
        CallError::Failed {
            message: message.into(),
        }
    }
}

/// Execution errors shared by every backend
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    /// Host call failed
    #[error("Call to '{function}' failed at {location}: {source}")]
    Call {
        /// Position of the failing call
        location: Location,
        /// Function name
        function: String,
        /// Host failure, unchanged
        source: CallError,
    },

    /// Result reference read a slot that was not produced yet
    #[error("Step {step} references result {index}, which is not available")]
    InvalidReference {
        /// Step containing the reference
        step: usize,
        /// Referenced step index
        index: u32,
    },

    /// Unrecognized expression reached execution
    #[error("Unrecognized expression {fragment} at {location}")]
    NotExecutable {
        /// Position of the fragment
        location: Location,
        /// Raw source fragment
        fragment: String,
    },

    /// Run was cancelled before or during a step
    #[error("Execution cancelled at step {step}")]
    Cancelled {
        /// Step that was aborted or not started
        step: usize,
    },

    /// Value could not be converted into the declared host type
    #[error("Cannot cast {found} to {expected} at {location}")]
    Cast {
        /// Position of the conversion
        location: Location,
        /// Target type
        expected: String,
        /// Kind of the supplied value
        found: String,
    },
}

/// One diagnostic reported by a host compiler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// 1-based source line
    pub line: usize,
    /// 1-based source column
    pub column: usize,
    /// Diagnostic text
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

/// Compile-time failures of the closure and transpiler backends
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// Called function is not part of the bound surface
    #[error("Function '{name}' not found ({location})")]
    FunctionNotFound {
        /// Position of the call
        location: Location,
        /// Function name
        name: String,
    },

    /// Result reference does not point at an earlier step
    #[error("Step {step} references result {index}, which is not an earlier step")]
    InvalidReference {
        /// Step containing the reference
        step: usize,
        /// Referenced step index
        index: u32,
    },

    /// Expression could not be lowered
    #[error("Unrecognized expression {fragment} ({location})")]
    NotExecutable {
        /// Position of the fragment
        location: Location,
        /// Raw source fragment
        fragment: String,
    },

    /// Host compiler rejected the generated source
    #[error("Host compilation failed:\n{}", render_diagnostics(.0))]
    Diagnostics(Vec<Diagnostic>),
}

fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|diag| format!("  {}", diag))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Features a specific backend does not support
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UnsupportedFeatureError {
    /// Asynchronous function routed to the transpiler backend
    #[error("Asynchronous function '{name}' at step {step} is not supported by the transpiler")]
    AsyncCall {
        /// Step containing the call
        step: usize,
        /// Function name
        name: String,
    },
}

/// Source emission failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TranspileError {
    /// Called function is not declared
    #[error("Function '{name}' not found ({location})")]
    FunctionNotFound {
        /// Position of the call
        location: Location,
        /// Function name
        name: String,
    },

    /// Result reference does not point at an earlier step
    #[error("Step {step} references result {index}, which is not an earlier step")]
    InvalidReference {
        /// Step containing the reference
        step: usize,
        /// Referenced step index
        index: u32,
    },

    /// Expression could not be lowered
    #[error("Unrecognized expression {fragment} ({location})")]
    NotExecutable {
        /// Position of the fragment
        location: Location,
        /// Raw source fragment
        fragment: String,
    },

    /// Program uses a feature this backend lacks
    #[error(transparent)]
    Unsupported(#[from] UnsupportedFeatureError),
}

/// Result type using [`EngineError`]
pub type Result<T> = std::result::Result<T, EngineError>;
