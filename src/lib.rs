//! Stepwise – parse, validate and execute JSON step programs
//!
//! A program is an ordered list of function-call steps whose arguments may be
//! literals, arrays, objects, nested calls, or references to earlier results.
//! The crate provides:
//! - A parser producing a closed expression tree
//! - Static validation against a declared API surface
//! - Three interchangeable backends: interpreter, compiled instruction list,
//!   and transpiled Rust source run through a host compiler
//! - An [`Engine`] facade selecting the backend from configuration

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Host API contract and function tables
pub mod api;
/// Compiled backend
pub mod compiler;
/// Engine facade and configuration
pub mod engine;
/// Error taxonomy
pub mod error;
/// Tree-walking interpreter
pub mod interpreter;
/// Program tree and parser
pub mod program;
/// Transpiler backend
pub mod transpile;
/// Static validation
pub mod validator;
/// Runtime values
pub mod value;

// Re-export key types for convenience
pub use api::{ApiDescriptor, ApiSurface, CancelToken, FunctionSignature, FunctionTable, TypeRef};
pub use compiler::{CompiledProgram, compile};
pub use engine::{Backend, Engine, EngineConfig};
pub use error::{
    CallError, CompileError, EngineError, ParseError, Result, RuntimeError, TranspileError,
    UnsupportedFeatureError, ValidationError,
};
pub use interpreter::{run, run_async};
pub use program::{Expression, Location, PathSegment, Program, parse_program};
pub use transpile::{RustTypeMapper, SourceLoader, TranspiledProgram, transpile};
pub use validator::{validate, validate_all};
pub use value::{Object, Value};

/// Current version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
