//! API surface contract between the engine and its host
//!
//! The host describes what it can do with [`FunctionSignature`]s exposed
//! through [`ApiDescriptor`], and performs calls through [`ApiSurface`]. The
//! engine never looks behind either trait; [`FunctionTable`] is a ready-made
//! capability map for hosts that do not need their own dispatch.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::CallError;
use crate::value::Value;

/// Statically constructed function table
pub mod table;
/// Declared semantic types
pub mod types;

pub use table::{FunctionTable, FunctionTableBuilder};
pub use types::TypeRef;

/// One declared parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter name, used in diagnostics and generated source
    pub name: String,
    /// Declared type
    #[serde(rename = "type")]
    pub ty: TypeRef,
}

/// Declared shape of a host function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSignature {
    /// Function name
    pub name: String,
    /// Ordered parameters
    pub params: Vec<Parameter>,
    /// Declared return type
    pub returns: TypeRef,
    /// Whether the host completes the call asynchronously
    #[serde(default, rename = "async")]
    pub is_async: bool,
}

impl FunctionSignature {
    /// Start a synchronous signature with no parameters returning `any`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: TypeRef::Any,
            is_async: false,
        }
    }

    /// Append a parameter
    pub fn param(mut self, name: impl Into<String>, ty: impl Into<TypeRef>) -> Self {
        self.params.push(Parameter {
            name: name.into(),
            ty: ty.into(),
        });
        self
    }

    /// Set the return type
    pub fn returns(mut self, ty: impl Into<TypeRef>) -> Self {
        self.returns = ty.into();
        self
    }

    /// Mark the function as asynchronous
    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    /// Whether `supplied` positional arguments are bound by packing them into
    /// the single array parameter.
    ///
    /// Packing applies only on a count mismatch against a signature that has
    /// exactly one parameter, and that parameter is an array.
    pub fn packs(&self, supplied: usize) -> bool {
        supplied != self.params.len()
            && self.params.len() == 1
            && matches!(self.params[0].ty, TypeRef::Array(_))
    }
}

/// Bind evaluated arguments to a call, applying the array-packing rule
pub fn bind_arguments(signature: Option<&FunctionSignature>, args: Vec<Value>) -> Vec<Value> {
    match signature {
        Some(signature) if signature.packs(args.len()) => vec![Value::Array(args)],
        _ => args,
    }
}

/// Read-only description of callable functions
pub trait ApiDescriptor {
    /// Look up a function by name
    fn resolve(&self, name: &str) -> Option<&FunctionSignature>;
}

/// Live host capability: description plus invocation
pub trait ApiSurface: ApiDescriptor + Send + Sync {
    /// Invoke `name` synchronously
    fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, CallError>;

    /// Invoke `name` asynchronously. The default completes [`ApiSurface::call`]
    /// immediately.
    fn call_async<'a>(
        &'a self,
        name: &'a str,
        args: Vec<Value>,
    ) -> BoxFuture<'a, Result<Value, CallError>> {
        Box::pin(futures::future::ready(self.call(name, args)))
    }

    /// Cancellation signal checked before each step, if the host supports one
    fn cancellation(&self) -> Option<&CancelToken> {
        None
    }
}

impl<T: ApiDescriptor + ?Sized> ApiDescriptor for Arc<T> {
    fn resolve(&self, name: &str) -> Option<&FunctionSignature> {
        (**self).resolve(name)
    }
}

impl<T: ApiDescriptor + ?Sized> ApiDescriptor for &T {
    fn resolve(&self, name: &str) -> Option<&FunctionSignature> {
        (**self).resolve(name)
    }
}

/// Cloneable cancellation flag shared between a host and the runs it drives
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub(crate) fn is_cancelled(api: &dyn ApiSurface) -> bool {
    api.cancellation().is_some_and(CancelToken::is_cancelled)
}
