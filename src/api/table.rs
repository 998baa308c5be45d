use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::{ApiDescriptor, ApiSurface, CancelToken, FunctionSignature};
use crate::error::CallError;
use crate::value::Value;

/// Synchronous host implementation of a function
pub type SyncHandler = Arc<dyn Fn(&[Value]) -> Result<Value, CallError> + Send + Sync>;

/// Asynchronous host implementation of a function
pub type AsyncHandler =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, CallError>> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
    Declared,
}

#[derive(Clone)]
struct Entry {
    signature: FunctionSignature,
    handler: Handler,
}

/// Immutable name → function map built once at startup
///
/// Serves as an [`ApiDescriptor`] when built from declarations only, and as a
/// full [`ApiSurface`] when handlers are attached.
#[derive(Clone, Default)]
pub struct FunctionTable {
    entries: HashMap<String, Entry>,
    cancel: Option<CancelToken>,
}

impl FunctionTable {
    /// Start building a table
    pub fn builder() -> FunctionTableBuilder {
        FunctionTableBuilder::default()
    }

    /// Table holding declarations only; every call fails with
    /// [`CallError::Unavailable`]
    pub fn from_signatures(signatures: impl IntoIterator<Item = FunctionSignature>) -> Self {
        signatures
            .into_iter()
            .fold(FunctionTable::builder(), FunctionTableBuilder::declare)
            .build()
    }

    /// Declared signatures, sorted by name
    pub fn signatures(&self) -> Vec<&FunctionSignature> {
        let mut signatures: Vec<_> = self.entries.values().map(|entry| &entry.signature).collect();
        signatures.sort_by(|a, b| a.name.cmp(&b.name));
        signatures
    }

    /// Number of declared functions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ApiDescriptor for FunctionTable {
    fn resolve(&self, name: &str) -> Option<&FunctionSignature> {
        self.entries.get(name).map(|entry| &entry.signature)
    }
}

impl ApiSurface for FunctionTable {
    fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, CallError> {
        let entry = self.entries.get(name).ok_or_else(|| unavailable(name))?;
        match &entry.handler {
            Handler::Sync(handler) => handler(&args),
            Handler::Async(handler) => futures::executor::block_on(handler(args)),
            Handler::Declared => Err(unavailable(name)),
        }
    }

    fn call_async<'a>(
        &'a self,
        name: &'a str,
        args: Vec<Value>,
    ) -> BoxFuture<'a, Result<Value, CallError>> {
        match self.entries.get(name).map(|entry| &entry.handler) {
            Some(Handler::Async(handler)) => handler(args),
            Some(Handler::Sync(handler)) => futures::future::ready(handler(&args)).boxed(),
            Some(Handler::Declared) | None => {
                futures::future::ready(Err(unavailable(name))).boxed()
            }
        }
    }

    fn cancellation(&self) -> Option<&CancelToken> {
        self.cancel.as_ref()
    }
}

fn unavailable(name: &str) -> CallError {
    CallError::Unavailable {
        name: name.to_string(),
    }
}

/// Builder for [`FunctionTable`]
#[derive(Default)]
pub struct FunctionTableBuilder {
    entries: HashMap<String, Entry>,
    cancel: Option<CancelToken>,
}

impl FunctionTableBuilder {
    /// Register a synchronous function, replacing any previous entry
    pub fn function<F>(mut self, signature: FunctionSignature, handler: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, CallError> + Send + Sync + 'static,
    {
        self.insert(signature, Handler::Sync(Arc::new(handler)));
        self
    }

    /// Register an asynchronous function; the signature is marked async
    pub fn async_function<F, Fut>(mut self, signature: FunctionSignature, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |args| handler(args).boxed());
        self.insert(signature.asynchronous(), Handler::Async(handler));
        self
    }

    /// Declare a function without an implementation
    pub fn declare(mut self, signature: FunctionSignature) -> Self {
        self.insert(signature, Handler::Declared);
        self
    }

    /// Attach a cancellation token the engine checks between steps
    pub fn cancellation(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Finish the table
    pub fn build(self) -> FunctionTable {
        FunctionTable {
            entries: self.entries,
            cancel: self.cancel,
        }
    }

    fn insert(&mut self, signature: FunctionSignature, handler: Handler) {
        self.entries
            .insert(signature.name.clone(), Entry { signature, handler });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> FunctionTable {
        FunctionTable::builder()
            .function(
                FunctionSignature::new("neg").param("x", "number").returns("number"),
                |args| Ok(Value::Number(-args[0].as_f64().unwrap_or_default())),
            )
            .async_function(FunctionSignature::new("echo").param("v", "any"), |args| async move {
                Ok(args.into_iter().next().unwrap_or_default())
            })
            .declare(FunctionSignature::new("later"))
            .build()
    }

    #[test]
    fn resolves_declared_signatures() {
        let table = table();
        assert_eq!(table.len(), 3);
        assert!(table.resolve("echo").expect("echo").is_async);
        assert!(!table.resolve("neg").expect("neg").is_async);
        assert!(table.resolve("missing").is_none());
        let names: Vec<&str> = table.signatures().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "later", "neg"]);
    }

    #[test]
    fn dispatches_sync_and_async_handlers() {
        let table = table();
        assert_eq!(table.call("neg", vec![Value::Number(2.0)]), Ok(Value::Number(-2.0)));
        assert_eq!(table.call("echo", vec![Value::Bool(true)]), Ok(Value::Bool(true)));
        let result = futures::executor::block_on(table.call_async("echo", vec![Value::Null]));
        assert_eq!(result, Ok(Value::Null));
    }

    #[test]
    fn declarations_are_not_callable() {
        let table = table();
        assert_eq!(
            table.call("later", Vec::new()),
            Err(CallError::Unavailable {
                name: "later".into()
            })
        );
        assert!(matches!(
            table.call("nope", Vec::new()),
            Err(CallError::Unavailable { .. })
        ));
    }
}
