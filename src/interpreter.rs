//! Tree-walking execution backend
//!
//! Steps run strictly in order; a step's value is recorded before the next
//! step starts, including when the step suspends on an asynchronous call.

use futures::future::{BoxFuture, FutureExt};

use crate::api::{ApiSurface, bind_arguments, is_cancelled};
use crate::error::{CallError, RuntimeError};
use crate::program::{Expression, Location, PathSegment, Program};
use crate::value::{Object, Value};

/// Execute `program` against `api`, blocking on asynchronous calls
///
/// Use [`run_async`] from inside an async runtime whose host futures depend
/// on that runtime.
pub fn run(program: &Program, api: &dyn ApiSurface) -> Result<Value, RuntimeError> {
    futures::executor::block_on(run_async(program, api))
}

/// Execute `program` against `api`, returning the value of the last step
///
/// An empty program evaluates to [`Value::Undefined`].
pub async fn run_async(program: &Program, api: &dyn ApiSurface) -> Result<Value, RuntimeError> {
    let mut interpreter = Interpreter {
        api,
        results: Vec::with_capacity(program.steps.len()),
    };
    for (step, expr) in program.steps.iter().enumerate() {
        if is_cancelled(api) {
            return Err(RuntimeError::Cancelled { step });
        }
        tracing::debug!(step, "interpreting step");
        let value = interpreter.eval(expr, Location::step(step)).await?;
        interpreter.results.push(value);
    }
    Ok(interpreter.results.pop().unwrap_or_default())
}

struct Interpreter<'a> {
    api: &'a dyn ApiSurface,
    results: Vec<Value>,
}

impl<'a> Interpreter<'a> {
    fn eval<'b>(
        &'b self,
        expr: &'b Expression,
        location: Location,
    ) -> BoxFuture<'b, Result<Value, RuntimeError>> {
        async move {
            match expr {
                Expression::Literal { value } => Ok(value.clone()),
                Expression::ResultRef { index } => self
                    .results
                    .get(*index as usize)
                    .cloned()
                    .ok_or(RuntimeError::InvalidReference {
                        step: location.step,
                        index: *index,
                    }),
                Expression::ArrayLit { elements } => {
                    let mut items = Vec::with_capacity(elements.len());
                    for (index, element) in elements.iter().enumerate() {
                        items.push(
                            self.eval(element, location.child(PathSegment::Element(index)))
                                .await?,
                        );
                    }
                    Ok(Value::Array(items))
                }
                Expression::ObjectLit { properties } => {
                    let mut object = Object::with_capacity(properties.len());
                    for (key, value) in properties {
                        let value = self
                            .eval(value, location.child(PathSegment::Property(key.clone())))
                            .await?;
                        object.insert(key.clone(), value);
                    }
                    Ok(Value::Object(object))
                }
                Expression::Call { name, args } => {
                    let mut values = Vec::with_capacity(args.len());
                    for (index, arg) in args.iter().enumerate() {
                        values.push(
                            self.eval(arg, location.child(PathSegment::Argument(index)))
                                .await?,
                        );
                    }
                    self.invoke(name, values, location).await
                }
                Expression::Unknown { fragment } => Err(RuntimeError::NotExecutable {
                    location,
                    fragment: fragment.clone(),
                }),
            }
        }
        .boxed()
    }

    async fn invoke(
        &self,
        name: &str,
        args: Vec<Value>,
        location: Location,
    ) -> Result<Value, RuntimeError> {
        let signature = self.api.resolve(name);
        let is_async = signature.is_some_and(|signature| signature.is_async);
        let args = bind_arguments(signature, args);
        tracing::trace!(function = name, arity = args.len(), %location, "host call");

        let outcome = if is_async {
            self.api.call_async(name, args).await
        } else {
            self.api.call(name, args)
        };
        settle(self.api, name, location, outcome)
    }
}

/// Map a host call outcome into the engine's error space, turning
/// cancellation observed during the call into [`RuntimeError::Cancelled`]
pub(crate) fn settle(
    api: &dyn ApiSurface,
    name: &str,
    location: Location,
    outcome: Result<Value, CallError>,
) -> Result<Value, RuntimeError> {
    match outcome {
        Err(CallError::Cancelled) => Err(RuntimeError::Cancelled {
            step: location.step,
        }),
        _ if is_cancelled(api) => Err(RuntimeError::Cancelled {
            step: location.step,
        }),
        Ok(value) => Ok(value),
        Err(source) => Err(RuntimeError::Call {
            location,
            function: name.to_string(),
            source,
        }),
    }
}
