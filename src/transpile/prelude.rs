//! Runtime helpers linked by transpiled source
//!
//! Generated modules start with `use stepwise::transpile::prelude::*;` and
//! only ever call the functions defined here, so the same text runs under
//! `rustc` and under [`SourceLoader`](super::SourceLoader).

pub use crate::api::ApiSurface;
pub use crate::error::RuntimeError;
pub use crate::program::{Location, PathSegment};
pub use crate::value::{Object, Value};

use crate::api::is_cancelled;
use crate::interpreter::settle;

/// Conversion from the value container into a typed host local
pub trait FromValue: Sized {
    /// Host type name used in cast diagnostics
    fn type_name() -> String;

    /// Convert, or `None` if the value has the wrong shape
    fn from_value(value: Value) -> Option<Self>;
}

impl FromValue for Value {
    fn type_name() -> String {
        "Value".to_string()
    }

    fn from_value(value: Value) -> Option<Self> {
        Some(value)
    }
}

impl FromValue for f64 {
    fn type_name() -> String {
        "f64".to_string()
    }

    fn from_value(value: Value) -> Option<Self> {
        value.as_f64()
    }
}

impl FromValue for bool {
    fn type_name() -> String {
        "bool".to_string()
    }

    fn from_value(value: Value) -> Option<Self> {
        value.as_bool()
    }
}

impl FromValue for String {
    fn type_name() -> String {
        "String".to_string()
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(text),
            _ => None,
        }
    }
}

impl FromValue for Object {
    fn type_name() -> String {
        "Object".to_string()
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn type_name() -> String {
        format!("Vec<{}>", T::type_name())
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Array(items) => items.into_iter().map(T::from_value).collect(),
            _ => None,
        }
    }
}

/// Cast a value into a typed local
pub fn cast<T: FromValue>(location: Location, value: Value) -> Result<T, RuntimeError> {
    let found = value.kind();
    T::from_value(value).ok_or_else(|| RuntimeError::Cast {
        location,
        expected: T::type_name(),
        found: found.to_string(),
    })
}

/// Call a host function synchronously
pub fn invoke(
    api: &dyn ApiSurface,
    location: Location,
    name: &str,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    tracing::trace!(function = name, %location, "host call");
    settle(api, name, location, api.call(name, args))
}

/// Abort with [`RuntimeError::Cancelled`] if the host requested cancellation
pub fn check_cancelled(api: &dyn ApiSurface, step: usize) -> Result<(), RuntimeError> {
    if is_cancelled(api) {
        return Err(RuntimeError::Cancelled { step });
    }
    tracing::debug!(step, "running transpiled step");
    Ok(())
}

/// Build a location
pub fn loc(step: usize, path: &[PathSegment]) -> Location {
    Location {
        step,
        path: path.to_vec(),
    }
}

/// Argument path segment
pub fn arg(index: usize) -> PathSegment {
    PathSegment::Argument(index)
}

/// Array element path segment
pub fn elem(index: usize) -> PathSegment {
    PathSegment::Element(index)
}

/// Object property path segment
pub fn prop(key: &str) -> PathSegment {
    PathSegment::Property(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn casts_check_shape() {
        let numbers: Vec<f64> = cast(
            loc(0, &[]),
            Value::Array(vec![Value::Number(1.0), Value::Number(2.0)]),
        )
        .expect("numbers");
        assert_eq!(numbers, vec![1.0, 2.0]);

        let err = cast::<Vec<f64>>(loc(1, &[arg(0)]), Value::Array(vec![Value::Null])).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Cast {
                location: loc(1, &[arg(0)]),
                expected: "Vec<f64>".into(),
                found: "array".into(),
            }
        );
    }

    #[test]
    fn typed_locals_convert_back_losslessly() {
        let text: String = cast(loc(0, &[]), Value::from("hi")).expect("string");
        assert_eq!(Value::from(text), Value::String("hi".into()));
        let nested: Vec<Vec<bool>> =
            cast(loc(0, &[]), Value::from(vec![vec![true], vec![false]])).expect("nested");
        assert_eq!(Value::from(nested.clone()), Value::from(nested));
    }
}
