//! Shared host surfaces for integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;

use stepwise::{
    ApiSurface, Backend, CallError, Engine, EngineConfig, FunctionSignature, FunctionTable, Value,
};

pub const BACKENDS: [Backend; 3] = [Backend::Interpreter, Backend::Compiled, Backend::Transpiled];

fn number(args: &[Value], index: usize) -> Result<f64, CallError> {
    args.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| CallError::InvalidArgument {
            index,
            message: "expected a number".into(),
        })
}

fn binary(name: &str) -> FunctionSignature {
    FunctionSignature::new(name)
        .param("a", "number")
        .param("b", "number")
        .returns("number")
}

/// `add`, `sub`, `mul`, `div`, `sum(number[])`, `make_order(Order) -> Order`,
/// `tag(any) -> Tagged` and `split(number, number, number[])`. Every call
/// is appended to `log`.
pub fn arithmetic_with_log(log: Arc<Mutex<Vec<String>>>) -> FunctionTable {
    let logged = move |name: &'static str| {
        let log = log.clone();
        move || log.lock().push(name.to_string())
    };
    let (add, sub, mul, div) = (logged("add"), logged("sub"), logged("mul"), logged("div"));
    let (sum, order, tag, split) = (
        logged("sum"),
        logged("make_order"),
        logged("tag"),
        logged("split"),
    );
    FunctionTable::builder()
        .function(binary("add"), move |args| {
            add();
            Ok(Value::Number(number(args, 0)? + number(args, 1)?))
        })
        .function(binary("sub"), move |args| {
            sub();
            Ok(Value::Number(number(args, 0)? - number(args, 1)?))
        })
        .function(binary("mul"), move |args| {
            mul();
            Ok(Value::Number(number(args, 0)? * number(args, 1)?))
        })
        .function(binary("div"), move |args| {
            div();
            let divisor = number(args, 1)?;
            if divisor == 0.0 {
                return Err(CallError::failed("division by zero"));
            }
            Ok(Value::Number(number(args, 0)? / divisor))
        })
        .function(
            FunctionSignature::new("sum").param("values", "number[]").returns("number"),
            move |args| {
                sum();
                let values = args.first().and_then(Value::as_array).unwrap_or_default();
                Ok(Value::Number(values.iter().filter_map(Value::as_f64).sum()))
            },
        )
        .function(
            FunctionSignature::new("make_order").param("order", "Order").returns("Order"),
            move |args| {
                order();
                Ok(args.first().cloned().unwrap_or_default())
            },
        )
        .function(
            FunctionSignature::new("tag").param("fields", "any").returns("Tagged"),
            move |args| {
                tag();
                Ok(args.first().cloned().unwrap_or_default())
            },
        )
        .function(
            FunctionSignature::new("split")
                .param("a", "number")
                .param("b", "number")
                .param("rest", "number[]")
                .returns("number"),
            move |_| {
                split();
                Ok(Value::Number(0.0))
            },
        )
        .build()
}

pub fn arithmetic() -> FunctionTable {
    arithmetic_with_log(Arc::default())
}

pub fn shared(table: FunctionTable) -> Arc<dyn ApiSurface> {
    Arc::new(table)
}

pub fn engine(backend: Backend) -> Engine {
    Engine::new(EngineConfig {
        backend,
        ..EngineConfig::default()
    })
}
