//! Transpiler backend: emit host source, hand it to a host compiler, run the
//! loaded unit.
//!
//! Every step becomes one typed local in a generated `program` function.
//! Locals hold the host type the [`TypeNameMapper`] picks for the callee's
//! declared return type; values cross back into [`Value`] at call and
//! property boundaries. Object literals become small factory functions that
//! take the step locals they read, so property values are evaluated on each
//! run in declared order.
//!
//! The generated text is plain Rust against [`prelude`]. [`SourceLoader`]
//! is the built-in [`HostCompiler`]; it parses the emitted dialect directly
//! so the backend runs without a toolchain.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::api::{ApiDescriptor, ApiSurface, FunctionSignature, TypeRef};
use crate::error::{
    CompileError, Diagnostic, EngineError, RuntimeError, TranspileError, UnsupportedFeatureError,
};
use crate::program::{Expression, Location, PathSegment, Program};
use crate::value::Value;

/// Source loader for the emitted dialect
pub mod loader;
/// Helpers linked by generated source
pub mod prelude;

pub use loader::SourceLoader;

/// Name of the entry function in generated source
pub const ENTRY_POINT: &str = "program";

/// Host type that carries any value without conversion
pub const VALUE_TYPE: &str = "Value";

/// Maps declared semantic types to host type names
pub trait TypeNameMapper: Send + Sync {
    /// Host type for `ty`. Returning [`VALUE_TYPE`] keeps the value untyped.
    fn host_type(&self, ty: &TypeRef) -> String;
}

/// Default mapping onto the prelude's Rust types
///
/// `number`, `string` and `boolean` become `f64`, `String` and `bool`;
/// arrays become `Vec` of their element mapping. Everything else, named
/// record types included, stays a [`Value`] since `null` is assignable to
/// records.
#[derive(Debug, Clone, Copy, Default)]
pub struct RustTypeMapper;

impl TypeNameMapper for RustTypeMapper {
    fn host_type(&self, ty: &TypeRef) -> String {
        match ty {
            TypeRef::Number => "f64".to_string(),
            TypeRef::String => "String".to_string(),
            TypeRef::Boolean => "bool".to_string(),
            TypeRef::Array(element) => format!("Vec<{}>", self.host_type(element)),
            TypeRef::Any | TypeRef::Void | TypeRef::Null | TypeRef::Named(_) => {
                VALUE_TYPE.to_string()
            }
        }
    }
}

/// Generated module after host compilation
pub trait LoadedUnit: Send + Sync {
    /// Run the entry function against `api`
    fn invoke(&self, api: &dyn ApiSurface) -> Result<Value, RuntimeError>;
}

/// Compiles generated source into a runnable unit
///
/// Loading is all-or-nothing: on failure every diagnostic is returned and no
/// unit exists.
pub trait HostCompiler: Send + Sync {
    /// Compile `source`
    fn compile(&self, source: &str) -> Result<Arc<dyn LoadedUnit>, Vec<Diagnostic>>;
}

/// Emit host source for `program`
///
/// Unresolved and asynchronous functions are rejected here, before any
/// source is produced.
pub fn transpile(
    program: &Program,
    api: &dyn ApiDescriptor,
    mapper: &dyn TypeNameMapper,
) -> Result<String, TranspileError> {
    let mut emitter = Emitter {
        api,
        mapper,
        step: 0,
        locals: Vec::with_capacity(program.steps.len()),
        scopes: Vec::new(),
        factories: Vec::new(),
        next_factory: 0,
    };

    let mut body = String::new();
    for (step, expr) in program.steps.iter().enumerate() {
        emitter.step = step;
        let location = Location::step(step);
        let returns = match expr {
            Expression::Call { name, .. } => emitter.signature(name, &location)?.returns.clone(),
            _ => TypeRef::Any,
        };
        let host = mapper.host_type(&returns);
        let value = emitter.value(expr, &location)?;
        let value = if host == VALUE_TYPE {
            value
        } else {
            format!("cast::<{}>({}, {})?", host, location_expr(&location), value)
        };
        let _ = writeln!(body, "    check_cancelled(api, {})?;", step);
        let _ = writeln!(body, "    let step_{}: {} = {};", step, host, value);
        emitter.locals.push(host);
    }
    let result = match program.steps.len() {
        0 => "Value::Undefined".to_string(),
        len => format!("Value::from(step_{})", len - 1),
    };

    let mut source = String::new();
    let _ = writeln!(
        source,
        "// Generated by stepwise from program {}.",
        program.fingerprint()
    );
    let _ = writeln!(source, "// Do not edit.");
    let _ = writeln!(source, "use stepwise::transpile::prelude::*;");
    emitter.factories.sort_by_key(|(index, _)| *index);
    for (_, factory) in &emitter.factories {
        source.push('\n');
        source.push_str(factory);
    }
    let _ = writeln!(source);
    let _ = writeln!(
        source,
        "pub fn {}(api: &dyn ApiSurface) -> Result<Value, RuntimeError> {{",
        ENTRY_POINT
    );
    source.push_str(&body);
    let _ = writeln!(source, "    Ok({})", result);
    let _ = writeln!(source, "}}");

    tracing::debug!(
        steps = program.steps.len(),
        factories = emitter.factories.len(),
        bytes = source.len(),
        "transpiled program"
    );
    Ok(source)
}

/// Transpiled program bound to a surface, ready to invoke
pub struct TranspiledProgram {
    api: Arc<dyn ApiSurface>,
    unit: Arc<dyn LoadedUnit>,
    source: String,
    fingerprint: String,
}

impl TranspiledProgram {
    /// Run the loaded unit once
    pub fn invoke(&self) -> Result<Value, RuntimeError> {
        self.unit.invoke(self.api.as_ref())
    }

    /// Generated source the unit was loaded from
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Fingerprint of the program this was generated from
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl std::fmt::Debug for TranspiledProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranspiledProgram")
            .field("fingerprint", &self.fingerprint)
            .field("source_len", &self.source.len())
            .finish()
    }
}

/// Transpile `program`, compile the source with `compiler` and bind the
/// loaded unit to `api`
pub fn load(
    program: &Program,
    api: Arc<dyn ApiSurface>,
    mapper: &dyn TypeNameMapper,
    compiler: &dyn HostCompiler,
) -> Result<TranspiledProgram, EngineError> {
    let source = transpile(program, &api, mapper)?;
    let unit = compiler
        .compile(&source)
        .map_err(CompileError::Diagnostics)?;
    let fingerprint = program.fingerprint();
    tracing::info!(%fingerprint, steps = program.len(), "loaded transpiled program");
    Ok(TranspiledProgram {
        api,
        unit,
        source,
        fingerprint,
    })
}

struct Emitter<'a> {
    api: &'a dyn ApiDescriptor,
    mapper: &'a dyn TypeNameMapper,
    step: usize,
    /// Host type of each emitted step local
    locals: Vec<String>,
    /// Step locals read by each factory under construction
    scopes: Vec<BTreeSet<usize>>,
    factories: Vec<(usize, String)>,
    next_factory: usize,
}

impl<'a> Emitter<'a> {
    fn signature(
        &self,
        name: &str,
        location: &Location,
    ) -> Result<&'a FunctionSignature, TranspileError> {
        let signature =
            self.api
                .resolve(name)
                .ok_or_else(|| TranspileError::FunctionNotFound {
                    location: location.clone(),
                    name: name.to_string(),
                })?;
        if signature.is_async {
            return Err(UnsupportedFeatureError::AsyncCall {
                step: location.step,
                name: name.to_string(),
            }
            .into());
        }
        Ok(signature)
    }

    /// Expression of type `Value`
    fn value(&mut self, expr: &Expression, location: &Location) -> Result<String, TranspileError> {
        match expr {
            Expression::Literal { value } => self.literal(value, location),
            Expression::ResultRef { index } => {
                let slot = self.local(*index)?;
                Ok(format!("Value::from(step_{}.clone())", slot))
            }
            Expression::ArrayLit { elements } => {
                let items = elements
                    .iter()
                    .enumerate()
                    .map(|(index, element)| {
                        self.value(element, &location.child(PathSegment::Element(index)))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!("Value::Array(vec![{}])", items.join(", ")))
            }
            Expression::ObjectLit { properties } => {
                let properties: Vec<(&String, &Expression)> = properties.iter().collect();
                self.factory(&properties, location)
            }
            Expression::Call { name, args } => self.call(name, args, location),
            Expression::Unknown { fragment } => Err(TranspileError::NotExecutable {
                location: location.clone(),
                fragment: fragment.clone(),
            }),
        }
    }

    fn literal(&mut self, value: &Value, location: &Location) -> Result<String, TranspileError> {
        Ok(match value {
            Value::Undefined => "Value::Undefined".to_string(),
            Value::Null => "Value::Null".to_string(),
            Value::Bool(flag) => format!("Value::Bool({})", flag),
            Value::Number(num) => format!("Value::Number({})", number_literal(*num)),
            Value::String(text) => format!("Value::String({:?}.to_string())", text),
            Value::Array(items) => {
                let items = items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| {
                        self.literal(item, &location.child(PathSegment::Element(index)))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                format!("Value::Array(vec![{}])", items.join(", "))
            }
            Value::Object(object) => {
                let properties: Vec<(&String, Expression)> = object
                    .iter()
                    .map(|(key, value)| (key, Expression::literal(value.clone())))
                    .collect();
                let properties: Vec<(&String, &Expression)> =
                    properties.iter().map(|(key, expr)| (*key, expr)).collect();
                self.factory(&properties, location)?
            }
        })
    }

    fn local(&mut self, index: u32) -> Result<usize, TranspileError> {
        let slot = index as usize;
        if slot >= self.step {
            return Err(TranspileError::InvalidReference {
                step: self.step,
                index,
            });
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(slot);
        }
        Ok(slot)
    }

    fn call(
        &mut self,
        name: &str,
        args: &[Expression],
        location: &Location,
    ) -> Result<String, TranspileError> {
        let signature = self.signature(name, location)?;
        let bound = if signature.packs(args.len()) {
            let element = signature.params[0].ty.element().unwrap_or(&TypeRef::Any);
            let locations: Vec<Location> = (0..args.len())
                .map(|index| location.child(PathSegment::Argument(index)))
                .collect();
            let packed = self.array_of(args, &locations, element)?;
            vec![packed]
        } else {
            args.iter()
                .enumerate()
                .map(|(index, arg)| {
                    let location = location.child(PathSegment::Argument(index));
                    match (arg, signature.params.get(index)) {
                        (Expression::ArrayLit { elements }, Some(param)) => {
                            let element = param.ty.element().unwrap_or(&TypeRef::Any);
                            let locations: Vec<Location> = (0..elements.len())
                                .map(|index| location.child(PathSegment::Element(index)))
                                .collect();
                            self.array_of(elements, &locations, element)
                        }
                        _ => self.value(arg, &location),
                    }
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(format!(
            "invoke(api, {}, {:?}, vec![{}])?",
            location_expr(location),
            name,
            bound.join(", ")
        ))
    }

    /// Host type `expr` is statically known to produce; [`VALUE_TYPE`] when
    /// nothing narrower is declared
    fn static_host(&self, expr: &Expression) -> String {
        let declared = match expr {
            Expression::Literal { value } => match value {
                Value::Bool(_) => TypeRef::Boolean,
                Value::Number(_) => TypeRef::Number,
                Value::String(_) => TypeRef::String,
                _ => TypeRef::Any,
            },
            Expression::ResultRef { index } => {
                return match self.locals.get(*index as usize) {
                    Some(host) => host.clone(),
                    None => VALUE_TYPE.to_string(),
                };
            }
            Expression::Call { name, .. } => match self.api.resolve(name) {
                Some(signature) => signature.returns.clone(),
                None => TypeRef::Any,
            },
            _ => TypeRef::Any,
        };
        self.mapper.host_type(&declared)
    }

    /// Array value whose elements are cast to the host type of `element`
    ///
    /// The typed form is only used when every element is declared to have
    /// that host type; otherwise elements pass through as values unchanged.
    fn array_of(
        &mut self,
        items: &[Expression],
        locations: &[Location],
        element: &TypeRef,
    ) -> Result<String, TranspileError> {
        let host = self.mapper.host_type(element);
        if items.is_empty()
            || host == VALUE_TYPE
            || items.iter().any(|item| self.static_host(item) != host)
        {
            let values = items
                .iter()
                .zip(locations)
                .map(|(item, location)| self.value(item, location))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(format!("Value::Array(vec![{}])", values.join(", ")));
        }
        let mut typed = Vec::with_capacity(items.len());
        for (item, location) in items.iter().zip(locations) {
            if let Expression::ResultRef { index } = item {
                let slot = self.local(*index)?;
                if self.locals[slot] == host {
                    typed.push(format!("step_{}.clone()", slot));
                    continue;
                }
            }
            let value = self.value(item, location)?;
            typed.push(format!(
                "cast::<{}>({}, {})?",
                host,
                location_expr(location),
                value
            ));
        }
        Ok(format!("Value::from(vec![{}])", typed.join(", ")))
    }

    /// Emit a factory for an object literal and return the call to it
    fn factory(
        &mut self,
        properties: &[(&String, &Expression)],
        location: &Location,
    ) -> Result<String, TranspileError> {
        let index = self.next_factory;
        self.next_factory += 1;
        self.scopes.push(BTreeSet::new());

        let mut inserts = String::new();
        for (key, value) in properties {
            let value = match self.value(value, &location.child(PathSegment::Property((*key).clone())))
            {
                Ok(value) => value,
                Err(err) => {
                    self.scopes.pop();
                    return Err(err);
                }
            };
            let _ = writeln!(
                inserts,
                "    object.insert({:?}.to_string(), {});",
                key, value
            );
        }
        let reads = self.scopes.pop().unwrap_or_default();
        if let Some(outer) = self.scopes.last_mut() {
            outer.extend(reads.iter().copied());
        }

        let mut params = String::from("api: &dyn ApiSurface");
        let mut call = format!("object_{}(api", index);
        for slot in &reads {
            let _ = write!(params, ", step_{}: &{}", slot, self.locals[*slot]);
            let _ = write!(call, ", &step_{}", slot);
        }
        call.push_str(")?");

        let mut factory = String::new();
        let _ = writeln!(
            factory,
            "fn object_{}({}) -> Result<Value, RuntimeError> {{",
            index, params
        );
        let _ = writeln!(factory, "    let mut object = Object::new();");
        factory.push_str(&inserts);
        let _ = writeln!(factory, "    Ok(Value::Object(object))");
        let _ = writeln!(factory, "}}");
        self.factories.push((index, factory));
        Ok(call)
    }
}

fn location_expr(location: &Location) -> String {
    let segments: Vec<String> = location
        .path
        .iter()
        .map(|segment| match segment {
            PathSegment::Argument(index) => format!("arg({})", index),
            PathSegment::Element(index) => format!("elem({})", index),
            PathSegment::Property(key) => format!("prop({:?})", key),
        })
        .collect();
    format!("loc({}, &[{}])", location.step, segments.join(", "))
}

fn number_literal(num: f64) -> String {
    if num.is_nan() {
        "f64::NAN".to_string()
    } else if num == f64::INFINITY {
        "f64::INFINITY".to_string()
    } else if num == f64::NEG_INFINITY {
        "f64::NEG_INFINITY".to_string()
    } else {
        format!("{:?}", num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::FunctionTable;
    use crate::program::parse_program;

    fn surface() -> FunctionTable {
        FunctionTable::builder()
            .function(
                FunctionSignature::new("mul")
                    .param("a", "number")
                    .param("b", "number")
                    .returns("number"),
                |args| {
                    Ok(Value::Number(
                        args[0].as_f64().unwrap_or_default() * args[1].as_f64().unwrap_or_default(),
                    ))
                },
            )
            .function(
                FunctionSignature::new("sum").param("values", "number[]").returns("number"),
                |args| {
                    let total = args[0]
                        .as_array()
                        .unwrap_or_default()
                        .iter()
                        .filter_map(Value::as_f64)
                        .sum();
                    Ok(Value::Number(total))
                },
            )
            .function(
                FunctionSignature::new("label").param("text", "string").returns("Label"),
                |args| Ok(args[0].clone()),
            )
            .async_function(FunctionSignature::new("fetch").param("url", "string"), |_| async {
                Ok(Value::Null)
            })
            .build()
    }

    #[test]
    fn steps_become_typed_locals() {
        let program = parse_program(
            r#"{"steps":[{"func":"mul","args":[3,5]},{"func":"label","args":["x"]},{"func":"sum","args":[{"ref":0},2]}]}"#,
        )
        .expect("parse");
        let source = transpile(&program, &surface(), &RustTypeMapper).expect("transpile");
        assert!(source.contains(
            "let step_0: f64 = cast::<f64>(loc(0, &[]), invoke(api, loc(0, &[]), \"mul\", vec![Value::Number(3.0), Value::Number(5.0)])?)?;"
        ));
        assert!(source.contains("let step_1: Value = invoke(api, loc(1, &[]), \"label\""));
        assert!(source.contains(
            "vec![Value::from(vec![step_0.clone(), cast::<f64>(loc(2, &[arg(1)]), Value::Number(2.0))?])]"
        ));
        assert!(source.contains("    Ok(Value::from(step_2))\n"));
    }

    #[test]
    fn arrays_with_untyped_elements_are_not_cast() {
        let program = parse_program(
            r#"{"steps":[{"func":"label","args":["x"]},{"func":"sum","args":[{"ref":0},2]},{"func":"sum","args":[[1,{"func":"label","args":["y"]}]]}]}"#,
        )
        .expect("parse");
        let source = transpile(&program, &surface(), &RustTypeMapper).expect("transpile");
        assert!(source.contains(
            "\"sum\", vec![Value::Array(vec![Value::from(step_0.clone()), Value::Number(2.0)])]"
        ));
        assert!(source.contains(
            "\"sum\", vec![Value::Array(vec![Value::Number(1.0), invoke(api, loc(2, &[arg(0), elem(1)]), \"label\""
        ));
    }

    #[test]
    fn objects_become_factories_over_read_locals() {
        let program = parse_program(
            r#"{"steps":[{"func":"mul","args":[2,2]},{"func":"label","args":[{"ref":0}]},{"func":"sum","args":[{"name":"x","nested":{"n":{"ref":0}}}]}]}"#,
        )
        .expect("parse");
        let source = transpile(&program, &surface(), &RustTypeMapper).expect("transpile");
        assert!(source.contains(
            "fn object_0(api: &dyn ApiSurface, step_0: &f64) -> Result<Value, RuntimeError> {"
        ));
        assert!(source.contains(
            "fn object_1(api: &dyn ApiSurface, step_0: &f64) -> Result<Value, RuntimeError> {"
        ));
        assert!(source.contains("object.insert(\"nested\".to_string(), object_1(api, &step_0)?);"));
        assert!(source.contains("object_0(api, &step_0)?"));
    }

    #[test]
    fn rejects_async_and_unknown_functions() {
        let program =
            parse_program(r#"{"steps":[{"func":"fetch","args":["u"]}]}"#).expect("parse");
        assert_eq!(
            transpile(&program, &surface(), &RustTypeMapper),
            Err(TranspileError::Unsupported(
                UnsupportedFeatureError::AsyncCall {
                    step: 0,
                    name: "fetch".into()
                }
            ))
        );

        let program = parse_program(r#"{"steps":[{"func":"nope"}]}"#).expect("parse");
        assert!(matches!(
            transpile(&program, &surface(), &RustTypeMapper),
            Err(TranspileError::FunctionNotFound { .. })
        ));
    }

    #[test]
    fn forward_references_are_rejected() {
        let program =
            parse_program(r#"{"steps":[{"func":"mul","args":[{"ref":1},1]},{"func":"mul","args":[1,1]}]}"#)
                .expect("parse");
        assert_eq!(
            transpile(&program, &surface(), &RustTypeMapper),
            Err(TranspileError::InvalidReference { step: 0, index: 1 })
        );
    }

    #[test]
    fn mapper_handles_nested_arrays() {
        let mapper = RustTypeMapper;
        assert_eq!(mapper.host_type(&TypeRef::parse("number[][]")), "Vec<Vec<f64>>");
        assert_eq!(mapper.host_type(&TypeRef::parse("Order")), VALUE_TYPE);
        assert_eq!(mapper.host_type(&TypeRef::parse("Order[]")), "Vec<Value>");
    }

    #[test]
    fn number_literals_round_trip_through_rust_syntax() {
        assert_eq!(number_literal(3.0), "3.0");
        assert_eq!(number_literal(-0.5), "-0.5");
        assert_eq!(number_literal(f64::NAN), "f64::NAN");
    }
}
