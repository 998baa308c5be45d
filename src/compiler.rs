//! Compiled backend: lower a program once, invoke it many times
//!
//! Lowering walks the tree a single time and produces a flat instruction list
//! per step, with every function resolved against the bound surface. Object
//! literals lower to `NewObject` followed by one deferred `InsertProperty`
//! per property, so property values that only exist at invocation time
//! (calls, result references) are evaluated in declared order on each run.

use std::fmt;
use std::sync::Arc;

use crate::api::{ApiSurface, is_cancelled};
use crate::error::{CompileError, RuntimeError};
use crate::interpreter::settle;
use crate::program::{Expression, Location, PathSegment, Program};
use crate::value::{Object, Value};

/// Function resolved at compile time
#[derive(Debug, Clone)]
struct BoundFunction {
    name: String,
    is_async: bool,
}

/// Stack machine instruction
#[derive(Debug, Clone, PartialEq)]
enum Instr {
    /// Push a constant
    Push(Value),
    /// Push the result of an earlier step
    Load { slot: usize },
    /// Pop `len` values into an array
    MakeArray { len: usize },
    /// Push an empty object
    NewObject,
    /// Pop a value and insert it into the object below it
    InsertProperty { key: String },
    /// Pop `argc` arguments and call `function`
    Invoke {
        function: usize,
        argc: usize,
        pack: bool,
        site: usize,
    },
}

/// Reusable executable unit bound to one API surface
pub struct CompiledProgram {
    api: Arc<dyn ApiSurface>,
    functions: Vec<BoundFunction>,
    steps: Vec<Vec<Instr>>,
    sites: Vec<Location>,
    fingerprint: String,
}

/// Lower `program` against `api`
///
/// Fails for unresolved functions, references to steps that are not earlier,
/// and unrecognized fragments. Argument type problems are left to the host at
/// invocation time.
pub fn compile(program: &Program, api: Arc<dyn ApiSurface>) -> Result<CompiledProgram, CompileError> {
    let mut lowering = Lowering {
        api: api.as_ref(),
        functions: Vec::new(),
        sites: Vec::new(),
    };
    let mut steps = Vec::with_capacity(program.steps.len());
    for (step, expr) in program.steps.iter().enumerate() {
        let mut code = Vec::new();
        lowering.lower(expr, Location::step(step), &mut code)?;
        steps.push(code);
    }

    let Lowering {
        functions, sites, ..
    } = lowering;
    let fingerprint = program.fingerprint();
    tracing::info!(
        %fingerprint,
        steps = steps.len(),
        functions = functions.len(),
        "compiled program"
    );
    Ok(CompiledProgram {
        api,
        functions,
        steps,
        sites,
        fingerprint,
    })
}

struct Lowering<'a> {
    api: &'a dyn ApiSurface,
    functions: Vec<BoundFunction>,
    sites: Vec<Location>,
}

impl Lowering<'_> {
    fn lower(
        &mut self,
        expr: &Expression,
        location: Location,
        code: &mut Vec<Instr>,
    ) -> Result<(), CompileError> {
        match expr {
            Expression::Literal { value } => code.push(Instr::Push(value.clone())),
            Expression::ResultRef { index } => {
                let slot = *index as usize;
                if slot >= location.step {
                    return Err(CompileError::InvalidReference {
                        step: location.step,
                        index: *index,
                    });
                }
                code.push(Instr::Load { slot });
            }
            Expression::ArrayLit { elements } => {
                for (index, element) in elements.iter().enumerate() {
                    self.lower(element, location.child(PathSegment::Element(index)), code)?;
                }
                code.push(Instr::MakeArray {
                    len: elements.len(),
                });
            }
            Expression::ObjectLit { properties } => {
                code.push(Instr::NewObject);
                for (key, value) in properties {
                    self.lower(value, location.child(PathSegment::Property(key.clone())), code)?;
                    code.push(Instr::InsertProperty { key: key.clone() });
                }
            }
            Expression::Call { name, args } => {
                let Some(signature) = self.api.resolve(name) else {
                    return Err(CompileError::FunctionNotFound {
                        location,
                        name: name.clone(),
                    });
                };
                let pack = signature.packs(args.len());
                let is_async = signature.is_async;
                for (index, arg) in args.iter().enumerate() {
                    self.lower(arg, location.child(PathSegment::Argument(index)), code)?;
                }
                let function = self.bind(name, is_async);
                self.sites.push(location);
                code.push(Instr::Invoke {
                    function,
                    argc: args.len(),
                    pack,
                    site: self.sites.len() - 1,
                });
            }
            Expression::Unknown { fragment } => {
                return Err(CompileError::NotExecutable {
                    location,
                    fragment: fragment.clone(),
                });
            }
        }
        Ok(())
    }

    fn bind(&mut self, name: &str, is_async: bool) -> usize {
        if let Some(index) = self.functions.iter().position(|f| f.name == name) {
            return index;
        }
        self.functions.push(BoundFunction {
            name: name.to_string(),
            is_async,
        });
        self.functions.len() - 1
    }
}

impl CompiledProgram {
    /// Run the unit, blocking on asynchronous calls
    pub fn invoke(&self) -> Result<Value, RuntimeError> {
        futures::executor::block_on(self.invoke_async())
    }

    /// Run the unit; behaves exactly like the interpreter on the same program
    pub async fn invoke_async(&self) -> Result<Value, RuntimeError> {
        let api = self.api.as_ref();
        let mut results: Vec<Value> = Vec::with_capacity(self.steps.len());
        let mut stack: Vec<Value> = Vec::new();

        for (step, code) in self.steps.iter().enumerate() {
            if is_cancelled(api) {
                return Err(RuntimeError::Cancelled { step });
            }
            tracing::debug!(step, instructions = code.len(), "running compiled step");
            for instr in code {
                match instr {
                    Instr::Push(value) => stack.push(value.clone()),
                    Instr::Load { slot } => {
                        let value = results.get(*slot).cloned().ok_or(
                            RuntimeError::InvalidReference {
                                step,
                                index: *slot as u32,
                            },
                        )?;
                        stack.push(value);
                    }
                    Instr::MakeArray { len } => {
                        let items = stack.split_off(stack.len() - len);
                        stack.push(Value::Array(items));
                    }
                    Instr::NewObject => stack.push(Value::Object(Object::new())),
                    Instr::InsertProperty { key } => {
                        let value = stack.pop().unwrap_or_default();
                        if let Some(Value::Object(object)) = stack.last_mut() {
                            object.insert(key.clone(), value);
                        }
                    }
                    Instr::Invoke {
                        function,
                        argc,
                        pack,
                        site,
                    } => {
                        let bound = &self.functions[*function];
                        let mut args = stack.split_off(stack.len() - argc);
                        if *pack {
                            args = vec![Value::Array(args)];
                        }
                        let location = self.sites[*site].clone();
                        tracing::trace!(function = %bound.name, %location, "host call");
                        let outcome = if bound.is_async {
                            api.call_async(&bound.name, args).await
                        } else {
                            api.call(&bound.name, args)
                        };
                        stack.push(settle(api, &bound.name, location, outcome)?);
                    }
                }
            }
            results.push(stack.pop().unwrap_or_default());
            stack.clear();
        }

        Ok(results.pop().unwrap_or_default())
    }

    /// blake3 fingerprint of the source program
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the unit has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Human-readable instruction listing, one step per block
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (step, code) in self.steps.iter().enumerate() {
            out.push_str(&format!("step {}:\n", step));
            for instr in code {
                out.push_str("  ");
                out.push_str(&self.render(instr));
                out.push('\n');
            }
        }
        out
    }

    fn render(&self, instr: &Instr) -> String {
        match instr {
            Instr::Invoke {
                function,
                argc,
                pack,
                ..
            } => {
                let bound = &self.functions[*function];
                let mode = if bound.is_async { " async" } else { "" };
                let packed = if *pack { " packed" } else { "" };
                format!("invoke {}/{}{}{}", bound.name, argc, packed, mode)
            }
            other => other.to_string(),
        }
    }
}

impl fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("fingerprint", &self.fingerprint)
            .field("steps", &self.steps.len())
            .field("functions", &self.functions)
            .finish()
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Push(value) => write!(f, "push {}", value),
            Instr::Load { slot } => write!(f, "load ${}", slot),
            Instr::MakeArray { len } => write!(f, "array {}", len),
            Instr::NewObject => f.write_str("object"),
            Instr::InsertProperty { key } => write!(f, "insert {:?}", key),
            Instr::Invoke { function, argc, .. } => write!(f, "invoke #{}/{}", function, argc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{FunctionSignature, FunctionTable};
    use crate::error::CallError;
    use crate::program::parse_program;
    use parking_lot::Mutex;

    fn surface(calls: Arc<Mutex<usize>>) -> Arc<dyn ApiSurface> {
        Arc::new(
            FunctionTable::builder()
                .function(
                    FunctionSignature::new("add")
                        .param("a", "number")
                        .param("b", "number")
                        .returns("number"),
                    move |args| {
                        *calls.lock() += 1;
                        let a = args[0].as_f64().ok_or(CallError::InvalidArgument {
                            index: 0,
                            message: "expected number".into(),
                        })?;
                        Ok(Value::Number(a + args[1].as_f64().unwrap_or_default()))
                    },
                )
                .function(
                    FunctionSignature::new("wrap").param("order", "Order").returns("Order"),
                    |args| Ok(args[0].clone()),
                )
                .function(
                    FunctionSignature::new("sum").param("values", "number[]").returns("number"),
                    |args| {
                        Ok(Value::Number(
                            args[0]
                                .as_array()
                                .unwrap_or_default()
                                .iter()
                                .filter_map(Value::as_f64)
                                .sum(),
                        ))
                    },
                )
                .build(),
        )
    }

    #[test]
    fn compiled_unit_is_reusable() {
        let calls = Arc::new(Mutex::new(0));
        let program = parse_program(
            r#"{"steps":[{"func":"add","args":[1,2]},{"func":"add","args":[{"ref":0},10]}]}"#,
        )
        .expect("parse");
        let unit = compile(&program, surface(calls.clone())).expect("compile");
        assert_eq!(unit.invoke(), Ok(Value::Number(13.0)));
        assert_eq!(unit.invoke(), Ok(Value::Number(13.0)));
        assert_eq!(*calls.lock(), 4);
        assert_eq!(unit.fingerprint(), program.fingerprint());
    }

    #[test]
    fn object_properties_are_inserted_at_invocation() {
        let program = parse_program(
            r#"{"steps":[{"func":"add","args":[1,1]},{"func":"wrap","args":[{"label":"x","total":{"func":"add","args":[{"ref":0},3]},"seed":{"ref":0}}]}]}"#,
        )
        .expect("parse");
        let unit = compile(&program, surface(Arc::default())).expect("compile");
        let value = unit.invoke().expect("invoke");
        assert_eq!(value.to_string(), r#"{"label":"x","total":5,"seed":2}"#);
        assert!(unit.disassemble().contains("insert \"total\""));
    }

    #[test]
    fn packed_calls_receive_one_array() {
        let program =
            parse_program(r#"{"steps":[{"func":"sum","args":[1,2,3]}]}"#).expect("parse");
        let unit = compile(&program, surface(Arc::default())).expect("compile");
        assert_eq!(unit.invoke(), Ok(Value::Number(6.0)));
        assert!(unit.disassemble().contains("invoke sum/3 packed"));
    }

    #[test]
    fn unresolved_function_fails_at_compile_time() {
        let program = parse_program(r#"{"steps":[{"func":"launch"}]}"#).expect("parse");
        let err = compile(&program, surface(Arc::default())).unwrap_err();
        assert_eq!(
            err,
            CompileError::FunctionNotFound {
                location: Location::step(0),
                name: "launch".into()
            }
        );
    }

    #[test]
    fn forward_reference_fails_at_compile_time() {
        let program =
            parse_program(r#"{"steps":[{"func":"add","args":[{"ref":1},1]},{"func":"add","args":[1,1]}]}"#)
                .expect("parse");
        assert!(matches!(
            compile(&program, surface(Arc::default())),
            Err(CompileError::InvalidReference { step: 0, index: 1 })
        ));
    }

    #[test]
    fn host_errors_surface_at_invocation() {
        let program =
            parse_program(r#"{"steps":[{"func":"add","args":["one",2]}]}"#).expect("parse");
        let unit = compile(&program, surface(Arc::default())).expect("compile");
        let err = unit.invoke().unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Call { ref function, source: CallError::InvalidArgument { index: 0, .. }, .. } if function == "add"
        ));
    }

    #[test]
    fn empty_program_is_undefined() {
        let unit = compile(&Program::default(), surface(Arc::default())).expect("compile");
        assert!(unit.is_empty());
        assert_eq!(unit.invoke(), Ok(Value::Undefined));
    }
}
