//! Static checks run before any side effect
//!
//! [`validate`] stops at the first problem; [`validate_all`] walks the whole
//! program and reports everything it finds in walk order.

use crate::api::{ApiDescriptor, TypeRef};
use crate::error::ValidationError;
use crate::program::{Expression, Location, PathSegment, Program};
use crate::value::Value;

/// Validate `program` against `api`, reporting only the first error
pub fn validate(program: &Program, api: &dyn ApiDescriptor) -> Result<(), ValidationError> {
    let mut validator = Validator::new(program, api, true);
    validator.run();
    match validator.errors.into_iter().next() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Validate `program` against `api`, collecting every error
pub fn validate_all(program: &Program, api: &dyn ApiDescriptor) -> Result<(), Vec<ValidationError>> {
    let mut validator = Validator::new(program, api, false);
    validator.run();
    if validator.errors.is_empty() {
        Ok(())
    } else {
        Err(validator.errors)
    }
}

/// Marker returned once a fail-fast validator has its error
struct Halt;

type Walk = std::result::Result<(), Halt>;

struct Validator<'a> {
    program: &'a Program,
    api: &'a dyn ApiDescriptor,
    fail_fast: bool,
    errors: Vec<ValidationError>,
}

impl<'a> Validator<'a> {
    fn new(program: &'a Program, api: &'a dyn ApiDescriptor, fail_fast: bool) -> Self {
        Self {
            program,
            api,
            fail_fast,
            errors: Vec::new(),
        }
    }

    fn run(&mut self) {
        let program = self.program;
        for (step, expr) in program.steps.iter().enumerate() {
            let location = Location::step(step);
            let outcome = match expr {
                Expression::Call { name, args } => self.check_call(&location, name, args),
                other => self.report(ValidationError::NotExecutable {
                    location,
                    fragment: other.to_json().to_string(),
                }),
            };
            if outcome.is_err() {
                return;
            }
        }
    }

    fn report(&mut self, err: ValidationError) -> Walk {
        tracing::debug!(error = %err, "validation error");
        self.errors.push(err);
        if self.fail_fast { Err(Halt) } else { Ok(()) }
    }

    fn check_expr(&mut self, location: &Location, expr: &Expression) -> Walk {
        match expr {
            Expression::Call { name, args } => self.check_call(location, name, args),
            Expression::ResultRef { index } => {
                if *index as usize >= location.step {
                    return self.report(ValidationError::InvalidReference {
                        step: location.step,
                        index: *index,
                    });
                }
                Ok(())
            }
            Expression::Literal { .. } => Ok(()),
            Expression::ArrayLit { elements } => {
                for (index, element) in elements.iter().enumerate() {
                    self.check_expr(&location.child(PathSegment::Element(index)), element)?;
                }
                Ok(())
            }
            Expression::ObjectLit { properties } => {
                for (key, value) in properties {
                    self.check_expr(&location.child(PathSegment::Property(key.clone())), value)?;
                }
                Ok(())
            }
            Expression::Unknown { fragment } => self.report(ValidationError::NotExecutable {
                location: location.clone(),
                fragment: fragment.clone(),
            }),
        }
    }

    fn check_call(&mut self, location: &Location, name: &str, args: &[Expression]) -> Walk {
        let api = self.api;
        let Some(signature) = api.resolve(name) else {
            self.report(ValidationError::FunctionNotFound {
                location: location.clone(),
                name: name.to_string(),
            })?;
            // Keep walking the arguments when collecting everything.
            for (index, arg) in args.iter().enumerate() {
                self.check_expr(&location.child(PathSegment::Argument(index)), arg)?;
            }
            return Ok(());
        };

        for (index, arg) in args.iter().enumerate() {
            self.check_expr(&location.child(PathSegment::Argument(index)), arg)?;
        }

        let expected: Vec<&TypeRef> = if args.len() == signature.params.len() {
            signature.params.iter().map(|param| &param.ty).collect()
        } else if signature.packs(args.len()) {
            let element = signature.params[0].ty.element().unwrap_or(&TypeRef::Any);
            vec![element; args.len()]
        } else {
            return self.report(ValidationError::ArgumentCountMismatch {
                location: location.clone(),
                name: name.to_string(),
                expected: signature.params.len(),
                actual: args.len(),
            });
        };

        for (index, (arg, ty)) in args.iter().zip(expected).enumerate() {
            if let Some(found) = self.mismatch(ty, arg) {
                self.report(ValidationError::ArgumentTypeMismatch {
                    location: location.clone(),
                    name: name.to_string(),
                    argument: index,
                    expected: ty.to_string(),
                    found,
                })?;
            }
        }
        Ok(())
    }

    /// Static shape of `expr` when it is not assignable to `expected`
    fn mismatch(&self, expected: &TypeRef, expr: &Expression) -> Option<String> {
        if *expected == TypeRef::Any {
            return None;
        }
        match expr {
            Expression::Literal { value } => value_mismatch(expected, value),
            Expression::ArrayLit { elements } => match expected {
                TypeRef::Array(element) => elements
                    .iter()
                    .find_map(|item| self.mismatch(element, item))
                    .map(|found| format!("{}[]", found)),
                _ => Some("array".to_string()),
            },
            Expression::ObjectLit { .. } => match expected {
                TypeRef::Named(_) => None,
                _ => Some("object".to_string()),
            },
            Expression::Call { name, .. } => {
                let returns = self
                    .api
                    .resolve(name)
                    .map(|signature| signature.returns.clone())
                    .unwrap_or(TypeRef::Any);
                static_mismatch(expected, &returns)
            }
            Expression::ResultRef { index } => {
                let returns = self.step_return_type(*index as usize);
                static_mismatch(expected, &returns)
            }
            Expression::Unknown { .. } => None,
        }
    }

    fn step_return_type(&self, step: usize) -> TypeRef {
        match self.program.steps.get(step) {
            Some(Expression::Call { name, .. }) => self
                .api
                .resolve(name)
                .map(|signature| signature.returns.clone())
                .unwrap_or(TypeRef::Any),
            _ => TypeRef::Any,
        }
    }
}

fn static_mismatch(expected: &TypeRef, found: &TypeRef) -> Option<String> {
    if expected.accepts(found) {
        None
    } else {
        Some(found.to_string())
    }
}

fn value_mismatch(expected: &TypeRef, value: &Value) -> Option<String> {
    match value {
        // Deferred to run time.
        Value::Undefined => None,
        Value::Null => static_mismatch(expected, &TypeRef::Null),
        Value::Bool(_) => static_mismatch(expected, &TypeRef::Boolean),
        Value::Number(_) => static_mismatch(expected, &TypeRef::Number),
        Value::String(_) => static_mismatch(expected, &TypeRef::String),
        Value::Array(items) => match expected {
            TypeRef::Array(element) => items
                .iter()
                .find_map(|item| value_mismatch(element, item))
                .map(|found| format!("{}[]", found)),
            _ => Some("array".to_string()),
        },
        Value::Object(_) => match expected {
            TypeRef::Named(_) => None,
            _ => Some("object".to_string()),
        },
    }
}
