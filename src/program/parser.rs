use indexmap::IndexMap;
use serde_json::{Map, Value as Json};

use super::{ARGS_KEY, Expression, FUNC_KEY, Program, REF_KEY, STEPS_KEY, UNRESOLVED_KEY};
use crate::error::ParseError;
use crate::value::Value;

type ParseResult<T> = std::result::Result<T, ParseError>;

/// Parse program text into a [`Program`]
pub fn parse_program(source: &str) -> ParseResult<Program> {
    let document: Json = serde_json::from_str(source)?;
    parse_program_value(&document)
}

/// Parse an already decoded JSON document into a [`Program`]
///
/// Only a missing `steps` array, a non-object root, or a negative result
/// reference are fatal. Every other unrecognized shape degrades to
/// [`Expression::Unknown`].
pub fn parse_program_value(document: &Json) -> ParseResult<Program> {
    let root = document.as_object().ok_or(ParseError::NotAnObject)?;
    let steps = lookup(root, STEPS_KEY)
        .and_then(Json::as_array)
        .ok_or(ParseError::MissingSteps)?;

    let mut parser = Parser::default();
    let mut parsed = Vec::with_capacity(steps.len());
    for step in steps {
        parsed.push(parser.parse_step(step)?);
    }

    let unresolved = lookup(root, UNRESOLVED_KEY)
        .and_then(Json::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| match item {
                    Json::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    if parser.degraded > 0 {
        tracing::warn!(
            fragments = parser.degraded,
            "program contains unrecognized fragments"
        );
    }

    Ok(Program {
        steps: parsed,
        unresolved,
    })
}

/// Look up a reserved key under its canonical or `@`-prefixed spelling
fn lookup<'a>(object: &'a Map<String, Json>, key: &str) -> Option<&'a Json> {
    object
        .get(key)
        .or_else(|| object.get(format!("@{}", key).as_str()))
}

fn is_reserved(key: &str, reserved: &str) -> bool {
    key == reserved || key.strip_prefix('@') == Some(reserved)
}

#[derive(Default)]
struct Parser {
    degraded: usize,
}

impl Parser {
    fn parse_step(&mut self, step: &Json) -> ParseResult<Expression> {
        match self.parse_expr(step)? {
            call @ Expression::Call { .. } => Ok(call),
            Expression::Unknown { fragment } => Ok(Expression::Unknown { fragment }),
            _ => Ok(self.unknown(step)),
        }
    }

    fn parse_expr(&mut self, json: &Json) -> ParseResult<Expression> {
        match json {
            Json::Null | Json::Bool(_) | Json::Number(_) | Json::String(_) => {
                Ok(Expression::Literal {
                    value: Value::from_json(json),
                })
            }
            Json::Array(items) => {
                let mut elements = Vec::with_capacity(items.len());
                for item in items {
                    elements.push(self.parse_expr(item)?);
                }
                Ok(Expression::ArrayLit { elements })
            }
            Json::Object(object) => self.parse_object(json, object),
        }
    }

    fn parse_object(&mut self, json: &Json, object: &Map<String, Json>) -> ParseResult<Expression> {
        if object.keys().any(|key| is_reserved(key, FUNC_KEY)) {
            return self.parse_call(json, object);
        }
        if object.keys().any(|key| is_reserved(key, REF_KEY)) {
            return self.parse_ref(json, object);
        }

        let mut properties = IndexMap::with_capacity(object.len());
        for (key, value) in object {
            properties.insert(key.clone(), self.parse_expr(value)?);
        }
        Ok(Expression::ObjectLit { properties })
    }

    fn parse_call(&mut self, json: &Json, object: &Map<String, Json>) -> ParseResult<Expression> {
        let extra = object
            .keys()
            .any(|key| !is_reserved(key, FUNC_KEY) && !is_reserved(key, ARGS_KEY));
        let name = match lookup(object, FUNC_KEY) {
            Some(Json::String(name)) if !extra => name.clone(),
            _ => return Ok(self.unknown(json)),
        };

        let args = match lookup(object, ARGS_KEY) {
            None => Vec::new(),
            Some(Json::Array(items)) => {
                let mut args = Vec::with_capacity(items.len());
                for item in items {
                    args.push(self.parse_expr(item)?);
                }
                args
            }
            Some(_) => return Ok(self.unknown(json)),
        };

        Ok(Expression::Call { name, args })
    }

    fn parse_ref(&mut self, json: &Json, object: &Map<String, Json>) -> ParseResult<Expression> {
        if object.len() != 1 {
            return Ok(self.unknown(json));
        }
        let Some(Json::Number(number)) = lookup(object, REF_KEY) else {
            return Ok(self.unknown(json));
        };

        if let Some(index) = number.as_u64() {
            return u32::try_from(index)
                .map(|index| Expression::ResultRef { index })
                .map_err(|_| ParseError::InvalidReference {
                    index: i64::try_from(index).unwrap_or(i64::MAX),
                });
        }
        if let Some(index) = number.as_i64() {
            return Err(ParseError::InvalidReference { index });
        }
        // Whole numbers written with a fraction (`1.0`, `-1.0`) are indices too.
        match number.as_f64() {
            Some(value) if value.is_finite() && value.fract() == 0.0 => {
                if (0.0..=f64::from(u32::MAX)).contains(&value) {
                    Ok(Expression::ResultRef {
                        index: value as u32,
                    })
                } else {
                    Err(ParseError::InvalidReference {
                        index: value as i64,
                    })
                }
            }
            _ => Ok(self.unknown(json)),
        }
    }

    fn unknown(&mut self, json: &Json) -> Expression {
        self.degraded += 1;
        let fragment = json.to_string();
        tracing::debug!(%fragment, "unrecognized program fragment");
        Expression::Unknown { fragment }
    }
}
