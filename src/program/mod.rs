//! Program tree produced by the parser and consumed by every backend
//!
//! Nodes are immutable once built and carry names only, never bindings, so a
//! single [`Program`] can be validated or executed against any number of API
//! surfaces, concurrently if need be.

use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use serde_json::{Map, json};
use std::fmt;

use crate::value::Value;

/// JSON document parser
pub mod parser;

pub use parser::{parse_program, parse_program_value};

/// Canonical key naming the function of a call
pub const FUNC_KEY: &str = "func";
/// Canonical key holding call arguments
pub const ARGS_KEY: &str = "args";
/// Canonical key of a result reference
pub const REF_KEY: &str = "ref";
/// Canonical key of the step array
pub const STEPS_KEY: &str = "steps";
/// Canonical key of the unresolved fragment list
pub const UNRESOLVED_KEY: &str = "unresolved";

/// Parsed program: ordered top-level steps
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    /// Top-level steps. Well-formed steps are [`Expression::Call`]; anything
    /// else the parser saw in a step position is kept as [`Expression::Unknown`].
    pub steps: Vec<Expression>,
    /// Request fragments the producer could not map to a call. Never executed.
    pub unresolved: Vec<String>,
}

/// Expression node
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Invoke a named function
    Call {
        /// Function name as written
        name: String,
        /// Positional arguments
        args: Vec<Expression>,
    },
    /// Value produced by an earlier top-level step
    ResultRef {
        /// Zero-based step index
        index: u32,
    },
    /// Scalar or null literal
    Literal {
        /// Literal value
        value: Value,
    },
    /// Array literal
    ArrayLit {
        /// Element expressions
        elements: Vec<Expression>,
    },
    /// Object literal; properties keep source order
    ObjectLit {
        /// Property expressions
        properties: IndexMap<String, Expression>,
    },
    /// Fragment the parser could not classify
    Unknown {
        /// Raw JSON text of the fragment
        fragment: String,
    },
}

impl Expression {
    /// Build a call node
    pub fn call(name: impl Into<String>, args: Vec<Expression>) -> Self {
        Expression::Call {
            name: name.into(),
            args,
        }
    }

    /// Build a literal node
    pub fn literal(value: impl Into<Value>) -> Self {
        Expression::Literal {
            value: value.into(),
        }
    }

    /// Build a result reference node
    pub fn result_ref(index: u32) -> Self {
        Expression::ResultRef { index }
    }

    /// Render the node back into the program grammar using canonical keys
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Expression::Call { name, args } => {
                let mut map = Map::new();
                map.insert(FUNC_KEY.to_string(), json!(name));
                if !args.is_empty() {
                    map.insert(
                        ARGS_KEY.to_string(),
                        serde_json::Value::Array(args.iter().map(Expression::to_json).collect()),
                    );
                }
                serde_json::Value::Object(map)
            }
            Expression::ResultRef { index } => {
                let mut map = Map::new();
                map.insert(REF_KEY.to_string(), json!(index));
                serde_json::Value::Object(map)
            }
            Expression::Literal { value } => value.to_json(),
            Expression::ArrayLit { elements } => {
                serde_json::Value::Array(elements.iter().map(Expression::to_json).collect())
            }
            Expression::ObjectLit { properties } => serde_json::Value::Object(
                properties
                    .iter()
                    .map(|(key, expr)| (key.clone(), expr.to_json()))
                    .collect(),
            ),
            Expression::Unknown { fragment } => serde_json::from_str(fragment)
                .unwrap_or_else(|_| serde_json::Value::String(fragment.clone())),
        }
    }
}

impl Program {
    /// Construct a program from steps
    pub fn new(steps: Vec<Expression>) -> Self {
        Self {
            steps,
            unresolved: Vec::new(),
        }
    }

    /// Number of top-level steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the program has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Render the program back into its JSON document form
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = Map::new();
        map.insert(
            STEPS_KEY.to_string(),
            serde_json::Value::Array(self.steps.iter().map(Expression::to_json).collect()),
        );
        if !self.unresolved.is_empty() {
            map.insert(UNRESOLVED_KEY.to_string(), json!(self.unresolved));
        }
        serde_json::Value::Object(map)
    }

    /// Stable blake3 fingerprint of the canonical rendering, hex encoded
    pub fn fingerprint(&self) -> String {
        blake3::hash(self.to_json().to_string().as_bytes())
            .to_hex()
            .to_string()
    }
}

impl Serialize for Program {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// One hop from a step's call down to a nested expression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// Positional argument of a call
    Argument(usize),
    /// Element of an array literal
    Element(usize),
    /// Property of an object literal
    Property(String),
}

/// Position of an expression inside a program
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Location {
    /// Top-level step index
    pub step: usize,
    /// Path from the step's call to the expression; empty for the step itself
    pub path: Vec<PathSegment>,
}

impl Location {
    /// Location of a top-level step
    pub fn step(step: usize) -> Self {
        Self {
            step,
            path: Vec::new(),
        }
    }

    /// Location one segment deeper
    pub fn child(&self, segment: PathSegment) -> Self {
        let mut path = self.path.clone();
        path.push(segment);
        Self {
            step: self.step,
            path,
        }
    }

    /// Index of the outermost argument on the path, if any
    pub fn argument(&self) -> Option<usize> {
        match self.path.first() {
            Some(PathSegment::Argument(index)) => Some(*index),
            _ => None,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {}", self.step)?;
        if self.path.is_empty() {
            return Ok(());
        }
        f.write_str(", ")?;
        for (position, segment) in self.path.iter().enumerate() {
            match segment {
                PathSegment::Argument(index) if position == 0 => write!(f, "args[{}]", index)?,
                PathSegment::Argument(index) => write!(f, ".args[{}]", index)?,
                PathSegment::Element(index) => write!(f, "[{}]", index)?,
                PathSegment::Property(key) => write!(f, ".{}", key)?,
            }
        }
        Ok(())
    }
}
