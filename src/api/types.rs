use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Declared semantic type of a parameter or return value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef {
    /// Accepts anything; its values are accepted everywhere
    Any,
    /// No value (`undefined`)
    Void,
    /// JSON `null`
    Null,
    /// Boolean
    Boolean,
    /// Number
    Number,
    /// String
    String,
    /// Array of the element type
    Array(Box<TypeRef>),
    /// Named object type declared by the host schema
    Named(String),
}

impl TypeRef {
    /// Parse a declared type name such as `number`, `string[]` or `Address`
    pub fn parse(text: &str) -> TypeRef {
        let text = text.trim();
        if let Some(element) = text.strip_suffix("[]") {
            return TypeRef::Array(Box::new(TypeRef::parse(element)));
        }
        match text {
            "any" | "unknown" | "" => TypeRef::Any,
            "void" | "undefined" => TypeRef::Void,
            "null" => TypeRef::Null,
            "boolean" | "bool" => TypeRef::Boolean,
            "number" => TypeRef::Number,
            "string" => TypeRef::String,
            other => TypeRef::Named(other.to_string()),
        }
    }

    /// Array of `element`
    pub fn array(element: TypeRef) -> TypeRef {
        TypeRef::Array(Box::new(element))
    }

    /// Element type when this is an array
    pub fn element(&self) -> Option<&TypeRef> {
        match self {
            TypeRef::Array(element) => Some(element),
            _ => None,
        }
    }

    /// Whether a value statically typed as `other` may be passed where `self`
    /// is declared
    pub fn accepts(&self, other: &TypeRef) -> bool {
        match (self, other) {
            (TypeRef::Any, _) | (_, TypeRef::Any) => true,
            (TypeRef::Array(expected), TypeRef::Array(found)) => expected.accepts(found),
            (TypeRef::Named(expected), TypeRef::Named(found)) => expected == found,
            (TypeRef::Named(_), TypeRef::Null) => true,
            (TypeRef::Void, TypeRef::Void)
            | (TypeRef::Null, TypeRef::Null)
            | (TypeRef::Boolean, TypeRef::Boolean)
            | (TypeRef::Number, TypeRef::Number)
            | (TypeRef::String, TypeRef::String) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Any => f.write_str("any"),
            TypeRef::Void => f.write_str("void"),
            TypeRef::Null => f.write_str("null"),
            TypeRef::Boolean => f.write_str("boolean"),
            TypeRef::Number => f.write_str("number"),
            TypeRef::String => f.write_str("string"),
            TypeRef::Array(element) => write!(f, "{}[]", element),
            TypeRef::Named(name) => f.write_str(name),
        }
    }
}

impl From<&str> for TypeRef {
    fn from(text: &str) -> Self {
        TypeRef::parse(text)
    }
}

impl Serialize for TypeRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TypeRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(TypeRef::parse(&text))
    }
}
