//! Static types resolved once per statement at compile time

use serde::{Deserialize, Serialize};
use std::fmt;

/// Static type of an expression, a field or a table column
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// 64-bit signed integer
    Int,
    /// 64-bit floating point
    Float,
    /// Boolean
    Bool,
    /// UTF-8 string
    Str,
    /// Timestamp (nanoseconds since epoch)
    Timestamp,
    /// Type of the `null` literal
    Null,
    /// Ordered collection; `Array(Named(T))` is a collection of events
    Array(Box<Type>),
    /// Untyped string-keyed map
    Map,
    /// Event of a registered event type
    Named(String),
    /// Accepts anything, resolved dynamically
    Any,
    /// Not yet inferred
    Unknown,
}

impl Type {
    pub fn events(event_type: impl Into<String>) -> Self {
        Type::Array(Box::new(Type::Named(event_type.into())))
    }

    pub fn array_of(inner: Type) -> Self {
        Type::Array(Box::new(inner))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Float)
    }

    /// True for types whose values can be ordered by `Value::compare`.
    pub fn is_comparable(&self) -> bool {
        matches!(
            self,
            Type::Int | Type::Float | Type::Str | Type::Bool | Type::Timestamp | Type::Any | Type::Null
        )
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Type::Any | Type::Unknown)
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, Type::Array(_))
    }

    pub fn inner_type(&self) -> Option<&Type> {
        match self {
            Type::Array(t) => Some(t),
            _ => None,
        }
    }

    /// Event type name of an event or of the elements of an event collection.
    pub fn event_type_name(&self) -> Option<&str> {
        match self {
            Type::Named(name) => Some(name),
            Type::Array(inner) => match inner.as_ref() {
                Type::Named(name) => Some(name),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_event_collection(&self) -> bool {
        matches!(self, Type::Array(inner) if matches!(inner.as_ref(), Type::Named(_)))
    }

    /// Whether a value of type `other` can be stored where `self` is
    /// expected, ignoring event inheritance (see `SchemaRegistry`).
    pub fn accepts(&self, other: &Type) -> bool {
        match (self, other) {
            (a, b) if a == b => true,
            (Type::Any | Type::Unknown, _) | (_, Type::Any | Type::Unknown) => true,
            (_, Type::Null) => true,
            (Type::Float, Type::Int) => true,
            (Type::Array(a), Type::Array(b)) => a.accepts(b),
            _ => false,
        }
    }

    /// Result type of arithmetic between two numeric types.
    pub fn numeric_result(&self, other: &Type) -> Type {
        match (self, other) {
            (Type::Int, Type::Int) => Type::Int,
            (Type::Int | Type::Float, Type::Int | Type::Float) => Type::Float,
            _ => Type::Any,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Bool => write!(f, "bool"),
            Type::Str => write!(f, "str"),
            Type::Timestamp => write!(f, "timestamp"),
            Type::Null => write!(f, "null"),
            Type::Array(t) => match t.as_ref() {
                Type::Named(name) => write!(f, "collection of events of type '{}'", name),
                inner => write!(f, "collection of {}", inner),
            },
            Type::Map => write!(f, "map"),
            Type::Named(name) => write!(f, "event of type '{}'", name),
            Type::Any => write!(f, "any"),
            Type::Unknown => write!(f, "?"),
        }
    }
}
