//! Tagged view over a JSON-Schema object

use serde_json::{Map, Value};

/// Union keyword found on a schema node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnionKeyword {
    AnyOf,
    OneOf,
}

impl UnionKeyword {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnyOf => "anyOf",
            Self::OneOf => "oneOf",
        }
    }
}

/// Shape of a single schema object, decided by its most significant keyword.
///
/// Precedence follows how the backend would be confused first: a reference
/// hides everything else, then composition, then the concrete type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SchemaNode<'a> {
    Ref(&'a str),
    AllOf(&'a [Value]),
    Union {
        keyword: UnionKeyword,
        branches: &'a [Value],
    },
    Object,
    Array,
    Scalar,
}

impl<'a> SchemaNode<'a> {
    pub fn classify(map: &'a Map<String, Value>) -> Self {
        if let Some(reference) = map.get("$ref").and_then(Value::as_str) {
            return Self::Ref(reference);
        }
        if let Some(branches) = map.get("allOf").and_then(Value::as_array) {
            return Self::AllOf(branches);
        }
        for keyword in [UnionKeyword::AnyOf, UnionKeyword::OneOf] {
            if let Some(branches) = map.get(keyword.as_str()).and_then(Value::as_array) {
                return Self::Union { keyword, branches };
            }
        }
        if is_object_schema(map) {
            Self::Object
        } else if map.get("type").and_then(Value::as_str) == Some("array")
            || map.contains_key("items")
        {
            Self::Array
        } else {
            Self::Scalar
        }
    }
}

pub(crate) fn is_object_schema(map: &Map<String, Value>) -> bool {
    map.get("type").and_then(Value::as_str) == Some("object")
        || map.get("properties").is_some_and(Value::is_object)
}

pub(crate) fn is_null_schema(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("null")
}
