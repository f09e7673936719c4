//! Type-tagged parameter bindings.
//!
//! A procedure accumulates [`Binding`]s in call order. Each carries one or more
//! [`TaggedValue`]s whose single-character type code is resolved against the
//! value only when the statement is bound.

use crate::error::{DbError, DbResult};
use crate::models::{ParamType, Value};

/// A value paired with the type code it was bound under.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedValue {
    pub tag: char,
    pub value: Value,
}

impl TaggedValue {
    pub fn new(tag: char, value: impl Into<Value>) -> Self {
        Self {
            tag,
            value: value.into(),
        }
    }

    pub fn typed(kind: ParamType, value: impl Into<Value>) -> Self {
        Self::new(kind.tag(), value)
    }

    /// Resolve the tag into the value the engine will receive.
    ///
    /// NULL binds as NULL whatever the tag says. Otherwise the tag must be one
    /// of `b`, `d`, `i`, `s` and the value must fit it: integers widen to
    /// floats and text may be stored as a blob, nothing else converts.
    pub fn resolve(self) -> DbResult<Value> {
        if self.value.is_null() {
            return Ok(Value::Null);
        }
        let kind = ParamType::from_tag(self.tag)
            .ok_or_else(|| DbError::bind(format!("Cannot resolve type \"{}\"", self.tag)))?;

        match (kind, self.value) {
            (ParamType::Integer, v @ Value::Integer(_)) => Ok(v),
            (ParamType::Float, v @ Value::Float(_)) => Ok(v),
            (ParamType::Float, Value::Integer(i)) => Ok(Value::Float(i as f64)),
            (ParamType::Text, v @ Value::Text(_)) => Ok(v),
            (ParamType::Blob, v @ Value::Blob(_)) => Ok(v),
            (ParamType::Blob, Value::Text(s)) => Ok(Value::Blob(s.into_bytes())),
            (kind, other) => Err(DbError::bind(format!(
                "Cannot bind {} value as {}",
                other.type_name(),
                kind
            ))),
        }
    }
}

/// One pending parameter: a scalar for a plain marker, or a list for a spread marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Single(TaggedValue),
    List(Vec<TaggedValue>),
}

impl Binding {
    pub fn is_list(&self) -> bool {
        matches!(self, Binding::List(_))
    }

    /// Number of engine parameters this binding contributes.
    pub fn width(&self) -> usize {
        match self {
            Binding::Single(_) => 1,
            Binding::List(items) => items.len(),
        }
    }
}
