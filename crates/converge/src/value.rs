//! Comparable field values and change sets.

use crate::task::TaskKey;
use assets::{ResourceRef, resources_match};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Reference from one task's field to another task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub key: TaskKey,
    /// Compared instead of the key when both sides have one.
    pub id: Option<String>,
}

/// A field value as seen by the diff.
#[derive(Clone)]
pub enum Value {
    Str(String),
    Bool(bool),
    Int(i64),
    Resource(ResourceRef),
    Ref(TaskRef),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    fn is_empty_collection(&self) -> bool {
        match self {
            Value::List(items) => items.is_empty(),
            Value::Map(items) => items.is_empty(),
            _ => false,
        }
    }

    pub fn as_resource(&self) -> Option<&ResourceRef> {
        match self {
            Value::Resource(r) => Some(r),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Resource(r) => f.debug_tuple("Resource").field(r).finish(),
            other => write!(f, "{other}"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Resource(_) => f.write_str("<resource>"),
            Value::Ref(r) => match &r.id {
                Some(id) => write!(f, "id:{id}"),
                None => write!(f, "name:{}", r.key.name),
            },
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(items) => {
                f.write_str("{")?;
                for (i, (k, v)) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<ResourceRef> for Value {
    fn from(r: ResourceRef) -> Self {
        Value::Resource(r)
    }
}

impl From<TaskRef> for Value {
    fn from(r: TaskRef) -> Self {
        Value::Ref(r)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::List(items.into_iter().map(Value::Str).collect())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, String>> for Value {
    fn from(items: BTreeMap<String, String>) -> Self {
        Value::Map(items.into_iter().map(|(k, v)| (k, Value::Str(v))).collect())
    }
}

/// A named field; `None` means "not specified" and is never diffed.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: &'static str,
    pub value: Option<Value>,
}

impl Field {
    pub fn new(name: &'static str, value: impl Into<Value>) -> Self {
        Self {
            name,
            value: Some(value.into()),
        }
    }

    pub fn opt<V: Into<Value>>(name: &'static str, value: Option<V>) -> Self {
        Self {
            name,
            value: value.map(Into::into),
        }
    }
}

/// Compare an actual value against an expected one.
///
/// Resources compare by content and count as different while not ready.
/// References compare by id when both carry one.
pub fn values_equal(actual: &Value, expected: &Value) -> assets::Result<bool> {
    Ok(match (actual, expected) {
        (Value::Str(a), Value::Str(e)) => a == e,
        (Value::Bool(a), Value::Bool(e)) => a == e,
        (Value::Int(a), Value::Int(e)) => a == e,
        (Value::Resource(a), Value::Resource(e)) => {
            if Arc::ptr_eq(a, e) {
                a.is_ready()
            } else if !a.is_ready() || !e.is_ready() {
                false
            } else {
                resources_match(a.as_ref(), e.as_ref())?
            }
        }
        (Value::Ref(a), Value::Ref(e)) => match (&a.id, &e.id) {
            (Some(a_id), Some(e_id)) => a_id == e_id,
            _ => a.key == e.key,
        },
        (Value::List(a), Value::List(e)) => {
            if a.len() != e.len() {
                return Ok(false);
            }
            for (x, y) in a.iter().zip(e) {
                if !values_equal(x, y)? {
                    return Ok(false);
                }
            }
            true
        }
        (Value::Map(a), Value::Map(e)) => {
            if a.len() != e.len() || a.keys().ne(e.keys()) {
                return Ok(false);
            }
            for (x, y) in a.values().zip(e.values()) {
                if !values_equal(x, y)? {
                    return Ok(false);
                }
            }
            true
        }
        _ => false,
    })
}

/// Whether an expected value counts as unchanged against a possibly
/// missing actual value.
pub(crate) fn field_unchanged(actual: Option<&Value>, expected: &Value) -> assets::Result<bool> {
    match actual {
        Some(a) => values_equal(a, expected),
        None => Ok(expected.is_empty_collection()),
    }
}

/// One field that differs.
#[derive(Debug, Clone)]
pub struct FieldChange {
    pub name: &'static str,
    pub before: Option<Value>,
    pub after: Value,
}

/// The fields of a task that need to change, in field order.
#[derive(Debug, Clone, Default)]
pub struct Changes(Vec<FieldChange>);

impl Changes {
    pub fn push(&mut self, change: FieldChange) {
        self.0.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&FieldChange> {
        self.0.iter().find(|c| c.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldChange> {
        self.0.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|c| c.name.to_string()).collect()
    }
}
