//! Deep copy of script values into a self-contained, isolate-independent
//! form.
//!
//! A [`CopiedValue`] owns everything it needs and may be carried to any
//! isolate or plain host thread. Functions, promises, and host objects do
//! not copy; neither do circular structures.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, ScriptError};

use super::heap::{HeapCell, ObjectKind};
use super::isolate::Scope;
use super::value::Value;

/// A deep, self-contained copy of a script value.
#[derive(Debug, Clone, PartialEq)]
pub enum CopiedValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
    Buffer(Bytes),
    /// Insertion-ordered properties.
    Object(Vec<(String, CopiedValue)>),
    Error {
        name: String,
        message: String,
        stack: Option<String>,
    },
}

impl CopiedValue {
    /// Rebuild this copy as live values in `scope`'s isolate.
    pub(crate) fn materialize(&self, scope: &mut Scope<'_>) -> Value {
        match self {
            CopiedValue::Undefined => Value::Undefined,
            CopiedValue::Null => Value::Null,
            CopiedValue::Bool(b) => Value::Bool(*b),
            CopiedValue::Number(n) => Value::Number(*n),
            CopiedValue::String(s) => Value::String(Arc::clone(s)),
            CopiedValue::Buffer(b) => Value::Buffer(b.clone()),
            CopiedValue::Object(entries) => {
                let object = scope.alloc_object();
                for (key, entry) in entries {
                    let value = entry.materialize(scope);
                    // Fresh plain object: set cannot fail.
                    let _ = scope.set_property(&object, key, value);
                }
                object
            }
            CopiedValue::Error {
                name,
                message,
                stack,
            } => scope.alloc_error_with_stack(name, message, stack.as_deref()),
        }
    }

    pub(crate) fn as_property_key(&self) -> Option<String> {
        match self {
            CopiedValue::Undefined => Some("undefined".to_string()),
            CopiedValue::Null => Some("null".to_string()),
            CopiedValue::Bool(b) => Some(b.to_string()),
            CopiedValue::Number(n) => Some(super::value::number_to_key(*n)),
            CopiedValue::String(s) => Some(s.to_string()),
            _ => None,
        }
    }

    pub(crate) fn to_display_string(&self) -> String {
        match self {
            CopiedValue::Undefined => "undefined".to_string(),
            CopiedValue::Null => "null".to_string(),
            CopiedValue::Bool(b) => b.to_string(),
            CopiedValue::Number(n) => super::value::number_to_key(*n),
            CopiedValue::String(s) => s.to_string(),
            CopiedValue::Buffer(_) => "#<Buffer>".to_string(),
            CopiedValue::Object(_) => "#<Object>".to_string(),
            CopiedValue::Error { name, message, .. } => format!("{}: {}", name, message),
        }
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Function(_) => "#<Function>",
        Value::Promise(_) => "#<Promise>",
        Value::Buffer(_) => "#<Buffer>",
        _ => "#<Object>",
    }
}

/// Deep-copy `value` out of the locked isolate.
pub(crate) fn deep_copy(scope: &Scope<'_>, value: &Value) -> crate::Result<CopiedValue> {
    let mut visiting = Vec::new();
    copy_inner(scope, value, &mut visiting)
}

fn copy_inner(scope: &Scope<'_>, value: &Value, visiting: &mut Vec<u32>) -> crate::Result<CopiedValue> {
    match value {
        Value::Undefined => Ok(CopiedValue::Undefined),
        Value::Null => Ok(CopiedValue::Null),
        Value::Bool(b) => Ok(CopiedValue::Bool(*b)),
        Value::Number(n) => Ok(CopiedValue::Number(*n)),
        Value::String(s) => Ok(CopiedValue::String(Arc::clone(s))),
        Value::Buffer(b) => Ok(CopiedValue::Buffer(b.clone())),
        Value::Object(r) => {
            if r.isolate() != scope.isolate_id() {
                return Err(Error::Internal(
                    "cannot copy a value owned by another isolate".to_string(),
                ));
            }
            if visiting.contains(&r.slot) {
                return Err(Error::Internal(
                    "circular structure could not be copied".to_string(),
                ));
            }
            let object = match scope.heap_cell(r.slot) {
                HeapCell::Object(object) => object,
                _ => {
                    return Err(Error::Internal(
                        "object slot does not hold an object".to_string(),
                    ))
                }
            };
            if object.kind == ObjectKind::Error {
                return Ok(error_cell_to_copy(scope, r.slot));
            }
            let entries: Vec<(String, Value)> = object
                .props
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            visiting.push(r.slot);
            let mut copied = Vec::with_capacity(entries.len());
            for (key, entry) in entries {
                copied.push((key, copy_inner(scope, &entry, visiting)?));
            }
            visiting.pop();
            Ok(CopiedValue::Object(copied))
        }
        Value::Function(_) | Value::Promise(_) | Value::Host(_) => Err(Error::Internal(format!(
            "{} could not be copied",
            describe(value)
        ))),
    }
}

fn error_cell_to_copy(scope: &Scope<'_>, slot: u32) -> CopiedValue {
    let (name, message, stack) = match scope.heap_cell(slot) {
        HeapCell::Object(object) => {
            let read = |key: &str| match object.props.get(key) {
                Some(Value::String(s)) => Some(s.to_string()),
                _ => None,
            };
            (
                read("name").unwrap_or_else(|| "Error".to_string()),
                read("message").unwrap_or_default(),
                read("stack"),
            )
        }
        _ => ("Error".to_string(), String::new(), None),
    };
    CopiedValue::Error {
        name,
        message,
        stack,
    }
}

/// Copy `value` only if it is a primitive. Used for property keys.
pub(crate) fn copy_if_primitive(value: &Value) -> Option<CopiedValue> {
    match value {
        Value::Undefined => Some(CopiedValue::Undefined),
        Value::Null => Some(CopiedValue::Null),
        Value::Bool(b) => Some(CopiedValue::Bool(*b)),
        Value::Number(n) => Some(CopiedValue::Number(*n)),
        Value::String(s) => Some(CopiedValue::String(Arc::clone(s))),
        _ => None,
    }
}

/// Copy `value` if it is a primitive or an Error instance.
pub(crate) fn copy_if_primitive_or_error(scope: &Scope<'_>, value: &Value) -> Option<CopiedValue> {
    if let Some(copied) = copy_if_primitive(value) {
        return Some(copied);
    }
    if let Value::Object(r) = value {
        if r.isolate() == scope.isolate_id() {
            if let HeapCell::Object(object) = scope.heap_cell(r.slot) {
                if object.kind == ObjectKind::Error {
                    return Some(error_cell_to_copy(scope, r.slot));
                }
            }
        }
    }
    None
}

/// Convert a value thrown in Phase 2 into the error rethrown on the
/// caller: copied when primitive-or-Error, synthetic otherwise.
pub(crate) fn thrown_to_error(scope: &Scope<'_>, value: &Value) -> Error {
    match copy_if_primitive_or_error(scope, value) {
        Some(CopiedValue::Error {
            name,
            message,
            stack,
        }) => Error::Script(ScriptError {
            name,
            message,
            stack,
        }),
        Some(primitive) => Error::Script(ScriptError::new("Error", primitive.to_display_string())),
        None => Error::Script(ScriptError::non_error_thrown()),
    }
}

/// Convert a promise rejection value: Error instances are copied; every
/// other value becomes the synthetic non-Error report.
pub(crate) fn rejection_to_error(scope: &Scope<'_>, value: &Value) -> Error {
    if let Value::Object(r) = value {
        if r.isolate() == scope.isolate_id() {
            if let HeapCell::Object(object) = scope.heap_cell(r.slot) {
                if object.kind == ObjectKind::Error {
                    if let CopiedValue::Error {
                        name,
                        message,
                        stack,
                    } = error_cell_to_copy(scope, r.slot)
                    {
                        return Error::Script(ScriptError {
                            name,
                            message,
                            stack,
                        });
                    }
                }
            }
        }
    }
    Error::Script(ScriptError::non_error_thrown())
}
