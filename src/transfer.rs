//! The transferable value protocol: how values cross isolate boundaries.
//!
//! TransferOut runs under the source isolate's lock and produces a
//! [`Transferable`]; TransferIn consumes it under the destination
//! isolate's lock and yields a live value. Consuming on TransferIn makes
//! a second materialization of a one-shot transferable unrepresentable.
//!
//! Marshaling rules, in order:
//! 1. A transferable-producing wrapper (reference or dereference handle)
//!    delegates to its own TransferOut.
//! 2. A copy option, or a primitive value, produces a deep copy.
//! 3. A shared buffer transfers by refcount (Extern).
//! 4. A reference option (or return position, where references are the
//!    default) wraps the value in a new remote handle.
//! 5. Anything else is not transferable.

use std::sync::Arc;

use bytes::Bytes;

use crate::engine::copy::{copy_if_primitive, deep_copy, CopiedValue};
use crate::engine::isolate::Scope;
use crate::engine::value::{TypeTag, Value};
use crate::error::{Error, CANNOT_DEREF_INTO, NOT_TRANSFERABLE};
use crate::reference::{DereferenceHandle, Reference};
use crate::remote::{RemoteHandle, ValueShape};

/// A value in transit between isolates.
pub enum Transferable {
    /// A deep, self-contained copy.
    Copy(CopiedValue),
    /// A remote handle plus type tag; materializes as a new reference
    /// handle on arrival.
    Reference(ReferenceTransfer),
    /// A remote handle that materializes back into the live value, and
    /// only in its home isolate.
    Deref(DerefTransfer),
    /// Engine-native shareables that move by refcount.
    Extern(ExternTransfer),
}

impl std::fmt::Debug for Transferable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transferable::Copy(copied) => f.debug_tuple("Copy").field(copied).finish(),
            Transferable::Reference(_) => f.write_str("Reference(..)"),
            Transferable::Deref(_) => f.write_str("Deref(..)"),
            Transferable::Extern(_) => f.write_str("Extern(..)"),
        }
    }
}

pub struct ReferenceTransfer {
    pub(crate) value: RemoteHandle,
    pub(crate) context: RemoteHandle,
    pub(crate) tag: TypeTag,
}

pub struct DerefTransfer {
    pub(crate) value: RemoteHandle,
}

pub enum ExternTransfer {
    Buffer(Bytes),
}

impl Transferable {
    /// Materialize in the destination isolate. Runs under its lock.
    pub fn transfer_in(self, scope: &mut Scope<'_>) -> crate::Result<Value> {
        match self {
            Transferable::Copy(copied) => Ok(copied.materialize(scope)),
            Transferable::Reference(transfer) => {
                let reference = Reference::from_transfer(transfer);
                Ok(scope.alloc_host(Arc::new(reference)))
            }
            Transferable::Deref(transfer) => transfer
                .value
                .deref(scope)
                .ok_or(Error::Type(CANNOT_DEREF_INTO.into())),
            Transferable::Extern(ExternTransfer::Buffer(buffer)) => Ok(Value::Buffer(buffer)),
        }
    }
}

/// Per-value transfer configuration, attached to an argument list, a
/// single value, or a return value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    pub copy: bool,
    pub external_copy: bool,
    pub reference: bool,
    pub promise: bool,
}

impl TransferOptions {
    pub fn copied() -> Self {
        Self {
            copy: true,
            ..Self::default()
        }
    }

    pub fn referenced() -> Self {
        Self {
            reference: true,
            ..Self::default()
        }
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Parse from a script-level options object. `Undefined` means
    /// defaults; flags are read with script truthiness.
    pub fn from_value(scope: &Scope<'_>, value: &Value) -> crate::Result<Self> {
        if matches!(value, Value::Undefined) {
            return Ok(Self::default());
        }
        if !matches!(value, Value::Object(_)) {
            return Err(Error::Type("transfer options must be an object".into()));
        }
        Ok(Self {
            copy: scope.get_property(value, "copy")?.is_truthy(),
            external_copy: scope.get_property(value, "externalCopy")?.is_truthy(),
            reference: scope.get_property(value, "reference")?.is_truthy(),
            promise: scope.get_property(value, "promise")?.is_truthy(),
        })
    }
}

/// What an empty option set means for a given position: arguments have no
/// default for non-primitives, function returns default to references for
/// non-primitives, property reads wrap everything in a reference (so a
/// `get` chain stays chainable even through primitives).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferFallback {
    None,
    Reference,
    ReferenceAlways,
}

/// Convert a live value into a transferable. Runs under the source
/// isolate's lock.
pub(crate) fn transfer_out(
    scope: &mut Scope<'_>,
    value: &Value,
    options: TransferOptions,
    fallback: TransferFallback,
) -> crate::Result<Transferable> {
    if let Value::Host(_) = value {
        if let Some(host) = scope.host_object(value) {
            if let Ok(reference) = Arc::clone(&host).downcast::<Reference>() {
                return reference.transfer_out();
            }
            if let Ok(dereference) = host.downcast::<DereferenceHandle>() {
                return dereference.transfer_out();
            }
        }
        return Err(Error::Type(NOT_TRANSFERABLE.into()));
    }

    if options.copy || options.external_copy {
        return Ok(Transferable::Copy(deep_copy(scope, value)?));
    }

    if options.reference || fallback == TransferFallback::ReferenceAlways {
        return reference_wrap(scope, value);
    }

    if let Some(copied) = copy_if_primitive(value) {
        return Ok(Transferable::Copy(copied));
    }

    if let Value::Buffer(buffer) = value {
        return Ok(Transferable::Extern(ExternTransfer::Buffer(buffer.clone())));
    }

    if fallback == TransferFallback::Reference {
        return reference_wrap(scope, value);
    }

    Err(Error::Type(NOT_TRANSFERABLE.into()))
}

fn reference_wrap(scope: &mut Scope<'_>, value: &Value) -> crate::Result<Transferable> {
    let tag = value.type_tag();
    let handle = RemoteHandle::capture(scope, value)?;
    let current_context = scope.current_context();
    let context = RemoteHandle::capture_ref(scope, current_context, ValueShape::Object);
    Ok(Transferable::Reference(ReferenceTransfer {
        value: handle,
        context,
        tag,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{IsolateOptions, Scheduler};

    #[test]
    fn test_primitives_copy_by_default() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        isolate.with_lock(|scope| {
            let out = transfer_out(
                scope,
                &Value::Number(3.0),
                TransferOptions::default(),
                TransferFallback::None,
            )
            .unwrap();
            assert!(matches!(out, Transferable::Copy(CopiedValue::Number(n)) if n == 3.0));
        });
    }

    #[test]
    fn test_non_transferable_argument_fails() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        isolate.with_lock(|scope| {
            let object = scope.alloc_object();
            let err = transfer_out(
                scope,
                &object,
                TransferOptions::default(),
                TransferFallback::None,
            )
            .unwrap_err();
            assert_eq!(err.message(), "A non-transferable value was passed");
        });
    }

    #[test]
    fn test_return_position_defaults_to_reference() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        isolate.with_lock(|scope| {
            let object = scope.alloc_object();
            let out = transfer_out(
                scope,
                &object,
                TransferOptions::default(),
                TransferFallback::Reference,
            )
            .unwrap();
            assert!(matches!(out, Transferable::Reference(_)));
        });
    }

    #[test]
    fn test_property_reads_wrap_primitives() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        isolate.with_lock(|scope| {
            let out = transfer_out(
                scope,
                &Value::Number(1.0),
                TransferOptions::default(),
                TransferFallback::ReferenceAlways,
            )
            .unwrap();
            assert!(matches!(out, Transferable::Reference(_)));
        });
    }

    #[test]
    fn test_explicit_reference_option_wraps_primitives() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        isolate.with_lock(|scope| {
            let out = transfer_out(
                scope,
                &Value::string("s"),
                TransferOptions::referenced(),
                TransferFallback::None,
            )
            .unwrap();
            assert!(matches!(out, Transferable::Reference(_)));
        });
    }

    #[test]
    fn test_buffer_transfers_shared() {
        let scheduler = Scheduler::new();
        let a = scheduler.spawn(IsolateOptions::default());
        let b = scheduler.spawn(IsolateOptions::default());
        let out = a.with_lock(|scope| {
            let buffer = Value::Buffer(Bytes::from_static(b"shared"));
            transfer_out(
                scope,
                &buffer,
                TransferOptions::default(),
                TransferFallback::None,
            )
            .unwrap()
        });
        b.with_lock(|scope| {
            let landed = out.transfer_in(scope).unwrap();
            match landed {
                Value::Buffer(bytes) => assert_eq!(&bytes[..], b"shared"),
                other => panic!("expected buffer, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_options_parse_truthiness() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        isolate.with_lock(|scope| {
            let options = scope.alloc_object();
            scope.set_property(&options, "copy", Value::Number(1.0)).unwrap();
            scope
                .set_property(&options, "reference", Value::Bool(false))
                .unwrap();
            let parsed = TransferOptions::from_value(scope, &options).unwrap();
            assert!(parsed.copy);
            assert!(!parsed.reference);
            assert!(!parsed.is_default());
        });
    }
}
