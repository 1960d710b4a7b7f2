//! Reference handles: the user-visible surface for observing, copying,
//! and invoking values that live in another isolate.
//!
//! A [`Reference`] captures a value in the isolate that is locked at
//! construction time and can then be held anywhere. Local operations
//! (`type_of`, `deref`, `deref_into`, `release`) never leave the holding
//! thread; everything else is a three-phase task marshaled onto the
//! owning isolate.
//!
//! Every operation first checks that the reference has not been released;
//! violation raises `"Reference has been released"`.

use std::sync::{Arc, Mutex};

use crate::engine::isolate::{Isolate, Scope};
use crate::engine::value::{TypeTag, Value};
use crate::error::{Error, CANNOT_DEREF_FROM};
use crate::remote::RemoteHandle;
use crate::three_phase::{run_async, run_ignored, run_sync, run_sync_promise, PendingValue};
use crate::transfer::{ReferenceTransfer, Transferable};

mod apply;
mod dereference;
mod ops;

pub use dereference::DereferenceHandle;

use apply::ApplyRunner;
use ops::{CopyRunner, GetRunner, SetRunner};

/// Options for [`Reference::deref`] and [`Reference::deref_into`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DerefOptions {
    /// Release the reference after producing the value.
    pub release: bool,
}

#[derive(Clone)]
pub(crate) struct ReferenceData {
    pub(crate) isolate: Isolate,
    pub(crate) value: RemoteHandle,
    pub(crate) context: RemoteHandle,
    pub(crate) tag: TypeTag,
}

/// A handle to a value in a specific isolate, usable from any isolate.
///
/// The four fields of the underlying data (owning isolate, value handle,
/// creation-context handle, type tag) are either all live or all cleared;
/// release clears them together.
pub struct Reference {
    state: Mutex<Option<ReferenceData>>,
}

impl Reference {
    /// Capture `value` in the currently locked isolate.
    pub fn new(scope: &mut Scope<'_>, value: &Value) -> crate::Result<Reference> {
        let tag = value.type_tag();
        let handle = RemoteHandle::capture(scope, value)?;
        let current_context = scope.current_context();
        let context =
            RemoteHandle::capture_ref(scope, current_context, crate::remote::ValueShape::Object);
        Ok(Reference {
            state: Mutex::new(Some(ReferenceData {
                isolate: scope.isolate(),
                value: handle,
                context,
                tag,
            })),
        })
    }

    pub(crate) fn from_transfer(transfer: ReferenceTransfer) -> Reference {
        let isolate = transfer.value.isolate().clone();
        Reference {
            state: Mutex::new(Some(ReferenceData {
                isolate,
                value: transfer.value,
                context: transfer.context,
                tag: transfer.tag,
            })),
        }
    }

    /// Recover a `Reference` that was materialized into an isolate by the
    /// transfer protocol.
    pub fn from_value(scope: &Scope<'_>, value: &Value) -> Option<Arc<Reference>> {
        scope.host_object(value)?.downcast::<Reference>().ok()
    }

    fn data(&self) -> crate::Result<ReferenceData> {
        self.state
            .lock()
            .expect("reference state poisoned")
            .as_ref()
            .cloned()
            .ok_or_else(Error::released)
    }

    /// The cached `typeof` classification. Never requires a cross-isolate
    /// trip.
    pub fn type_of(&self) -> crate::Result<&'static str> {
        Ok(self.data()?.tag.as_str())
    }

    /// The isolate owning the referenced value.
    pub fn isolate(&self) -> crate::Result<Isolate> {
        Ok(self.data()?.isolate)
    }

    /// Produce the underlying value. Only the owning isolate may do this.
    pub fn deref(&self, scope: &mut Scope<'_>, options: DerefOptions) -> crate::Result<Value> {
        let data = self.data()?;
        let value = data
            .value
            .deref(scope)
            .ok_or(Error::Type(CANNOT_DEREF_FROM.into()))?;
        if options.release {
            self.release()?;
        }
        Ok(value)
    }

    /// Produce a one-shot transferable that yields the underlying value
    /// when it lands back in the owning isolate.
    pub fn deref_into(&self, scope: &mut Scope<'_>, options: DerefOptions) -> crate::Result<Value> {
        let data = self.data()?;
        let handle = DereferenceHandle::new(data.value.clone());
        let value = scope.alloc_host(Arc::new(handle));
        if options.release {
            self.release()?;
        }
        Ok(value)
    }

    /// Release the reference. The remote value's pin is surrendered on
    /// the owning isolate's queue; subsequent operations fail.
    pub fn release(&self) -> crate::Result<()> {
        let mut state = self.state.lock().expect("reference state poisoned");
        if state.take().is_none() {
            return Err(Error::released());
        }
        Ok(())
    }

    pub(crate) fn transfer_out(&self) -> crate::Result<Transferable> {
        let data = self.data()?;
        Ok(Transferable::Reference(ReferenceTransfer {
            value: data.value,
            context: data.context,
            tag: data.tag,
        }))
    }

    /// Deep-copy the referenced value into the caller isolate.
    pub fn copy(&self, scope: &mut Scope<'_>) -> crate::Result<PendingValue> {
        let data = self.data()?;
        let runner = CopyRunner::new(&data);
        Ok(run_async(scope, &data.isolate, runner))
    }

    pub fn copy_sync(&self, scope: &mut Scope<'_>) -> crate::Result<Value> {
        let data = self.data()?;
        let runner = CopyRunner::new(&data);
        run_sync(scope, &data.isolate, runner)
    }

    /// Read a property. The key must be a primitive; the result is
    /// marshaled per `options` (default: reference).
    pub fn get(
        &self,
        scope: &mut Scope<'_>,
        key: &Value,
        options: Option<&Value>,
    ) -> crate::Result<PendingValue> {
        let data = self.data()?;
        let runner = GetRunner::new(scope, &data, key, options)?;
        Ok(run_async(scope, &data.isolate, runner))
    }

    pub fn get_sync(
        &self,
        scope: &mut Scope<'_>,
        key: &Value,
        options: Option<&Value>,
    ) -> crate::Result<Value> {
        let data = self.data()?;
        let runner = GetRunner::new(scope, &data, key, options)?;
        run_sync(scope, &data.isolate, runner)
    }

    /// Write a property. The previous binding is deleted before the new
    /// value lands so a large value is not transiently held twice. The
    /// result reports whether the set was accepted.
    pub fn set(
        &self,
        scope: &mut Scope<'_>,
        key: &Value,
        value: &Value,
        options: Option<&Value>,
    ) -> crate::Result<PendingValue> {
        let data = self.data()?;
        let runner = SetRunner::new(scope, &data, key, value, options)?;
        Ok(run_async(scope, &data.isolate, runner))
    }

    pub fn set_sync(
        &self,
        scope: &mut Scope<'_>,
        key: &Value,
        value: &Value,
        options: Option<&Value>,
    ) -> crate::Result<bool> {
        let data = self.data()?;
        let runner = SetRunner::new(scope, &data, key, value, options)?;
        match run_sync(scope, &data.isolate, runner)? {
            Value::Bool(accepted) => Ok(accepted),
            _ => Err(Error::Internal("set did not report a boolean".to_string())),
        }
    }

    pub fn set_ignored(
        &self,
        scope: &mut Scope<'_>,
        key: &Value,
        value: &Value,
        options: Option<&Value>,
    ) -> crate::Result<()> {
        let data = self.data()?;
        let runner = SetRunner::new(scope, &data, key, value, options)?;
        run_ignored(&data.isolate, runner);
        Ok(())
    }

    /// Invoke the referenced function, like `Function.prototype.apply`.
    /// `args` must be an index-dense array-like object. `options` may
    /// carry `timeout`, `arguments` transfer options, and `return`
    /// transfer options.
    pub fn apply(
        &self,
        scope: &mut Scope<'_>,
        recv: Option<&Value>,
        args: Option<&Value>,
        options: Option<&Value>,
    ) -> crate::Result<PendingValue> {
        let data = self.data()?;
        let runner = ApplyRunner::new(&data, scope, recv, args, options)?;
        Ok(run_async(scope, &data.isolate, runner))
    }

    pub fn apply_sync(
        &self,
        scope: &mut Scope<'_>,
        recv: Option<&Value>,
        args: Option<&Value>,
        options: Option<&Value>,
    ) -> crate::Result<Value> {
        let data = self.data()?;
        let runner = ApplyRunner::new(&data, scope, recv, args, options)?;
        run_sync(scope, &data.isolate, runner)
    }

    pub fn apply_ignored(
        &self,
        scope: &mut Scope<'_>,
        recv: Option<&Value>,
        args: Option<&Value>,
        options: Option<&Value>,
    ) -> crate::Result<()> {
        let data = self.data()?;
        let runner = ApplyRunner::new(&data, scope, recv, args, options)?;
        run_ignored(&data.isolate, runner);
        Ok(())
    }

    /// Invoke and, if the result is a promise, block until it settles in
    /// the target isolate. Forbids non-default `return` options.
    pub fn apply_sync_promise(
        &self,
        scope: &mut Scope<'_>,
        recv: Option<&Value>,
        args: Option<&Value>,
        options: Option<&Value>,
    ) -> crate::Result<Value> {
        let data = self.data()?;
        let runner = ApplyRunner::new(&data, scope, recv, args, options)?;
        let timeout = runner.timeout();
        run_sync_promise(scope, &data.isolate, runner, timeout)
    }
}

impl std::fmt::Debug for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("reference state poisoned");
        match state.as_ref() {
            Some(data) => f
                .debug_struct("Reference")
                .field("isolate", &data.isolate.id())
                .field("typeof", &data.tag.as_str())
                .finish(),
            None => f.debug_struct("Reference").field("released", &true).finish(),
        }
    }
}
