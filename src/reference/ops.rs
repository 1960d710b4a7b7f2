//! Copy, get, and set runners: the simple three-phase tasks behind the
//! reference surface.

use crate::engine::copy::{copy_if_primitive, CopiedValue};
use crate::engine::isolate::Scope;
use crate::engine::value::Value;
use crate::error::{Error, INVALID_KEY};
use crate::remote::RemoteHandle;
use crate::three_phase::CrossIsolateTask;
use crate::transfer::{transfer_out, TransferFallback, TransferOptions, Transferable};

use super::ReferenceData;

/// Phase 2 runs on the owning isolate by construction; a failed deref
/// there is a driver bug, not a caller error.
pub(super) fn deref_on_owner(handle: &RemoteHandle, scope: &Scope<'_>) -> crate::Result<Value> {
    handle
        .deref(scope)
        .ok_or_else(|| Error::Internal("phase 2 ran on the wrong isolate".to_string()))
}

pub(super) fn context_on_owner(
    handle: &RemoteHandle,
    scope: &Scope<'_>,
) -> crate::Result<crate::engine::HeapRef> {
    handle
        .local_ref(scope)
        .ok_or_else(|| Error::Internal("phase 2 ran on the wrong isolate".to_string()))
}

fn parse_transfer_options(
    scope: &Scope<'_>,
    options: Option<&Value>,
) -> crate::Result<TransferOptions> {
    match options {
        Some(value) => TransferOptions::from_value(scope, value),
        None => Ok(TransferOptions::default()),
    }
}

/// Deep-copies the referenced value in its isolate; the copy materializes
/// on the caller.
pub(super) struct CopyRunner {
    context: RemoteHandle,
    reference: RemoteHandle,
    copy: Option<CopiedValue>,
}

impl CopyRunner {
    pub(super) fn new(data: &ReferenceData) -> Self {
        Self {
            context: data.context.clone(),
            reference: data.value.clone(),
            copy: None,
        }
    }
}

impl CrossIsolateTask for CopyRunner {
    fn phase2(&mut self, scope: &mut Scope<'_>) -> crate::Result<()> {
        let context = context_on_owner(&self.context, scope)?;
        scope.with_context(context, |scope| {
            let value = deref_on_owner(&self.reference, scope)?;
            self.copy = Some(scope.deep_copy(&value)?);
            Ok(())
        })
    }

    fn phase3(&mut self, scope: &mut Scope<'_>) -> crate::Result<Value> {
        Ok(self
            .copy
            .take()
            .map(|copy| copy.materialize(scope))
            .unwrap_or(Value::Undefined))
    }
}

/// Reads a property in the owning isolate and marshals the result out,
/// defaulting to a reference.
pub(super) struct GetRunner {
    context: RemoteHandle,
    reference: RemoteHandle,
    key: CopiedValue,
    options: TransferOptions,
    ret: Option<Transferable>,
}

impl GetRunner {
    pub(super) fn new(
        scope: &Scope<'_>,
        data: &ReferenceData,
        key: &Value,
        options: Option<&Value>,
    ) -> crate::Result<Self> {
        let key = copy_if_primitive(key).ok_or(Error::Type(INVALID_KEY.into()))?;
        let options = parse_transfer_options(scope, options)?;
        Ok(Self {
            context: data.context.clone(),
            reference: data.value.clone(),
            key,
            options,
            ret: None,
        })
    }
}

impl CrossIsolateTask for GetRunner {
    fn phase2(&mut self, scope: &mut Scope<'_>) -> crate::Result<()> {
        let context = context_on_owner(&self.context, scope)?;
        scope.with_context(context, |scope| {
            let target = deref_on_owner(&self.reference, scope)?;
            let key = self
                .key
                .as_property_key()
                .ok_or(Error::Type(INVALID_KEY.into()))?;
            let value = scope.get_property(&target, &key)?;
            self.ret = Some(transfer_out(
                scope,
                &value,
                self.options,
                TransferFallback::ReferenceAlways,
            )?);
            Ok(())
        })
    }

    fn phase3(&mut self, scope: &mut Scope<'_>) -> crate::Result<Value> {
        match self.ret.take() {
            Some(ret) => ret.transfer_in(scope),
            None => Ok(Value::Undefined),
        }
    }
}

/// Writes a property in the owning isolate. The key is deleted before the
/// new value transfers in, so replacing a large value does not
/// transiently double its footprint.
pub(super) struct SetRunner {
    context: RemoteHandle,
    reference: RemoteHandle,
    key: CopiedValue,
    value: Option<Transferable>,
    did_set: bool,
}

impl SetRunner {
    pub(super) fn new(
        scope: &mut Scope<'_>,
        data: &ReferenceData,
        key: &Value,
        value: &Value,
        options: Option<&Value>,
    ) -> crate::Result<Self> {
        let key = copy_if_primitive(key).ok_or(Error::Type(INVALID_KEY.into()))?;
        let options = parse_transfer_options(scope, options)?;
        let value = transfer_out(scope, value, options, TransferFallback::None)?;
        Ok(Self {
            context: data.context.clone(),
            reference: data.value.clone(),
            key,
            value: Some(value),
            did_set: false,
        })
    }
}

impl CrossIsolateTask for SetRunner {
    fn phase2(&mut self, scope: &mut Scope<'_>) -> crate::Result<()> {
        let context = context_on_owner(&self.context, scope)?;
        scope.with_context(context, |scope| {
            let target = deref_on_owner(&self.reference, scope)?;
            let key = self
                .key
                .as_property_key()
                .ok_or(Error::Type(INVALID_KEY.into()))?;
            scope.delete_property(&target, &key)?;
            let value = self
                .value
                .take()
                .ok_or_else(|| Error::Internal("set value already consumed".to_string()))?;
            let landed = value.transfer_in(scope)?;
            self.did_set = scope.set_property(&target, &key, landed)?;
            Ok(())
        })
    }

    fn phase3(&mut self, _scope: &mut Scope<'_>) -> crate::Result<Value> {
        Ok(Value::Bool(self.did_set))
    }
}
