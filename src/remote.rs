//! Owning token for a value in a specific isolate.
//!
//! A [`RemoteHandle`] pins a heap cell in its owning isolate and may be
//! held by any thread or isolate. Dereferencing requires the owning
//! isolate's lock. Dropping the last clone queues the unpin on the
//! owner's deferred release queue (the heap is never touched from a
//! foreign thread); if the owner is already disposed the handle is
//! abandoned without touching the heap.

use std::sync::Arc;

use crate::engine::isolate::{Isolate, Scope};
use crate::engine::value::{HeapRef, Value};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueShape {
    Object,
    Function,
    Promise,
    Host,
    /// A primitive (or buffer) boxed into a heap cell at capture time.
    Boxed,
}

struct RemoteSlot {
    isolate: Isolate,
    slot: u32,
    shape: ValueShape,
}

impl Drop for RemoteSlot {
    fn drop(&mut self) {
        if self.isolate.is_disposed() {
            tracing::trace!(
                isolate = %self.isolate.id(),
                slot = self.slot,
                "owning isolate disposed; abandoning remote handle"
            );
            return;
        }
        self.isolate.holder.deferred().defer(self.slot);
        self.isolate.holder.nudge();
    }
}

/// A durable, isolate-tagged handle to a value, valid only under the
/// owning isolate's lock.
#[derive(Clone)]
pub struct RemoteHandle {
    inner: Arc<RemoteSlot>,
}

impl RemoteHandle {
    /// Capture a live value in the currently locked isolate. Heap values
    /// pin their existing cell; primitives and buffers are boxed into a
    /// fresh cell so the handle has something durable to own.
    pub fn capture(scope: &mut Scope<'_>, value: &Value) -> crate::Result<RemoteHandle> {
        let (slot, shape) = match value.heap_ref() {
            Some(r) => {
                if r.isolate() != scope.isolate_id() {
                    return Err(Error::Type(
                        "cannot capture a value owned by another isolate".into(),
                    ));
                }
                let shape = match value {
                    Value::Object(_) => ValueShape::Object,
                    Value::Function(_) => ValueShape::Function,
                    Value::Promise(_) => ValueShape::Promise,
                    _ => ValueShape::Host,
                };
                (r.slot, shape)
            }
            None => (scope.alloc_boxed(value.clone()), ValueShape::Boxed),
        };
        scope.pin(slot);
        Ok(RemoteHandle {
            inner: Arc::new(RemoteSlot {
                isolate: scope.isolate(),
                slot,
                shape,
            }),
        })
    }

    /// Capture an already-resolved heap reference (used for contexts).
    pub(crate) fn capture_ref(scope: &mut Scope<'_>, r: HeapRef, shape: ValueShape) -> RemoteHandle {
        debug_assert_eq!(r.isolate(), scope.isolate_id());
        scope.pin(r.slot);
        RemoteHandle {
            inner: Arc::new(RemoteSlot {
                isolate: scope.isolate(),
                slot: r.slot,
                shape,
            }),
        }
    }

    pub fn isolate(&self) -> &Isolate {
        &self.inner.isolate
    }

    pub(crate) fn owned_by(&self, scope: &Scope<'_>) -> bool {
        self.inner.isolate.id() == scope.isolate_id()
    }

    /// Produce the local value, or `None` when `scope` is not the owning
    /// isolate.
    pub fn deref(&self, scope: &Scope<'_>) -> Option<Value> {
        if !self.owned_by(scope) {
            return None;
        }
        let r = HeapRef::new(self.inner.isolate.id(), self.inner.slot);
        match self.inner.shape {
            ValueShape::Object => Some(Value::Object(r)),
            ValueShape::Function => Some(Value::Function(r)),
            ValueShape::Promise => Some(Value::Promise(r)),
            ValueShape::Host => Some(Value::Host(r)),
            ValueShape::Boxed => scope.boxed_value(self.inner.slot),
        }
    }

    /// The owned heap reference, or `None` when `scope` is not the owner.
    pub(crate) fn local_ref(&self, scope: &Scope<'_>) -> Option<HeapRef> {
        if self.owned_by(scope) {
            Some(HeapRef::new(self.inner.isolate.id(), self.inner.slot))
        } else {
            None
        }
    }
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("isolate", &self.inner.isolate.id())
            .field("slot", &self.inner.slot)
            .field("shape", &self.inner.shape)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{IsolateOptions, Scheduler};

    #[test]
    fn test_capture_and_deref_locally() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        isolate.with_lock(|scope| {
            let object = scope.alloc_object();
            let handle = RemoteHandle::capture(scope, &object).unwrap();
            let back = handle.deref(scope).unwrap();
            assert_eq!(back.heap_ref(), object.heap_ref());
        });
    }

    #[test]
    fn test_deref_from_foreign_isolate_fails() {
        let scheduler = Scheduler::new();
        let a = scheduler.spawn(IsolateOptions::default());
        let b = scheduler.spawn(IsolateOptions::default());
        let handle = a.with_lock(|scope| {
            let value = scope.alloc_object();
            RemoteHandle::capture(scope, &value).unwrap()
        });
        b.with_lock(|scope| {
            assert!(handle.deref(scope).is_none());
        });
    }

    #[test]
    fn test_primitive_capture_boxes() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        isolate.with_lock(|scope| {
            let handle = RemoteHandle::capture(scope, &Value::Number(42.0)).unwrap();
            assert_eq!(handle.deref(scope).unwrap().as_number(), Some(42.0));
        });
    }

    #[test]
    fn test_drop_after_dispose_is_abandoned() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        let handle = isolate.with_lock(|scope| {
            let value = scope.alloc_object();
            RemoteHandle::capture(scope, &value).unwrap()
        });
        isolate.dispose();
        // Must not panic or touch the disposed isolate's heap.
        drop(handle);
    }
}
