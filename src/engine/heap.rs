//! Per-isolate heap: an arena of cells addressed by slot.
//!
//! Cells hold plain objects, native functions, promises, boxed primitives
//! (so a remote handle can pin a primitive), and host objects (how
//! reference handles materialize inside an isolate). Slots are never
//! reused; storage is reclaimed with the isolate. Pins track host-held
//! roots and are dropped through the deferred release queue when the
//! owning isolate next locks.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use super::isolate::Scope;
use super::value::Value;

/// Outcome of running native script code.
pub type ScriptResult<T> = std::result::Result<T, ScriptException>;

/// Unwinding exception inside an isolate: a thrown script value, or the
/// termination signal raised by the timeout guard.
#[derive(Debug)]
pub enum ScriptException {
    Thrown(Value),
    Terminated,
}

/// Receiver and positional arguments of a function invocation.
pub struct CallArgs {
    pub recv: Value,
    pub args: Vec<Value>,
}

/// A native function living in an isolate's heap. It runs under the
/// owning isolate's lock and must poll [`Scope::check_interrupt`] inside
/// long-running loops so the termination signal can unwind it.
pub type NativeFn = Arc<dyn Fn(&mut Scope<'_>, &CallArgs) -> ScriptResult<Value> + Send + Sync>;

/// Callback invoked when a promise settles, under the owning isolate's
/// lock. `Ok` carries the fulfillment value, `Err` the rejection value.
pub(crate) type SettleHook =
    Box<dyn FnOnce(&mut Scope<'_>, std::result::Result<Value, Value>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectKind {
    Plain,
    Error,
}

pub(crate) struct ScriptObject {
    pub(crate) kind: ObjectKind,
    pub(crate) props: IndexMap<String, Value>,
}

impl ScriptObject {
    pub(crate) fn plain() -> Self {
        Self {
            kind: ObjectKind::Plain,
            props: IndexMap::new(),
        }
    }

    pub(crate) fn error() -> Self {
        Self {
            kind: ObjectKind::Error,
            props: IndexMap::new(),
        }
    }
}

pub(crate) enum PromiseState {
    Pending { hooks: Vec<SettleHook> },
    Fulfilled(Value),
    Rejected(Value),
}

pub(crate) enum HeapCell {
    Object(ScriptObject),
    Function(NativeFn),
    Promise(PromiseState),
    /// A primitive pinned by a remote handle.
    Boxed(Value),
    /// Host-defined object (reference and dereference handles).
    Host(Arc<dyn Any + Send + Sync>),
}

pub(crate) struct Heap {
    cells: Vec<HeapCell>,
    pins: HashMap<u32, u32>,
}

impl Heap {
    pub(crate) fn new() -> Self {
        Self {
            cells: Vec::new(),
            pins: HashMap::new(),
        }
    }

    pub(crate) fn alloc(&mut self, cell: HeapCell) -> u32 {
        let slot = self.cells.len() as u32;
        self.cells.push(cell);
        slot
    }

    pub(crate) fn cell(&self, slot: u32) -> &HeapCell {
        &self.cells[slot as usize]
    }

    pub(crate) fn cell_mut(&mut self, slot: u32) -> &mut HeapCell {
        &mut self.cells[slot as usize]
    }

    pub(crate) fn pin(&mut self, slot: u32) {
        *self.pins.entry(slot).or_insert(0) += 1;
    }

    pub(crate) fn unpin(&mut self, slot: u32) {
        match self.pins.get_mut(&slot) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.pins.remove(&slot);
            }
            None => {
                tracing::trace!(slot, "unpin of slot with no pins");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pin_count(&self, slot: u32) -> u32 {
        self.pins.get(&slot).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.cells.len()
    }
}
