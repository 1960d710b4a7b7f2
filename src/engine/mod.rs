//! The engine collaborator surface.
//!
//! The cross-isolate core does not parse or compile script; it assumes an
//! engine that provides per-isolate locked execution, a scheduler with
//! per-isolate task queues, primitive deep copy, and value-handle
//! operations (get, set, call, type inspection). This module pins that
//! boundary down with a pure-Rust value and heap model so the reference
//! and invocation protocol above it is fully specified and testable.

pub mod copy;
pub mod heap;
pub mod isolate;
pub mod scheduler;
pub mod value;

pub use copy::CopiedValue;
pub use heap::{CallArgs, NativeFn, ScriptException, ScriptResult};
pub use isolate::{Isolate, IsolateHandle, IsolateOptions, PromiseResolver, Scope};
pub use scheduler::Scheduler;
pub use value::{HeapRef, IsolateId, TypeTag, Value};
