//! # isolink
//!
//! Cross-isolate reference and invocation core for multi-tenant script
//! runtimes.
//!
//! A host embeds many isolates: independent script environments, each
//! with its own heap, lock, and single-threaded task queue. This crate
//! answers one question: given a value living in isolate A, how does code
//! in isolate B safely observe it, copy it, read and write its
//! properties, and invoke it as a function, without corrupting either
//! heap or blocking forever?
//!
//! ## Building blocks
//!
//! - [`RemoteHandle`]: an owning, isolate-tagged token for a value;
//!   releasing it is itself work scheduled on the owning isolate.
//! - [`Transferable`]: how a value crosses an isolate boundary; deep
//!   copy, reference wrap, deref-on-arrival, or shared buffer.
//! - The three-phase task driver: Phase 1 marshals on the caller,
//!   Phase 2 runs on the target under a timeout guard, Phase 3
//!   unmarshals back on the caller.
//! - [`Reference`]: the user-visible handle with `type_of`, `deref`,
//!   `deref_into`, `release`, `copy`, `get`/`set`, and the `apply`
//!   family, each in async/sync/ignored (and `apply_sync_promise`)
//!   flavors.
//!
//! ## Example
//!
//! ```
//! use isolink::{IsolateOptions, Reference, Scheduler, Value};
//!
//! let scheduler = Scheduler::new();
//! let a = scheduler.spawn(IsolateOptions::default());
//! let b = scheduler.spawn(IsolateOptions::default());
//!
//! // Capture a value in isolate A.
//! let reference = a
//!     .with_lock(|scope| Reference::new(scope, &Value::Number(42.0)))
//!     .unwrap();
//! assert_eq!(reference.type_of().unwrap(), "number");
//!
//! // Copy it out from isolate B; the copy runs on A, the result lands
//! // in B.
//! let copied = b.with_lock(|scope| reference.copy_sync(scope)).unwrap();
//! assert_eq!(copied.as_number(), Some(42.0));
//! ```

pub mod engine;
pub mod error;
pub mod gc;
pub mod reference;
pub mod remote;
pub mod security;
pub mod three_phase;
pub mod transfer;

pub use engine::{
    CallArgs, CopiedValue, Isolate, IsolateHandle, IsolateOptions, NativeFn, PromiseResolver,
    Scheduler, Scope, ScriptException, ScriptResult, TypeTag, Value,
};
pub use error::{Error, Result, ScriptError};
pub use reference::{DereferenceHandle, DerefOptions, Reference};
pub use remote::RemoteHandle;
pub use three_phase::PendingValue;
pub use transfer::{Transferable, TransferOptions};
