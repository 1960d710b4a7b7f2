//! Error taxonomy for cross-isolate operations.
//!
//! Four kinds, mirroring how failures surface to callers:
//!
//! - [`Error::Type`]: contract violation by the caller (wrong kind of
//!   argument, non-owner isolate, non-function reference).
//! - [`Error::Generic`]: lifecycle violation (released reference, double
//!   use of a dereference, script timeout, disposed isolate).
//! - [`Error::Script`]: a user-script exception captured in the target
//!   isolate and rethrown on the caller.
//! - [`Error::Internal`]: engine failure, e.g. a value that cannot be
//!   deep-copied.
//!
//! Errors raised while building a task (Phase 1) surface synchronously at
//! the call site. Errors raised on the target isolate (Phase 2) are
//! captured and returned to the caller when it resumes (Phase 3).

use std::borrow::Cow;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) const RELEASED: &str = "Reference has been released";
pub(crate) const CANNOT_DEREF_FROM: &str = "Cannot dereference this from current isolate";
pub(crate) const CANNOT_DEREF_INTO: &str = "Cannot dereference this into target isolate";
pub(crate) const DEREF_INTO_ONCE: &str =
    "The return value of `derefInto()` should only be used once";
pub(crate) const NOT_A_FUNCTION: &str = "Reference is not a function";
pub(crate) const TIMED_OUT: &str = "Script execution timed out.";
pub(crate) const INVALID_ARGUMENTS: &str = "Invalid `arguments` array";
pub(crate) const TIMEOUT_MUST_BE_INTEGER: &str = "`timeout` must be integer";
pub(crate) const ARGUMENTS_MUST_BE_OBJECT: &str = "`arguments` must be object";
pub(crate) const RETURN_MUST_BE_OBJECT: &str = "`return` must be object";
pub(crate) const INVALID_KEY: &str = "Invalid `key`";
pub(crate) const RETURN_NOT_AVAILABLE: &str =
    "`return` options are not available for `applySyncPromise`";
pub(crate) const DISPOSED: &str = "Isolate is disposed";
pub(crate) const NOT_TRANSFERABLE: &str = "A non-transferable value was passed";
pub(crate) const NON_ERROR_THROWN: &str =
    "An object was thrown from supplied code, but that object was not an instance of `Error`.";

/// A script exception captured in one isolate so it can be rethrown in
/// another. Name, message, and (when available) stack survive the trip;
/// the original heap value does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ScriptError {
    pub(crate) fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// The synthetic error used when user code threw something that is
    /// neither a primitive nor an `Error` instance.
    pub(crate) fn non_error_thrown() -> Self {
        Self::new("Error", NON_ERROR_THROWN)
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Contract violation by the caller.
    #[error("{0}")]
    Type(Cow<'static, str>),

    /// Lifecycle violation.
    #[error("{0}")]
    Generic(Cow<'static, str>),

    /// A user-script exception propagated from Phase 2.
    #[error("{0}")]
    Script(ScriptError),

    /// Engine failure during marshaling.
    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn released() -> Self {
        Error::Generic(RELEASED.into())
    }

    pub(crate) fn timed_out() -> Self {
        Error::Generic(TIMED_OUT.into())
    }

    pub(crate) fn disposed() -> Self {
        Error::Generic(DISPOSED.into())
    }

    /// The message as user-facing bindings would report it.
    pub fn message(&self) -> String {
        match self {
            Error::Type(m) | Error::Generic(m) => m.to_string(),
            Error::Script(e) => e.message.clone(),
            Error::Internal(m) => m.clone(),
        }
    }
}
