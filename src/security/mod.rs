//! Execution-time enforcement for cross-isolate calls.
//!
//! A multi-tenant host cannot let one tenant's call pin another tenant's
//! isolate forever. The only enforcement point this core needs is the
//! wall-clock timeout around Phase 2 script execution.

pub(crate) mod timeout_guard;

pub(crate) use timeout_guard::TimeoutGuard;
