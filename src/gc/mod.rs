//! Deferred cleanup of cross-thread heap roots.

pub(crate) mod deferred_release;

pub(crate) use deferred_release::DeferredReleaseQueue;
