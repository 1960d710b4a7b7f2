//! The one-shot transferable returned by `derefInto`.
//!
//! Single use is enforced here at the handle, not at the reference: the
//! reference may be released before the transferable is consumed, and the
//! transferable must still work exactly once.

use std::sync::Mutex;

use crate::error::{Error, DEREF_INTO_ONCE};
use crate::remote::RemoteHandle;
use crate::transfer::{DerefTransfer, Transferable};

/// Transferable-producing handle whose TransferOut may happen once. The
/// produced transferable materializes the referenced value, and only when
/// arriving in its home isolate.
pub struct DereferenceHandle {
    state: Mutex<Option<RemoteHandle>>,
}

impl DereferenceHandle {
    pub(crate) fn new(value: RemoteHandle) -> Self {
        Self {
            state: Mutex::new(Some(value)),
        }
    }

    pub(crate) fn transfer_out(&self) -> crate::Result<Transferable> {
        let taken = self
            .state
            .lock()
            .expect("dereference state poisoned")
            .take();
        match taken {
            Some(value) => Ok(Transferable::Deref(DerefTransfer { value })),
            None => Err(Error::Generic(DEREF_INTO_ONCE.into())),
        }
    }
}

impl std::fmt::Debug for DereferenceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let spent = self
            .state
            .lock()
            .expect("dereference state poisoned")
            .is_none();
        f.debug_struct("DereferenceHandle")
            .field("spent", &spent)
            .finish()
    }
}
