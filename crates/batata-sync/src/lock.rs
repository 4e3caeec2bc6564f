//! Distributed mutual exclusion over a named path

use crate::candidate::{Holder, Status};
use crate::context::Context;
use crate::error::Result;
use crate::store::{LeaseId, Revision};

/// Ownership of a lock, returned by [`crate::Sync::lock`] and
/// [`crate::Sync::try_lock`].
///
/// Not a guard: the lock is released by [`Mutex::unlock`] or when the
/// session lease ends, never by dropping the handle.
pub struct Mutex {
    holder: Holder,
}

impl Mutex {
    pub(crate) fn new(holder: Holder) -> Self {
        Self { holder }
    }

    /// Observer delivering a single `false` when ownership is lost.
    pub fn status(&self) -> Status {
        self.holder.status()
    }

    pub fn is_owner(&self) -> bool {
        self.holder.is_holding()
    }

    pub async fn unlock(&self, ctx: &Context) -> Result<()> {
        self.holder.release(ctx).await
    }

    pub fn close(&self) {
        self.holder.close();
    }

    pub fn path(&self) -> &str {
        self.holder.path()
    }

    pub fn key(&self) -> &str {
        self.holder.key()
    }

    pub fn revision(&self) -> Revision {
        self.holder.revision()
    }

    pub fn lease_id(&self) -> LeaseId {
        self.holder.lease_id()
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("path", &self.path())
            .field("key", &self.key())
            .field("revision", &self.revision())
            .field("is_owner", &self.is_owner())
            .finish()
    }
}
