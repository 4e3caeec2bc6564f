//! Leader election over a named path

use crate::candidate::{Holder, Status};
use crate::context::Context;
use crate::error::Result;
use crate::store::{KeyValue, LeaseId, Revision};

/// Current leader of a path as seen in the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderInfo {
    pub key: String,
    pub revision: Revision,
    pub lease_id: LeaseId,
    /// Candidate identity stored as the key's value.
    pub candidate_id: String,
}

impl From<KeyValue> for LeaderInfo {
    fn from(kv: KeyValue) -> Self {
        let candidate_id = kv.value_str();
        Self {
            key: kv.key,
            revision: kv.create_revision,
            lease_id: kv.lease,
            candidate_id,
        }
    }
}

/// Leadership of a path, returned by [`crate::Sync::campaign_leader`].
///
/// Dropping a `Leader` stops its status watch but, like [`Leader::close`],
/// keeps the key: leadership lasts until [`Leader::resign`] or the session
/// lease ends.
pub struct Leader {
    holder: Holder,
}

impl Leader {
    pub(crate) fn new(holder: Holder) -> Self {
        Self { holder }
    }

    /// Observer delivering a single `false` when leadership is lost.
    pub fn status(&self) -> Status {
        self.holder.status()
    }

    pub fn is_leader(&self) -> bool {
        self.holder.is_holding()
    }

    /// Give up leadership; the next candidate in line takes over.
    pub async fn resign(&self, ctx: &Context) -> Result<()> {
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

impl std::fmt::Debug for Leader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leader")
            .field("path", &self.path())
            .field("key", &self.key())
            .field("revision", &self.revision())
            .field("is_leader", &self.is_leader())
            .finish()
    }
}
