//! Authorization for administrative lock removal.
//!
//! Authentication belongs to the host application. By the time an
//! [`AdminCredential`] reaches the coordinator the caller's identity is
//! established; an [`AdminPolicy`] decides whether that identity may remove
//! someone else's lease.

use std::collections::HashSet;
use std::fmt;

use cowork_core::types::UserId;

/// An authenticated caller asking for an administrative action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCredential {
    pub admin_id: UserId,
    /// Free-form note recorded in the logs.
    pub reason: Option<String>,
}

impl AdminCredential {
    pub fn new(admin_id: impl Into<UserId>) -> Self {
        Self {
            admin_id: admin_id.into(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Decides whether a credential may force-release leases.
pub trait AdminPolicy: Send + Sync + fmt::Debug {
    fn may_force_release(&self, credential: &AdminCredential) -> bool;
}

/// Policy backed by a fixed set of user ids (`LOCK_ADMIN_IDS`).
#[derive(Debug, Clone, Default)]
pub struct AdminAllowList {
    ids: HashSet<UserId>,
}

impl AdminAllowList {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl AdminPolicy for AdminAllowList {
    fn may_force_release(&self, credential: &AdminCredential) -> bool {
        self.ids.contains(&credential.admin_id)
    }
}
