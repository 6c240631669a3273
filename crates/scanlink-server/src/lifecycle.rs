//! Durable-side session operations used by the relay.
//!
//! Thin policy layer over a [`SessionStore`]: join-or-create, rolling expiry,
//! role flags and startup reconciliation. Nothing here decides whether a peer
//! is reachable; that is the connection table's job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use scanlink_core::ids::{Role, SessionCode};
use scanlink_store::{SessionRecord, SessionStore, StoreError};

/// Result of [`SessionLifecycle::join_or_create`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Joined {
    pub record: SessionRecord,
    pub created: bool,
}

/// Session lifecycle manager.
pub struct SessionLifecycle {
    store: Arc<dyn SessionStore>,
    /// Serializes check-then-create so two devices joining the same unknown
    /// code at once produce a single record.
    join_lock: Mutex<()>,
}

impl SessionLifecycle {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            join_lock: Mutex::new(()),
        }
    }

    /// Return the active record for `code`, creating one if none exists.
    ///
    /// An expired or deactivated record counts as absent and is replaced.
    #[instrument(skip(self), fields(session_code = %code))]
    pub fn join_or_create(&self, code: &SessionCode) -> Result<Joined, StoreError> {
        let _guard = self.join_lock.lock();
        if let Some(record) = self.store.get_active_session(code)? {
            debug!("joined existing session");
            return Ok(Joined {
                record,
                created: false,
            });
        }
        let record = self.store.create_session(code)?;
        info!(expires_at = %record.expires_at, "session created");
        Ok(Joined {
            record,
            created: true,
        })
    }

    /// Extend the rolling expiry. `None` when the code has no record.
    pub fn touch(&self, code: &SessionCode) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.store.touch_expiry(code)
    }

    pub fn set_role(
        &self,
        code: &SessionCode,
        role: Role,
        connected: bool,
    ) -> Result<(), StoreError> {
        self.store.set_role_flag(code, role, connected)
    }

    /// Mark the session inactive. Used by explicit administrative disconnects.
    #[instrument(skip(self), fields(session_code = %code))]
    pub fn deactivate(&self, code: &SessionCode) -> Result<(), StoreError> {
        self.store.deactivate(code)?;
        info!("session deactivated");
        Ok(())
    }

    /// Clear role flags left behind by a previous process.
    pub fn reconcile_on_start(&self) -> Result<usize, StoreError> {
        let cleared = self.store.reset_role_flags()?;
        if cleared > 0 {
            info!(sessions = cleared, "cleared stale role flags");
        }
        Ok(cleared)
    }

    /// Record for `code` in any state.
    pub fn status(&self, code: &SessionCode) -> Result<Option<SessionRecord>, StoreError> {
        self.store.get_session(code)
    }

    pub fn list_active(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.store.list_active()
    }

    /// Deactivate records whose expiry has passed.
    pub fn expire_stale(&self) -> Result<usize, StoreError> {
        self.store.expire_stale()
    }

    /// Periodic housekeeping: keep sessions with live connections from
    /// lapsing, then expire the rest.
    ///
    /// Returns the number of sessions expired.
    pub fn sweep(&self, live: &[SessionCode]) -> Result<usize, StoreError> {
        for code in live {
            if let Err(e) = self.store.touch_expiry(code) {
                tracing::warn!(session_code = %code, error = %e, "failed to extend live session");
            }
        }
        let expired = self.store.expire_stale()?;
        if expired > 0 {
            info!(expired, "expired stale sessions");
        }
        Ok(expired)
    }
}
