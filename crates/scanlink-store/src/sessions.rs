use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

use scanlink_core::ids::{Role, SessionCode};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_ts};

/// Rolling expiry window for a session record.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60);

/// Durable view of a pairing session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub code: SessionCode,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub host_connected: bool,
    pub client_connected: bool,
    pub active: bool,
}

impl SessionRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Active and not yet expired. Anything else is treated as an unknown code.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_expired_at(now)
    }

    pub fn role_connected(&self, role: Role) -> bool {
        match role {
            Role::Host => self.host_connected,
            Role::Client => self.client_connected,
        }
    }
}

/// Durable session persistence consumed by the relay.
///
/// Role flags are a best-effort mirror of live connections; callers must not
/// use them to decide whether a peer is reachable.
pub trait SessionStore: Send + Sync {
    /// Active, non-expired record for `code`.
    fn get_active_session(&self, code: &SessionCode) -> Result<Option<SessionRecord>, StoreError>;

    /// Create a fresh record, replacing any inactive or expired row with the
    /// same code. Role flags start false.
    fn create_session(&self, code: &SessionCode) -> Result<SessionRecord, StoreError>;

    fn set_role_flag(&self, code: &SessionCode, role: Role, connected: bool)
        -> Result<(), StoreError>;

    /// Push `expires_at` to now + TTL on an active row. Returns the new
    /// expiry, or `None` when no active row exists. Deactivated rows are left
    /// alone; only `create_session` brings a code back.
    fn touch_expiry(&self, code: &SessionCode) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Mark inactive and clear both role flags.
    fn deactivate(&self, code: &SessionCode) -> Result<(), StoreError>;

    /// Record for `code` regardless of state.
    fn get_session(&self, code: &SessionCode) -> Result<Option<SessionRecord>, StoreError>;

    /// All active, non-expired records, newest first.
    fn list_active(&self) -> Result<Vec<SessionRecord>, StoreError>;

    /// Clear every role flag. Returns the number of rows changed.
    fn reset_role_flags(&self) -> Result<usize, StoreError>;

    /// Deactivate every active record whose expiry has passed.
    fn expire_stale(&self) -> Result<usize, StoreError>;
}

const SELECT_COLUMNS: &str =
    "SELECT code, created_at, expires_at, host_connected, client_connected, active FROM sessions";

/// SQLite-backed [`SessionStore`].
pub struct SqliteSessionStore {
    db: Database,
    ttl: chrono::Duration,
}

impl SqliteSessionStore {
    pub fn new(db: Database) -> Self {
        Self::with_ttl(db, DEFAULT_SESSION_TTL)
    }

    pub fn with_ttl(db: Database, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        Self { db, ttl }
    }
}

impl SessionStore for SqliteSessionStore {
    #[instrument(skip(self), fields(session_code = %code))]
    fn get_active_session(&self, code: &SessionCode) -> Result<Option<SessionRecord>, StoreError> {
        let now = format_ts(row_helpers::now());
        self.db.with_conn(|conn| {
            let sql = format!("{SELECT_COLUMNS} WHERE code = ?1 AND active = 1 AND expires_at > ?2");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params![code.as_str(), now])?;
            match rows.next()? {
                Some(row) => row_to_session(row).map(Some),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self), fields(session_code = %code))]
    fn create_session(&self, code: &SessionCode) -> Result<SessionRecord, StoreError> {
        let now = row_helpers::now();
        let expires_at = now + self.ttl;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (code, created_at, expires_at, host_connected, client_connected, active, updated_at)
                 VALUES (?1, ?2, ?3, 0, 0, 1, ?2)
                 ON CONFLICT(code) DO UPDATE SET
                    created_at = excluded.created_at,
                    expires_at = excluded.expires_at,
                    host_connected = 0,
                    client_connected = 0,
                    active = 1,
                    updated_at = excluded.updated_at",
                rusqlite::params![code.as_str(), format_ts(now), format_ts(expires_at)],
            )?;

            Ok(SessionRecord {
                code: code.clone(),
                created_at: now,
                expires_at,
                host_connected: false,
                client_connected: false,
                active: true,
            })
        })
    }

    #[instrument(skip(self), fields(session_code = %code, role = %role))]
    fn set_role_flag(&self, code: &SessionCode, role: Role, connected: bool) -> Result<(), StoreError> {
        let sql = match role {
            Role::Host => "UPDATE sessions SET host_connected = ?1, updated_at = ?2 WHERE code = ?3",
            Role::Client => "UPDATE sessions SET client_connected = ?1, updated_at = ?2 WHERE code = ?3",
        };
        self.db.with_conn(|conn| {
            conn.execute(
                sql,
                rusqlite::params![connected, format_ts(row_helpers::now()), code.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_code = %code))]
    fn touch_expiry(&self, code: &SessionCode) -> Result<Option<DateTime<Utc>>, StoreError> {
        let now = row_helpers::now();
        let expires_at = now + self.ttl;
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET expires_at = ?1, updated_at = ?2
                 WHERE code = ?3 AND active = 1",
                rusqlite::params![format_ts(expires_at), format_ts(now), code.as_str()],
            )?;
            Ok((changed > 0).then_some(expires_at))
        })
    }

    #[instrument(skip(self), fields(session_code = %code))]
    fn deactivate(&self, code: &SessionCode) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET active = 0, host_connected = 0, client_connected = 0, updated_at = ?1
                 WHERE code = ?2",
                rusqlite::params![format_ts(row_helpers::now()), code.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_code = %code))]
    fn get_session(&self, code: &SessionCode) -> Result<Option<SessionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("{SELECT_COLUMNS} WHERE code = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([code.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row).map(Some),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self))]
    fn list_active(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let now = format_ts(row_helpers::now());
        self.db.with_conn(|conn| {
            let sql = format!(
                "{SELECT_COLUMNS} WHERE active = 1 AND expires_at > ?1 ORDER BY created_at DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([now])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self))]
    fn reset_role_flags(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET host_connected = 0, client_connected = 0, updated_at = ?1
                 WHERE host_connected != 0 OR client_connected != 0",
                [format_ts(row_helpers::now())],
            )?;
            Ok(changed)
        })
    }

    #[instrument(skip(self))]
    fn expire_stale(&self) -> Result<usize, StoreError> {
        let now = format_ts(row_helpers::now());
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET active = 0, host_connected = 0, client_connected = 0, updated_at = ?1
                 WHERE active = 1 AND expires_at <= ?1",
                [now],
            )?;
            Ok(changed)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRecord, StoreError> {
    let raw_code: String = row_helpers::get(row, 0, "sessions", "code")?;
    let code = SessionCode::parse(&raw_code).map_err(|e| StoreError::CorruptRow {
        table: "sessions",
        column: "code",
        detail: e.to_string(),
    })?;

    Ok(SessionRecord {
        code,
        created_at: row_helpers::get_ts(row, 1, "sessions", "created_at")?,
        expires_at: row_helpers::get_ts(row, 2, "sessions", "expires_at")?,
        host_connected: row_helpers::get_flag(row, 3, "sessions", "host_connected")?,
        client_connected: row_helpers::get_flag(row, 4, "sessions", "client_connected")?,
        active: row_helpers::get_flag(row, 5, "sessions", "active")?,
    })
}
