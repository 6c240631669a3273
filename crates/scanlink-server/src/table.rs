//! In-memory registry of live relay connections.
//!
//! Keyed by `(session code, role)`. At most one connection per key: a new
//! registration closes whatever held the slot before. The table is the only
//! trusted answer to "is the peer listening right now".

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use scanlink_core::ids::{ConnectionId, Role, SessionCode};
use scanlink_core::messages::ServerMessage;

/// Handle to one open duplex channel.
pub struct Connection {
    pub id: ConnectionId,
    pub code: SessionCode,
    pub role: Role,
    tx: mpsc::Sender<String>,
    closed: CancellationToken,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl Connection {
    /// Create a handle plus the receiving end its writer task drains.
    pub fn channel(
        code: SessionCode,
        role: Role,
        max_send_queue: usize,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(max_send_queue.max(1));
        let now = Instant::now();
        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            code,
            role,
            tx,
            closed: CancellationToken::new(),
            connected_at: now,
            last_activity: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        });
        (conn, rx)
    }

    /// Queue a message for this connection.
    ///
    /// Returns `false` if the connection is closed or its queue is full.
    pub fn send(&self, message: &ServerMessage) -> bool {
        if self.is_closed() {
            return false;
        }
        let Ok(json) = message.to_json() else {
            return false;
        };
        match self.tx.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    connection_id = %self.id,
                    kind = message.kind(),
                    "Send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Signal the connection's tasks to stop. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("code", &self.code)
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Point-in-time occupancy of one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Occupancy {
    pub host_connected: bool,
    pub client_connected: bool,
}

impl Occupancy {
    pub fn is_empty(&self) -> bool {
        !self.host_connected && !self.client_connected
    }

    pub fn devices(&self) -> Vec<Role> {
        Role::ALL
            .into_iter()
            .filter(|role| match role {
                Role::Host => self.host_connected,
                Role::Client => self.client_connected,
            })
            .collect()
    }
}

/// One session currently holding at least one live registration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LiveSession {
    pub session_id: SessionCode,
    pub devices: Vec<Role>,
}

/// Registry of live connections. All access goes through one mutex.
#[derive(Default)]
pub struct ConnectionTable {
    slots: Mutex<BTreeMap<(SessionCode, Role), Arc<Connection>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` under its `(code, role)`, closing any previous holder.
    ///
    /// Returns `true` when an existing connection was evicted.
    pub fn register(&self, conn: Arc<Connection>) -> bool {
        let key = (conn.code.clone(), conn.role);
        let previous = self.slots.lock().insert(key, Arc::clone(&conn));
        match previous {
            Some(old) if !Arc::ptr_eq(&old, &conn) => {
                old.close();
                tracing::info!(
                    session_code = %conn.code,
                    role = %conn.role,
                    evicted = %old.id,
                    replacement = %conn.id,
                    "Evicted stale connection"
                );
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, code: &SessionCode, role: Role) -> Option<Arc<Connection>> {
        self.slots.lock().get(&(code.clone(), role)).cloned()
    }

    /// Remove `conn` only if it still owns its slot.
    ///
    /// Returns `false` when a newer connection has taken over (or the slot is
    /// already empty), in which case the table is left untouched.
    pub fn unregister(&self, conn: &Arc<Connection>) -> bool {
        let key = (conn.code.clone(), conn.role);
        let mut slots = self.slots.lock();
        match slots.get(&key) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                slots.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn occupancy(&self, code: &SessionCode) -> Occupancy {
        let slots = self.slots.lock();
        Occupancy {
            host_connected: slots.contains_key(&(code.clone(), Role::Host)),
            client_connected: slots.contains_key(&(code.clone(), Role::Client)),
        }
    }

    /// Every session with at least one live registration, ordered by code.
    pub fn sessions(&self) -> Vec<LiveSession> {
        let slots = self.slots.lock();
        let mut out: Vec<LiveSession> = Vec::new();
        for (code, role) in slots.keys() {
            match out.last_mut() {
                Some(last) if &last.session_id == code => last.devices.push(*role),
                _ => out.push(LiveSession {
                    session_id: code.clone(),
                    devices: vec![*role],
                }),
            }
        }
        out
    }

    pub fn live_codes(&self) -> Vec<SessionCode> {
        self.sessions().into_iter().map(|s| s.session_id).collect()
    }

    /// Close every live connection of `code`. Each connection's own teardown
    /// removes it from the table. Returns how many were signalled.
    pub fn close_session(&self, code: &SessionCode) -> usize {
        let slots = self.slots.lock();
        let mut closed = 0;
        for role in Role::ALL {
            if let Some(conn) = slots.get(&(code.clone(), role)) {
                conn.close();
                closed += 1;
            }
        }
        closed
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}
