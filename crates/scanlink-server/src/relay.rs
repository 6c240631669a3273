//! Per-connection protocol handling.
//!
//! [`Relay::connect`] runs the handshake and hands back a [`ConnectionGuard`]
//! that owns one connection for its lifetime. Inbound frames go through
//! [`ConnectionGuard::handle_text`]. Dropping the guard runs teardown exactly
//! once, whatever ended the connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use scanlink_core::errors::RelayError;
use scanlink_core::ids::{Role, SessionCode};
use scanlink_core::messages::{ClientMessage, ServerMessage};

use crate::lifecycle::SessionLifecycle;
use crate::table::{Connection, ConnectionTable};

/// Tunables for connection handling.
#[derive(Clone, Debug)]
pub struct RelaySettings {
    /// Quiet period after which the relay pings the device.
    pub idle_timeout: Duration,
    /// Outbound frames buffered per connection before new ones are dropped.
    pub max_send_queue: usize,
    /// Extend session expiry on every recognized inbound message.
    pub touch_on_activity: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            max_send_queue: 256,
            touch_on_activity: true,
        }
    }
}

/// Shared relay state: the live table plus the durable lifecycle.
pub struct Relay {
    table: Arc<ConnectionTable>,
    lifecycle: Arc<SessionLifecycle>,
    settings: RelaySettings,
}

/// Where a connection is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake done, nothing received yet.
    Connected,
    Receiving,
    Closing,
    Closed,
}

/// What the transport should do after a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Disconnect,
}

impl Relay {
    pub fn new(
        table: Arc<ConnectionTable>,
        lifecycle: Arc<SessionLifecycle>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            table,
            lifecycle,
            settings,
        }
    }

    pub fn table(&self) -> &Arc<ConnectionTable> {
        &self.table
    }

    pub fn lifecycle(&self) -> &Arc<SessionLifecycle> {
        &self.lifecycle
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Validate the endpoint parameters and run the handshake.
    ///
    /// On `Err` nothing was registered or persisted and the caller should
    /// close the transport with the error's close code. On success the
    /// device has already been sent `connected`, and the peer (if any) has
    /// been told about it.
    pub fn connect(
        &self,
        raw_code: &str,
        raw_role: &str,
    ) -> Result<(ConnectionGuard, mpsc::Receiver<String>), RelayError> {
        let role: Role = raw_role.parse()?;
        let code = SessionCode::parse(raw_code)?;

        match self.lifecycle.join_or_create(&code) {
            Ok(joined) if joined.created => {
                info!(session_code = %code, role = %role, "device joined new session");
            }
            Ok(_) => {}
            Err(e) => warn!(
                session_code = %code,
                error = %e,
                "session join failed, relaying without persistence"
            ),
        }
        if let Err(e) = self.lifecycle.touch(&code) {
            warn!(session_code = %code, error = %e, "failed to extend session expiry");
        }

        let (conn, rx) = Connection::channel(code.clone(), role, self.settings.max_send_queue);
        let evicted = self.table.register(Arc::clone(&conn));
        // After register: an evicted owner's teardown can no longer clear this.
        if let Err(e) = self.lifecycle.set_role(&code, role, true) {
            warn!(session_code = %code, role = %role, error = %e, "failed to record role flag");
        }
        info!(
            session_code = %code,
            role = %role,
            connection_id = %conn.id,
            evicted,
            "device connected"
        );

        conn.send(&ServerMessage::connected(&code, role));
        if let Some(peer) = self.table.lookup(&code, role.other()) {
            peer.send(&ServerMessage::peer_connected(role));
            conn.send(&ServerMessage::already_connected(role.other()));
        }

        let guard = ConnectionGuard {
            conn,
            table: Arc::clone(&self.table),
            lifecycle: Arc::clone(&self.lifecycle),
            touch_on_activity: self.settings.touch_on_activity,
            state: ConnectionState::Connected,
        };
        Ok((guard, rx))
    }
}

/// Owns one registered connection. Teardown runs on drop.
pub struct ConnectionGuard {
    conn: Arc<Connection>,
    table: Arc<ConnectionTable>,
    lifecycle: Arc<SessionLifecycle>,
    touch_on_activity: bool,
    state: ConnectionState,
}

impl ConnectionGuard {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn code(&self) -> &SessionCode {
        &self.conn.code
    }

    pub fn role(&self) -> Role {
        self.conn.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Dispatch one inbound text frame.
    ///
    /// Malformed and unrecognized frames are ignored. Once the connection
    /// has been closed (evicted, or closed by the relay) nothing more is
    /// dispatched.
    pub fn handle_text(&mut self, text: &str) -> Flow {
        if self.conn.is_closed() {
            debug!(connection_id = %self.conn.id, "frame after close, not dispatching");
            return Flow::Disconnect;
        }
        self.conn.touch();
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Receiving;
        }

        let Some(message) = ClientMessage::parse(text) else {
            debug!(connection_id = %self.conn.id, "ignoring malformed frame");
            return Flow::Continue;
        };

        match message {
            ClientMessage::Scan { .. } => {
                match message.scan_content() {
                    Some(content) => {
                        self.forward_scan(content);
                    }
                    None => debug!(connection_id = %self.conn.id, "ignoring scan without content"),
                }
                self.touch_session();
                Flow::Continue
            }
            ClientMessage::Ping => {
                self.conn.send(&ServerMessage::pong());
                self.touch_session();
                Flow::Continue
            }
            ClientMessage::Disconnect => {
                debug!(connection_id = %self.conn.id, "disconnect requested");
                self.state = ConnectionState::Closing;
                Flow::Disconnect
            }
            ClientMessage::Unknown => {
                debug!(connection_id = %self.conn.id, "ignoring unrecognized message type");
                Flow::Continue
            }
        }
    }

    /// Forward scan content to the peer, if it is connected right now.
    ///
    /// Returns whether the scan was queued for the peer. Scans for an
    /// absent peer are dropped, not buffered.
    pub fn forward_scan(&self, content: &str) -> bool {
        let from = self.conn.role;
        let Some(peer) = self.table.lookup(&self.conn.code, from.other()) else {
            debug!(
                session_code = %self.conn.code,
                role = %from,
                "peer not connected, scan dropped"
            );
            return false;
        };
        let queued = peer.send(&ServerMessage::scan(content, from));
        if queued {
            debug!(session_code = %self.conn.code, from = %from, "scan forwarded");
        } else {
            warn!(session_code = %self.conn.code, from = %from, "failed to queue scan for peer");
        }
        queued
    }

    /// No inbound frame within the idle timeout: ping the device and keep
    /// the connection open.
    pub fn on_idle(&self) {
        debug!(
            connection_id = %self.conn.id,
            idle_secs = self.conn.idle_for().as_secs(),
            "idle, sending ping"
        );
        self.conn.send(&ServerMessage::ping());
    }

    fn touch_session(&self) {
        if !self.touch_on_activity {
            return;
        }
        if let Err(e) = self.lifecycle.touch(&self.conn.code) {
            warn!(session_code = %self.conn.code, error = %e, "failed to extend session expiry");
        }
    }

    fn teardown(&mut self) {
        self.state = ConnectionState::Closing;
        let code = &self.conn.code;
        let role = self.conn.role;

        if self.table.unregister(&self.conn) {
            if let Err(e) = self.lifecycle.set_role(code, role, false) {
                warn!(session_code = %code, role = %role, error = %e, "failed to clear role flag");
            }
            if let Some(peer) = self.table.lookup(code, role.other()) {
                peer.send(&ServerMessage::peer_disconnected(role));
            }
        } else {
            debug!(
                connection_id = %self.conn.id,
                "superseded by a newer connection, skipping cleanup"
            );
        }

        self.conn.close();
        self.state = ConnectionState::Closed;
        info!(
            session_code = %code,
            role = %role,
            connection_id = %self.conn.id,
            duration_secs = self.conn.age().as_secs(),
            dropped = self.conn.drop_count(),
            "device disconnected"
        );
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::tests::FailingStore;
    use scanlink_store::{Database, SessionStore, SqliteSessionStore};
    use serde_json::Value;

    struct Fixture {
        relay: Relay,
        store: Arc<SqliteSessionStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteSessionStore::new(Database::in_memory().unwrap()));
        let dyn_store: Arc<dyn SessionStore> = store.clone();
        let relay = Relay::new(
            Arc::new(ConnectionTable::new()),
            Arc::new(SessionLifecycle::new(dyn_store)),
            RelaySettings::default(),
        );
        Fixture { relay, store }
    }

    fn code(raw: &str) -> SessionCode {
        SessionCode::parse(raw).unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn statuses(frames: &[Value]) -> Vec<String> {
        frames
            .iter()
            .filter(|f| f["type"] == "status")
            .map(|f| f["status"].as_str().unwrap().to_owned())
            .collect()
    }

    #[test]
    fn handshake_sends_connected_and_persists() {
        let fx = fixture();
        let (guard, mut rx) = fx.relay.connect("482913", "host").unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "connected");
        assert_eq!(frames[0]["session_id"], "482913");
        assert_eq!(frames[0]["device_type"], "host");
        assert_eq!(guard.state(), ConnectionState::Connected);

        let record = fx.store.get_session(&code("482913")).unwrap().unwrap();
        assert!(record.active && record.host_connected && !record.client_connected);
    }

    #[test]
    fn peers_learn_about_each_other() {
        let fx = fixture();
        let (_host, mut host_rx) = fx.relay.connect("482913", "host").unwrap();
        drain(&mut host_rx);

        let (_client, mut client_rx) = fx.relay.connect("482913", "client").unwrap();
        assert_eq!(statuses(&drain(&mut host_rx)), vec!["client_connected"]);

        let client_frames = drain(&mut client_rx);
        assert_eq!(client_frames[0]["type"], "connected");
        assert_eq!(statuses(&client_frames), vec!["host_already_connected"]);
    }

    #[test]
    fn scan_is_forwarded_verbatim_to_peer() {
        let fx = fixture();
        let (_host, mut host_rx) = fx.relay.connect("482913", "host").unwrap();
        let (mut client, mut client_rx) = fx.relay.connect("482913", "client").unwrap();
        drain(&mut host_rx);
        drain(&mut client_rx);

        let content = "INV-00042 \u{1F4E6} {\"x\":1}";
        let frame = serde_json::json!({"type": "scan", "qr_content": content}).to_string();
        assert_eq!(client.handle_text(&frame), Flow::Continue);
        assert_eq!(client.state(), ConnectionState::Receiving);

        let host_frames = drain(&mut host_rx);
        assert_eq!(host_frames.len(), 1);
        assert_eq!(host_frames[0]["type"], "scan");
        assert_eq!(host_frames[0]["qr_content"], content);
        assert_eq!(host_frames[0]["device_type"], "client");
        assert!(drain(&mut client_rx).is_empty());
    }

    #[test]
    fn scan_without_peer_is_dropped() {
        let fx = fixture();
        let (mut client, mut client_rx) = fx.relay.connect("482913", "client").unwrap();
        drain(&mut client_rx);

        assert!(!client.forward_scan("INV-1"));
        assert_eq!(
            client.handle_text(r#"{"type":"scan","qr_content":"INV-1"}"#),
            Flow::Continue
        );
        assert!(drain(&mut client_rx).is_empty());

        // A host arriving later does not receive the earlier scan.
        let (_host, mut host_rx) = fx.relay.connect("482913", "host").unwrap();
        let frames = drain(&mut host_rx);
        assert!(frames.iter().all(|f| f["type"] != "scan"));
    }

    #[test]
    fn empty_scan_is_not_forwarded() {
        let fx = fixture();
        let (_host, mut host_rx) = fx.relay.connect("482913", "host").unwrap();
        let (mut client, _client_rx) = fx.relay.connect("482913", "client").unwrap();
        drain(&mut host_rx);

        client.handle_text(r#"{"type":"scan","qr_content":""}"#);
        client.handle_text(r#"{"type":"scan"}"#);
        assert!(drain(&mut host_rx).is_empty());
    }

    #[test]
    fn ping_gets_pong() {
        let fx = fixture();
        let (mut host, mut rx) = fx.relay.connect("482913", "host").unwrap();
        drain(&mut rx);

        assert_eq!(host.handle_text(r#"{"type":"ping"}"#), Flow::Continue);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "pong");
    }

    #[test]
    fn malformed_and_unknown_frames_are_ignored() {
        let fx = fixture();
        let (mut host, mut rx) = fx.relay.connect("482913", "host").unwrap();
        drain(&mut rx);

        for frame in ["{oops", "null", r#"{"type":"reboot"}"#, r#"{"no":"type"}"#] {
            assert_eq!(host.handle_text(frame), Flow::Continue);
        }
        assert!(drain(&mut rx).is_empty());
        assert_eq!(host.state(), ConnectionState::Receiving);
    }

    #[test]
    fn disconnect_message_ends_the_connection() {
        let fx = fixture();
        let (mut host, _rx) = fx.relay.connect("482913", "host").unwrap();
        assert_eq!(host.handle_text(r#"{"type":"disconnect"}"#), Flow::Disconnect);
        assert_eq!(host.state(), ConnectionState::Closing);
    }

    #[test]
    fn teardown_notifies_peer_once_and_clears_state() {
        let fx = fixture();
        let (host, mut host_rx) = fx.relay.connect("482913", "host").unwrap();
        let (client, _client_rx) = fx.relay.connect("482913", "client").unwrap();
        drain(&mut host_rx);

        let client_conn = Arc::clone(client.connection());
        drop(client);

        assert_eq!(statuses(&drain(&mut host_rx)), vec!["client_disconnected"]);
        assert!(client_conn.is_closed());
        assert!(fx.relay.table().lookup(&code("482913"), Role::Client).is_none());
        let record = fx.store.get_session(&code("482913")).unwrap().unwrap();
        assert!(!record.client_connected);
        assert!(record.host_connected);
        assert!(record.active);
        drop(host);
    }

    #[test]
    fn eviction_replaces_connection_without_disconnect_notice() {
        let fx = fixture();
        let (_host, mut host_rx) = fx.relay.connect("482913", "host").unwrap();
        let (old_client, _old_rx) = fx.relay.connect("482913", "client").unwrap();
        drain(&mut host_rx);

        let (new_client, mut new_rx) = fx.relay.connect("482913", "client").unwrap();
        assert!(old_client.connection().is_closed());
        let owner = fx.relay.table().lookup(&code("482913"), Role::Client).unwrap();
        assert!(Arc::ptr_eq(&owner, new_client.connection()));
        assert_eq!(statuses(&drain(&mut host_rx)), vec!["client_connected"]);
        assert_eq!(statuses(&drain(&mut new_rx)), vec!["host_already_connected"]);

        // The stale handler tearing down must not unregister or announce.
        drop(old_client);
        assert!(drain(&mut host_rx).is_empty());
        let owner = fx.relay.table().lookup(&code("482913"), Role::Client).unwrap();
        assert!(Arc::ptr_eq(&owner, new_client.connection()));
        assert!(fx.store.get_session(&code("482913")).unwrap().unwrap().client_connected);
    }

    #[test]
    fn evicted_connection_cannot_relay_scans() {
        let fx = fixture();
        let (_host, mut host_rx) = fx.relay.connect("482913", "host").unwrap();
        let (mut old_client, _old_rx) = fx.relay.connect("482913", "client").unwrap();
        let (_new_client, _new_rx) = fx.relay.connect("482913", "client").unwrap();
        drain(&mut host_rx);

        let frame = r#"{"type":"scan","qr_content":"FROM-EVICTED"}"#;
        assert_eq!(old_client.handle_text(frame), Flow::Disconnect);
        assert!(drain(&mut host_rx).is_empty());

        assert_eq!(old_client.handle_text(r#"{"type":"ping"}"#), Flow::Disconnect);
    }

    #[test]
    fn closed_session_stops_dispatch() {
        let fx = fixture();
        let (_host, mut host_rx) = fx.relay.connect("482913", "host").unwrap();
        let (mut client, _client_rx) = fx.relay.connect("482913", "client").unwrap();
        drain(&mut host_rx);

        client.connection().close();
        assert_eq!(
            client.handle_text(r#"{"type":"scan","qr_content":"LATE"}"#),
            Flow::Disconnect
        );
        assert!(drain(&mut host_rx).is_empty());
    }

    #[test]
    fn role_flag_is_set_once_registered() {
        let fx = fixture();
        let (first, _rx) = fx.relay.connect("482913", "client").unwrap();
        let (_second, _rx2) = fx.relay.connect("482913", "client").unwrap();
        assert!(fx.store.get_session(&code("482913")).unwrap().unwrap().client_connected);

        drop(first);
        assert!(fx.store.get_session(&code("482913")).unwrap().unwrap().client_connected);
    }

    #[test]
    fn invalid_role_leaves_no_state() {
        let fx = fixture();
        let err = fx.relay.connect("482913", "watcher").err().unwrap();
        assert!(matches!(err, RelayError::InvalidRole(_)));
        assert_eq!(err.close_code(), 1008);
        assert!(fx.relay.table().is_empty());
        assert!(fx.store.get_session(&code("482913")).unwrap().is_none());
    }

    #[test]
    fn invalid_code_leaves_no_state() {
        let fx = fixture();
        let err = fx.relay.connect("48-913", "host").err().unwrap();
        assert!(matches!(err, RelayError::InvalidSessionCode(_)));
        assert!(fx.relay.table().is_empty());
        assert!(fx.store.list_active().unwrap().is_empty());
    }

    #[test]
    fn idle_sends_ping_and_keeps_connection() {
        let fx = fixture();
        let (host, mut rx) = fx.relay.connect("482913", "host").unwrap();
        drain(&mut rx);

        host.on_idle();
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "ping");
        assert!(!host.connection().is_closed());
        assert_eq!(fx.relay.table().len(), 1);
    }

    #[test]
    fn rejoin_after_expiry_starts_fresh_session() {
        let fx = fixture();
        let (host, _rx) = fx.relay.connect("482913", "host").unwrap();
        drop(host);
        fx.store.deactivate(&code("482913")).unwrap();

        let (_client, _rx) = fx.relay.connect("482913", "client").unwrap();
        let record = fx.store.get_session(&code("482913")).unwrap().unwrap();
        assert!(record.active);
        assert!(record.client_connected);
        assert!(!record.host_connected);
    }

    #[test]
    fn relaying_survives_persistence_failure() {
        let relay = Relay::new(
            Arc::new(ConnectionTable::new()),
            Arc::new(SessionLifecycle::new(Arc::new(FailingStore))),
            RelaySettings::default(),
        );
        let (_host, mut host_rx) = relay.connect("482913", "host").unwrap();
        let (mut client, mut client_rx) = relay.connect("482913", "client").unwrap();
        drain(&mut host_rx);
        assert_eq!(drain(&mut client_rx)[0]["type"], "connected");

        client.handle_text(r#"{"type":"scan","qr_content":"INV-7"}"#);
        let frames = drain(&mut host_rx);
        assert_eq!(frames[0]["qr_content"], "INV-7");

        drop(client);
        assert_eq!(statuses(&drain(&mut host_rx)), vec!["client_disconnected"]);
    }
}
