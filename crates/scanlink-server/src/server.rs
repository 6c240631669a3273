use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use scanlink_store::SessionStore;

use crate::config::RelayConfig;
use crate::lifecycle::SessionLifecycle;
use crate::relay::Relay;
use crate::routes;
use crate::table::ConnectionTable;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self {
            relay,
            started_at: Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(routes::root))
        .route("/health", get(routes::health))
        .route("/ws/remote-scanner/{code}/{role}", get(routes::ws_upgrade))
        .route("/ws/sessions", get(routes::live_sessions))
        .route("/ws/sessions/{code}/status", get(routes::live_session_status))
        .route("/api/sessions/create", post(routes::create_session))
        .route("/api/sessions/active/list", get(routes::active_sessions))
        .route("/api/sessions/{code}/status", get(routes::session_status))
        .route("/api/sessions/{code}/disconnect", post(routes::disconnect_session))
        .with_state(state)
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Wire the relay together, reconcile stale flags, bind and serve.
pub async fn start(
    config: &RelayConfig,
    store: Arc<dyn SessionStore>,
) -> Result<ServerHandle, std::io::Error> {
    let lifecycle = Arc::new(SessionLifecycle::new(store));
    if let Err(e) = lifecycle.reconcile_on_start() {
        tracing::warn!(error = %e, "startup reconciliation failed");
    }

    let table = Arc::new(ConnectionTable::new());
    let relay = Arc::new(Relay::new(
        Arc::clone(&table),
        Arc::clone(&lifecycle),
        config.relay_settings(),
    ));

    let housekeeping = start_housekeeping_task(Arc::clone(&relay), config.housekeeping_interval());

    let router = build_router(AppState::new(Arc::clone(&relay)), &config.allowed_origins);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "ScanLink relay started");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        relay,
        server,
        housekeeping,
    })
}

/// Periodically extend sessions with live connections and expire the rest.
pub fn start_housekeeping_task(
    relay: Arc<Relay>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume first immediate tick
        loop {
            ticker.tick().await;
            let live = relay.table().live_codes();
            if let Err(e) = relay.lifecycle().sweep(&live) {
                tracing::warn!(error = %e, "session housekeeping failed");
            }
        }
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    relay: Arc<Relay>,
    server: tokio::task::JoinHandle<()>,
    housekeeping: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Stop serving and close every live connection.
    pub fn shutdown(&self) {
        self.server.abort();
        self.housekeeping.abort();
        for session in self.relay.table().sessions() {
            self.relay.table().close_session(&session.session_id);
        }
    }
}
