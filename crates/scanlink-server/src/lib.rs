pub mod config;
pub mod lifecycle;
pub mod relay;
pub mod routes;
pub mod server;
pub mod table;
pub mod ws;

pub use config::{load_config, ConfigError, RelayConfig};
pub use lifecycle::SessionLifecycle;
pub use relay::{ConnectionGuard, Relay, RelaySettings};
pub use server::{build_router, start, ServerHandle};
pub use table::{Connection, ConnectionTable};
