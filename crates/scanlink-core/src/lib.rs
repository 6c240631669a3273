pub mod errors;
pub mod ids;
pub mod messages;

pub use errors::RelayError;
pub use ids::{ConnectionId, Role, SessionCode};
pub use messages::{ClientMessage, ServerMessage};
