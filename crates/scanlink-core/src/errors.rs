/// WebSocket close code sent when a connection is rejected at handshake.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Handshake rejections. Nothing is registered or persisted for these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("invalid device type: {0}")]
    InvalidRole(String),
    #[error("invalid session code: {0}")]
    InvalidSessionCode(String),
}

impl RelayError {
    /// Close code to send when this error rejects a connection.
    pub fn close_code(&self) -> u16 {
        CLOSE_POLICY_VIOLATION
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidRole(_) => "invalid_role",
            Self::InvalidSessionCode(_) => "invalid_session_code",
        }
    }
}
