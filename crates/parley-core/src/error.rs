//! Errors returned to a client when one of its commands fails.

use crate::cipher::CipherError;
use crate::services::ServiceError;
use parley_protocol::{ExchangeId, ServerFrame};
use thiserror::Error;

/// Relay errors.
///
/// Each variant maps to a stable numeric code carried in the `error` frame.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The command came from a connection with no bound identity.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The caller is not allowed to act on this room.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Bad input (empty or oversized text, limits).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown exchange, user, or signaling target.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The exchange has reached a terminal status.
    #[error("Exchange {0} is closed")]
    ExchangeClosed(ExchangeId),

    /// A call is already ringing or running in this room.
    #[error("A call is already in progress in exchange {0}")]
    CallAlreadyInProgress(ExchangeId),

    /// There is no call to accept or end.
    #[error("No active call in exchange {0}")]
    NoActiveCall(ExchangeId),

    /// Stored content failed to authenticate.
    #[error("Integrity error: {0}")]
    Integrity(#[from] CipherError),

    /// An external service could not be reached.
    #[error("Service unavailable: {0}")]
    TransientService(#[from] ServiceError),
}

impl RelayError {
    /// Numeric code sent to the client.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            RelayError::Validation(_) => 4000,
            RelayError::NotAuthenticated => 4001,
            RelayError::Forbidden(_) => 4003,
            RelayError::NotFound(_) => 4004,
            RelayError::ExchangeClosed(_) => 4009,
            RelayError::CallAlreadyInProgress(_) => 4090,
            RelayError::NoActiveCall(_) => 4091,
            RelayError::Integrity(_) => 5001,
            RelayError::TransientService(_) => 5003,
        }
    }

    /// Short label used for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::NotAuthenticated => "not_authenticated",
            RelayError::Forbidden(_) => "forbidden",
            RelayError::Validation(_) => "validation",
            RelayError::NotFound(_) => "not_found",
            RelayError::ExchangeClosed(_) => "exchange_closed",
            RelayError::CallAlreadyInProgress(_) => "call_in_progress",
            RelayError::NoActiveCall(_) => "no_active_call",
            RelayError::Integrity(_) => "integrity",
            RelayError::TransientService(_) => "service_unavailable",
        }
    }

    pub(crate) fn not_member(exchange_id: ExchangeId) -> Self {
        RelayError::Forbidden(format!("not a member of exchange {exchange_id}"))
    }

    /// The frame reporting this error to the originating connection.
    #[must_use]
    pub fn to_frame(&self) -> ServerFrame {
        ServerFrame::error(self.code(), self.to_string())
    }
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
