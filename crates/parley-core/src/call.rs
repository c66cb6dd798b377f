//! Call lifecycle for a room.
//!
//! ```text
//! Idle --start--> Ringing --accept--> Active --end--> Ended
//!                    |                                  ^
//!                    +------------ end / timeout -------+
//! ```
//!
//! `Ended` behaves like `Idle` for the next `start`.

use crate::error::{RelayError, RelayResult};
use parley_protocol::{CallType, ExchangeId, UserId};

/// Reason used when a ringing call is not picked up in time.
pub const REASON_TIMEOUT: &str = "timeout";

/// Reason used when a party leaves the room mid-call.
pub const REASON_PARTICIPANT_LEFT: &str = "participant_left";

/// Reason used when the caller gives none.
pub const REASON_HANGUP: &str = "hangup";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Ringing,
    Active,
    Ended { reason: String },
}

/// One call attempt in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub call_id: u64,
    pub initiator: UserId,
    pub call_type: CallType,
    pub state: CallState,
}

impl CallSession {
    /// Ringing or active.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self.state, CallState::Ringing | CallState::Active)
    }
}

/// The call slot of a room. At most one call is live at a time.
#[derive(Debug)]
pub struct CallSlot {
    exchange_id: ExchangeId,
    current: Option<CallSession>,
    next_id: u64,
}

impl CallSlot {
    #[must_use]
    pub fn new(exchange_id: ExchangeId) -> Self {
        Self {
            exchange_id,
            current: None,
            next_id: 1,
        }
    }

    /// Current state of the room's call.
    #[must_use]
    pub fn state(&self) -> CallState {
        self.current
            .as_ref()
            .map(|c| c.state.clone())
            .unwrap_or(CallState::Idle)
    }

    /// The live call, if any.
    #[must_use]
    pub fn live(&self) -> Option<&CallSession> {
        self.current.as_ref().filter(|c| c.is_live())
    }

    /// Start ringing.
    ///
    /// # Errors
    ///
    /// [`RelayError::CallAlreadyInProgress`] if a call is ringing or active.
    pub fn start(&mut self, initiator: UserId, call_type: CallType) -> RelayResult<&CallSession> {
        if self.live().is_some() {
            return Err(RelayError::CallAlreadyInProgress(self.exchange_id));
        }

        let call_id = self.next_id;
        self.next_id += 1;
        Ok(self.current.insert(CallSession {
            call_id,
            initiator,
            call_type,
            state: CallState::Ringing,
        }))
    }

    /// Pick up a ringing call.
    ///
    /// # Errors
    ///
    /// [`RelayError::NoActiveCall`] if nothing is ringing, or
    /// [`RelayError::Forbidden`] if the initiator tries to accept.
    pub fn accept(&mut self, user_id: UserId) -> RelayResult<&CallSession> {
        let exchange_id = self.exchange_id;
        let call = self
            .current
            .as_mut()
            .filter(|c| c.state == CallState::Ringing)
            .ok_or(RelayError::NoActiveCall(exchange_id))?;

        if call.initiator == user_id {
            return Err(RelayError::Forbidden(
                "the caller cannot accept their own call".to_string(),
            ));
        }

        call.state = CallState::Active;
        Ok(call)
    }

    /// End the live call.
    ///
    /// # Errors
    ///
    /// [`RelayError::NoActiveCall`] if nothing is ringing or active.
    pub fn end(&mut self, reason: impl Into<String>) -> RelayResult<&CallSession> {
        let exchange_id = self.exchange_id;
        let call = self
            .current
            .as_mut()
            .filter(|c| c.is_live())
            .ok_or(RelayError::NoActiveCall(exchange_id))?;

        call.state = CallState::Ended {
            reason: reason.into(),
        };
        Ok(call)
    }

    /// End the call with `call_id` if it is still ringing.
    pub fn ring_timeout(&mut self, call_id: u64) -> Option<&CallSession> {
        let call = self
            .current
            .as_mut()
            .filter(|c| c.call_id == call_id && c.state == CallState::Ringing)?;

        call.state = CallState::Ended {
            reason: REASON_TIMEOUT.to_string(),
        };
        Some(call)
    }
}
