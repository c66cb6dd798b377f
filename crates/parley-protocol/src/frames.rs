//! Frame types for the Parley protocol.
//!
//! Every frame is a JSON/MessagePack object tagged by a `type` field.
//! [`ClientFrame`] flows from a client to the relay, [`ServerFrame`] flows
//! back. Field names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// External user identifier.
pub type UserId = u64;

/// External exchange identifier. One exchange backs exactly one room.
pub type ExchangeId = u64;

/// Kind of media a call carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

/// WebRTC signaling payload kinds relayed between participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    /// Wire name of the frame that carries this signal.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "webrtcOffer",
            SignalKind::Answer => "webrtcAnswer",
            SignalKind::IceCandidate => "webrtcIceCandidate",
        }
    }
}

/// Public identity of a user as shown to other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
}

/// A decrypted chat message as delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub exchange_id: ExchangeId,
    pub sender: UserSummary,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

/// Commands sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Bind this connection to a user.
    Authenticate { user_id: UserId },

    /// Join the room of an exchange.
    JoinExchange { exchange_id: ExchangeId },

    /// Leave the room of an exchange.
    LeaveExchange { exchange_id: ExchangeId },

    /// Post a text message to the room.
    SendMessage { exchange_id: ExchangeId, text: String },

    TypingStart { exchange_id: ExchangeId },

    TypingStop { exchange_id: ExchangeId },

    /// Mark every message from the other party as read.
    MarkAsRead { exchange_id: ExchangeId },

    /// Ask for the users currently online in the room.
    GetOnlineStatus { exchange_id: ExchangeId },

    /// Fetch the most recent messages of the room.
    GetHistory {
        exchange_id: ExchangeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },

    WebrtcOffer {
        exchange_id: ExchangeId,
        target_user_id: UserId,
        payload: serde_json::Value,
    },

    WebrtcAnswer {
        exchange_id: ExchangeId,
        target_user_id: UserId,
        payload: serde_json::Value,
    },

    WebrtcIceCandidate {
        exchange_id: ExchangeId,
        target_user_id: UserId,
        payload: serde_json::Value,
    },

    /// Ring the other party.
    CallStart {
        exchange_id: ExchangeId,
        call_type: CallType,
    },

    /// Pick up a ringing call.
    CallAccept { exchange_id: ExchangeId },

    /// Hang up or decline.
    CallEnd {
        exchange_id: ExchangeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Keepalive ping.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientFrame {
    /// Wire name of the frame, used for logging and metrics labels.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientFrame::Authenticate { .. } => "authenticate",
            ClientFrame::JoinExchange { .. } => "joinExchange",
            ClientFrame::LeaveExchange { .. } => "leaveExchange",
            ClientFrame::SendMessage { .. } => "sendMessage",
            ClientFrame::TypingStart { .. } => "typingStart",
            ClientFrame::TypingStop { .. } => "typingStop",
            ClientFrame::MarkAsRead { .. } => "markAsRead",
            ClientFrame::GetOnlineStatus { .. } => "getOnlineStatus",
            ClientFrame::GetHistory { .. } => "getHistory",
            ClientFrame::WebrtcOffer { .. } => "webrtcOffer",
            ClientFrame::WebrtcAnswer { .. } => "webrtcAnswer",
            ClientFrame::WebrtcIceCandidate { .. } => "webrtcIceCandidate",
            ClientFrame::CallStart { .. } => "callStart",
            ClientFrame::CallAccept { .. } => "callAccept",
            ClientFrame::CallEnd { .. } => "callEnd",
            ClientFrame::Ping { .. } => "ping",
        }
    }

    /// Create a signaling frame of the given kind.
    #[must_use]
    pub fn signal(
        kind: SignalKind,
        exchange_id: ExchangeId,
        target_user_id: UserId,
        payload: serde_json::Value,
    ) -> Self {
        match kind {
            SignalKind::Offer => ClientFrame::WebrtcOffer {
                exchange_id,
                target_user_id,
                payload,
            },
            SignalKind::Answer => ClientFrame::WebrtcAnswer {
                exchange_id,
                target_user_id,
                payload,
            },
            SignalKind::IceCandidate => ClientFrame::WebrtcIceCandidate {
                exchange_id,
                target_user_id,
                payload,
            },
        }
    }
}

/// Events sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Socket accepted; sent before anything else.
    Connected {
        connection_id: String,
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    Authenticated { user: UserSummary },

    AuthError { message: String },

    UserJoined {
        exchange_id: ExchangeId,
        user: UserSummary,
    },

    UserLeft {
        exchange_id: ExchangeId,
        user_id: UserId,
    },

    OnlineUsers {
        exchange_id: ExchangeId,
        users: Vec<UserSummary>,
    },

    /// A persisted message, flattened next to the `type` tag.
    NewMessage(ChatMessage),

    /// The sender's message was persisted and fanned out.
    MessageDelivered {
        exchange_id: ExchangeId,
        message_id: String,
    },

    MessageHistory {
        exchange_id: ExchangeId,
        messages: Vec<ChatMessage>,
    },

    UserTyping {
        exchange_id: ExchangeId,
        user_id: UserId,
        is_typing: bool,
    },

    MessagesRead {
        exchange_id: ExchangeId,
        reader_id: UserId,
        count: u64,
    },

    WebrtcOffer {
        exchange_id: ExchangeId,
        from_user_id: UserId,
        payload: serde_json::Value,
    },

    WebrtcAnswer {
        exchange_id: ExchangeId,
        from_user_id: UserId,
        payload: serde_json::Value,
    },

    WebrtcIceCandidate {
        exchange_id: ExchangeId,
        from_user_id: UserId,
        payload: serde_json::Value,
    },

    CallStarted {
        exchange_id: ExchangeId,
        call_id: u64,
        initiator: UserSummary,
        call_type: CallType,
    },

    CallAccepted {
        exchange_id: ExchangeId,
        call_id: u64,
        user_id: UserId,
    },

    CallEnded {
        exchange_id: ExchangeId,
        call_id: u64,
        /// `None` when the relay ended the call (e.g. ring timeout).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ended_by: Option<UserId>,
        reason: String,
    },

    /// A command from this connection failed.
    Error { code: u16, message: String },

    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerFrame {
    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        ServerFrame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code,
            message: message.into(),
        }
    }

    /// Create a relayed signaling frame of the given kind.
    #[must_use]
    pub fn signal(
        kind: SignalKind,
        exchange_id: ExchangeId,
        from_user_id: UserId,
        payload: serde_json::Value,
    ) -> Self {
        match kind {
            SignalKind::Offer => ServerFrame::WebrtcOffer {
                exchange_id,
                from_user_id,
                payload,
            },
            SignalKind::Answer => ServerFrame::WebrtcAnswer {
                exchange_id,
                from_user_id,
                payload,
            },
            SignalKind::IceCandidate => ServerFrame::WebrtcIceCandidate {
                exchange_id,
                from_user_id,
                payload,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_wire_shape() {
        let frame: ClientFrame =
            serde_json::from_value(json!({"type": "sendMessage", "exchangeId": 42, "text": "Hello"}))
                .unwrap();
        assert_eq!(
            frame,
            ClientFrame::SendMessage {
                exchange_id: 42,
                text: "Hello".to_string()
            }
        );
        assert_eq!(frame.name(), "sendMessage");
    }

    #[test]
    fn test_optional_fields_default() {
        let frame: ClientFrame =
            serde_json::from_value(json!({"type": "callEnd", "exchangeId": 7})).unwrap();
        assert_eq!(
            frame,
            ClientFrame::CallEnd {
                exchange_id: 7,
                reason: None
            }
        );

        let frame: ClientFrame =
            serde_json::from_value(json!({"type": "callStart", "exchangeId": 7, "callType": "video"}))
                .unwrap();
        assert_eq!(frame.name(), "callStart");
    }

    #[test]
    fn test_new_message_is_flattened() {
        let frame = ServerFrame::NewMessage(ChatMessage {
            id: "m-1".to_string(),
            exchange_id: 42,
            sender: UserSummary {
                id: 1,
                name: "Ada".to_string(),
            },
            text: "Hello".to_string(),
            created_at: Utc::now(),
            is_read: false,
        });

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "newMessage");
        assert_eq!(value["text"], "Hello");
        assert_eq!(value["sender"]["id"], 1);
        assert_eq!(value["exchangeId"], 42);
        assert_eq!(value["isRead"], false);
    }

    #[test]
    fn test_signal_constructors_match_kind() {
        let payload = json!({"sdp": "v=0"});
        let frame = ServerFrame::signal(SignalKind::IceCandidate, 3, 9, payload.clone());
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], SignalKind::IceCandidate.as_str());
        assert_eq!(value["fromUserId"], 9);

        let frame = ClientFrame::signal(SignalKind::Offer, 3, 2, payload);
        assert_eq!(frame.name(), SignalKind::Offer.as_str());
    }
}
