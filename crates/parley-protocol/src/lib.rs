//! # parley-protocol
//!
//! Wire protocol definitions for the Parley exchange relay.
//!
//! Clients talk to the relay over a WebSocket. Text messages carry JSON,
//! binary messages carry length-prefixed MessagePack. Both encodings use
//! the same frame types.
//!
//! ## Frame Types
//!
//! - `authenticate` - Bind a connection to a user
//! - `joinExchange` / `leaveExchange` - Room membership
//! - `sendMessage` / `markAsRead` / `getHistory` - Chat
//! - `typingStart` / `typingStop` - Typing indicators
//! - `webrtc*` / `call*` - Call signaling
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, ClientFrame};
//!
//! let frame = ClientFrame::SendMessage { exchange_id: 42, text: "Hello".into() };
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded: ClientFrame = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, ProtocolError, WireFormat};
pub use frames::{
    CallType, ChatMessage, ClientFrame, ExchangeId, ServerFrame, SignalKind, UserId, UserSummary,
};

/// Current protocol version, announced in the `connected` frame.
pub const PROTOCOL_VERSION: u8 = 1;
