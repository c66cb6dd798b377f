//! # parley-core
//!
//! Rooms, presence, message relay and call signaling for Parley.
//!
//! - **Registry** - Live connections, their identity and outbound queues
//! - **Room** - One actor per exchange owning presence, typing and calls
//! - **Relay** - Authorization, persistence and fan-out for client commands
//! - **Cipher** - AES-256-GCM sealing of stored message text
//! - **Services** - Ports to the exchange service, user directory and store
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│    Relay    │────▶│ Room actor  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │                   ▼                   │
//!        │            ┌─────────────┐            │
//!        │            │  Services   │            │
//!        │            └─────────────┘            │
//!        │                                       ▼
//!        │                               ┌─────────────┐
//!        └───────────── outbox ──────────│  Registry   │
//!                                        └─────────────┘
//! ```

pub mod call;
pub mod cipher;
pub mod error;
pub mod memory;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod room;
pub mod services;

pub use call::{CallSession, CallState};
pub use cipher::{AssociatedData, CipherError, MessageCipher, SealedText};
pub use error::{RelayError, RelayResult};
pub use memory::{MemoryExchangeService, MemoryMessageStore, MemoryUserDirectory};
pub use presence::Presence;
pub use registry::{ConnectionId, Outbox, Registry};
pub use relay::{Relay, RelayConfig, RelayStats};
pub use room::RoomConfig;
pub use services::{
    Exchange, ExchangeService, ExchangeStatus, MessageStore, ServiceError, UserDirectory,
    UserProfile,
};
