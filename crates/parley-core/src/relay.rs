//! The relay: entry point for every client command.
//!
//! The relay owns the connection registry and the room actors, and talks to
//! the external services. Service calls happen here, in the caller's task;
//! anything that mutates room state goes through the room's actor.

use crate::call::REASON_HANGUP;
use crate::cipher::{AssociatedData, MessageCipher};
use crate::error::{RelayError, RelayResult};
use crate::registry::{ConnectionId, Outbox, Registry};
use crate::room::{LeaveOutcome, RoomClosed, RoomCommand, RoomConfig, RoomHandle};
use crate::services::{
    Exchange, ExchangeService, MessageStore, NewMessage, ServiceError, StoredMessage,
    UserDirectory, UserProfile,
};
use dashmap::DashMap;
use parley_protocol::{
    CallType, ChatMessage, ClientFrame, ExchangeId, ServerFrame, SignalKind, UserId, UserSummary,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

/// Attempts at reaching a live room actor before giving up.
const ROOM_ATTEMPTS: usize = 3;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum message length in characters, after trimming.
    pub max_message_chars: usize,
    /// Default number of messages returned by a history request.
    pub history_limit: usize,
    /// Upper bound on a history request.
    pub max_history: usize,
    /// Maximum rooms a single connection may be in.
    pub max_rooms_per_connection: usize,
    /// Settings for each room actor.
    pub room: RoomConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_message_chars: 1000,
            history_limit: 50,
            max_history: 200,
            max_rooms_per_connection: 100,
            room: RoomConfig::default(),
        }
    }
}

/// The central relay.
pub struct Relay {
    registry: Arc<Registry>,
    /// Room actors indexed by exchange.
    rooms: DashMap<ExchangeId, RoomHandle>,
    exchanges: Arc<dyn ExchangeService>,
    users: Arc<dyn UserDirectory>,
    store: Arc<dyn MessageStore>,
    cipher: MessageCipher,
    config: RelayConfig,
}

impl Relay {
    /// Create a relay on top of the given services.
    #[must_use]
    pub fn new(
        exchanges: Arc<dyn ExchangeService>,
        users: Arc<dyn UserDirectory>,
        store: Arc<dyn MessageStore>,
        cipher: MessageCipher,
        config: RelayConfig,
    ) -> Self {
        info!("Creating relay with config: {:?}", config);
        Self {
            registry: Arc::new(Registry::new()),
            rooms: DashMap::new(),
            exchanges,
            users,
            store,
            cipher,
            config,
        }
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Get relay statistics.
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            connection_count: self.registry.connection_count(),
            room_count: self.rooms.iter().filter(|r| !r.is_closed()).count(),
        }
    }

    /// Register a new connection whose frames go to `outbox`.
    pub fn connect(&self, outbox: Outbox) -> ConnectionId {
        self.registry.register(outbox)
    }

    /// Handle one decoded client frame.
    ///
    /// Replies and errors are queued on the connection's outbox. The error,
    /// if any, is also returned so the caller can count it.
    pub async fn handle_frame(
        &self,
        connection_id: &ConnectionId,
        frame: ClientFrame,
    ) -> RelayResult<()> {
        let command = frame.name();
        let is_auth = matches!(frame, ClientFrame::Authenticate { .. });

        let result = self.dispatch(connection_id, frame).await;
        if let Err(err) = &result {
            match err {
                RelayError::Integrity(_) | RelayError::TransientService(_) => {
                    error!(connection = %connection_id, command, error = %err, "Command failed");
                }
                _ => {
                    warn!(connection = %connection_id, command, error = %err, "Command rejected");
                }
            }

            let reply = if is_auth {
                ServerFrame::AuthError {
                    message: err.to_string(),
                }
            } else {
                err.to_frame()
            };
            self.registry.send(connection_id, reply);
        }
        result
    }

    async fn dispatch(&self, connection_id: &ConnectionId, frame: ClientFrame) -> RelayResult<()> {
        let reply = match frame {
            ClientFrame::Authenticate { user_id } => {
                let user = self.authenticate(connection_id, user_id).await?;
                Some(ServerFrame::Authenticated {
                    user: user.summary(),
                })
            }
            ClientFrame::JoinExchange { exchange_id } => {
                let users = self.join_room(connection_id, exchange_id).await?;
                Some(ServerFrame::OnlineUsers { exchange_id, users })
            }
            ClientFrame::LeaveExchange { exchange_id } => {
                self.leave_room(connection_id, exchange_id).await?;
                None
            }
            ClientFrame::SendMessage { exchange_id, text } => {
                self.send_message(connection_id, exchange_id, &text).await?;
                None
            }
            ClientFrame::TypingStart { exchange_id } => {
                self.set_typing(connection_id, exchange_id, true).await?;
                None
            }
            ClientFrame::TypingStop { exchange_id } => {
                self.set_typing(connection_id, exchange_id, false).await?;
                None
            }
            ClientFrame::MarkAsRead { exchange_id } => {
                self.mark_as_read(connection_id, exchange_id).await?;
                None
            }
            ClientFrame::GetOnlineStatus { exchange_id } => {
                let users = self.online_members(connection_id, exchange_id).await?;
                Some(ServerFrame::OnlineUsers { exchange_id, users })
            }
            ClientFrame::GetHistory { exchange_id, limit } => {
                let messages = self.history(connection_id, exchange_id, limit).await?;
                Some(ServerFrame::MessageHistory {
                    exchange_id,
                    messages,
                })
            }
            ClientFrame::WebrtcOffer {
                exchange_id,
                target_user_id,
                payload,
            } => {
                self.relay_signal(connection_id, exchange_id, target_user_id, SignalKind::Offer, payload)
                    .await?;
                None
            }
            ClientFrame::WebrtcAnswer {
                exchange_id,
                target_user_id,
                payload,
            } => {
                self.relay_signal(connection_id, exchange_id, target_user_id, SignalKind::Answer, payload)
                    .await?;
                None
            }
            ClientFrame::WebrtcIceCandidate {
                exchange_id,
                target_user_id,
                payload,
            } => {
                self.relay_signal(
                    connection_id,
                    exchange_id,
                    target_user_id,
                    SignalKind::IceCandidate,
                    payload,
                )
                .await?;
                None
            }
            ClientFrame::CallStart {
                exchange_id,
                call_type,
            } => {
                self.call_start(connection_id, exchange_id, call_type).await?;
                None
            }
            ClientFrame::CallAccept { exchange_id } => {
                self.call_accept(connection_id, exchange_id).await?;
                None
            }
            ClientFrame::CallEnd {
                exchange_id,
                reason,
            } => {
                self.call_end(connection_id, exchange_id, reason).await?;
                None
            }
            ClientFrame::Ping { timestamp } => Some(ServerFrame::Pong { timestamp }),
        };

        if let Some(reply) = reply {
            self.registry.send(connection_id, reply);
        }
        Ok(())
    }

    /// Bind a connection to a user known to the directory.
    ///
    /// Switching to a different user leaves every room first. On failure
    /// the connection keeps whatever binding it had.
    ///
    /// # Errors
    ///
    /// [`RelayError::NotFound`] for unknown users,
    /// [`RelayError::TransientService`] if the directory is unreachable.
    pub async fn authenticate(
        &self,
        connection_id: &ConnectionId,
        user_id: UserId,
    ) -> RelayResult<UserProfile> {
        let profile = self
            .users
            .resolve(user_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("unknown user {user_id}")))?;

        if let Ok(current) = self.registry.identity(connection_id) {
            if current.id != user_id {
                debug!(
                    connection = %connection_id,
                    from = current.id,
                    to = user_id,
                    "Switching identity, leaving rooms"
                );
                self.leave_all(connection_id).await;
            }
        }

        self.registry.bind(connection_id, profile.clone());
        Ok(profile)
    }

    /// Join the room of an exchange.
    ///
    /// Returns the users online in the room, the caller included. Joining a
    /// room twice is a no-op.
    ///
    /// # Errors
    ///
    /// Fails if the caller is not a participant of the exchange, the
    /// exchange does not exist, or the connection is in too many rooms.
    pub async fn join_room(
        &self,
        connection_id: &ConnectionId,
        exchange_id: ExchangeId,
    ) -> RelayResult<Vec<UserSummary>> {
        let user = self.registry.identity(connection_id)?;
        let exchange = self.fetch_exchange(exchange_id).await?;

        if !exchange.is_participant(user.id) {
            return Err(RelayError::not_member(exchange_id));
        }

        let already_joined = self.registry.in_room(connection_id, exchange_id);
        if !already_joined
            && self.registry.rooms(connection_id).len() >= self.config.max_rooms_per_connection
        {
            return Err(RelayError::Validation(format!(
                "cannot join more than {} rooms",
                self.config.max_rooms_per_connection
            )));
        }

        let participants = exchange.participants();
        for attempt in 1..=ROOM_ATTEMPTS {
            let room = self.room_or_spawn(exchange_id);
            let joined = room
                .request(|reply| RoomCommand::Join {
                    connection_id: connection_id.clone(),
                    user: user.clone(),
                    participants,
                    reply,
                })
                .await;

            match joined {
                Ok(users) => {
                    self.registry.add_room(connection_id, exchange_id);
                    debug!(
                        connection = %connection_id,
                        exchange = exchange_id,
                        user = user.id,
                        "Joined room"
                    );
                    return Ok(users);
                }
                Err(RoomClosed) => {
                    trace!(exchange = exchange_id, attempt, "Room shut down under us, retrying");
                }
            }
        }

        Err(ServiceError::unavailable("room", "room kept shutting down").into())
    }

    /// Leave the room of an exchange.
    ///
    /// Returns `false` if the connection was not in the room.
    ///
    /// # Errors
    ///
    /// [`RelayError::NotAuthenticated`] for anonymous connections.
    pub async fn leave_room(
        &self,
        connection_id: &ConnectionId,
        exchange_id: ExchangeId,
    ) -> RelayResult<bool> {
        self.registry.identity(connection_id)?;
        Ok(self.leave(connection_id, exchange_id).await)
    }

    /// Distinct users with a live connection in the room.
    ///
    /// # Errors
    ///
    /// The caller must be in the room.
    pub async fn online_members(
        &self,
        connection_id: &ConnectionId,
        exchange_id: ExchangeId,
    ) -> RelayResult<Vec<UserSummary>> {
        self.registry.identity(connection_id)?;
        self.ask_room(connection_id, exchange_id, |reply| RoomCommand::Members {
            connection_id: connection_id.clone(),
            reply,
        })
        .await?
    }

    /// Start or stop typing in a room.
    ///
    /// # Errors
    ///
    /// The caller must be in the room.
    pub async fn set_typing(
        &self,
        connection_id: &ConnectionId,
        exchange_id: ExchangeId,
        typing: bool,
    ) -> RelayResult<()> {
        self.registry.identity(connection_id)?;
        self.ask_room(connection_id, exchange_id, |reply| RoomCommand::Typing {
            connection_id: connection_id.clone(),
            typing,
            reply,
        })
        .await?
    }

    /// Encrypt, persist and broadcast a chat message.
    ///
    /// The message reaches the room only after the store committed it. The
    /// sender gets it like everyone else, followed by `messageDelivered`.
    ///
    /// # Errors
    ///
    /// Fails on bad input, closed exchanges, or store outages. Nothing is
    /// broadcast on failure.
    pub async fn send_message(
        &self,
        connection_id: &ConnectionId,
        exchange_id: ExchangeId,
        text: &str,
    ) -> RelayResult<ChatMessage> {
        let user = self.registry.identity(connection_id)?;
        self.require_member(connection_id, exchange_id)?;

        let text = text.trim();
        let chars = text.chars().count();
        if chars == 0 {
            return Err(RelayError::Validation("message is empty".to_string()));
        }
        if chars > self.config.max_message_chars {
            return Err(RelayError::Validation(format!(
                "message is longer than {} characters",
                self.config.max_message_chars
            )));
        }

        let exchange = self.fetch_exchange(exchange_id).await?;
        if exchange.status.is_terminal() {
            return Err(RelayError::ExchangeClosed(exchange_id));
        }

        let aad = AssociatedData::new(user.id, exchange_id);
        let sealed = self.cipher.encrypt(text, &aad)?;
        let stored = self
            .store
            .create(NewMessage {
                exchange_id,
                sender_id: user.id,
                sealed,
            })
            .await?;

        let message = self.open(&stored, user.summary())?;
        let message_id = message.id.clone();

        if let Some(room) = self.room(exchange_id) {
            let delivered = room
                .request(|reply| RoomCommand::Publish {
                    connection_id: connection_id.clone(),
                    frame: ServerFrame::NewMessage(message.clone()),
                    include_sender: true,
                    reply,
                })
                .await
                .unwrap_or(0);
            trace!(exchange = exchange_id, message = %message_id, delivered, "Message fanned out");
        }

        self.registry.send(
            connection_id,
            ServerFrame::MessageDelivered {
                exchange_id,
                message_id,
            },
        );
        Ok(message)
    }

    /// Mark every message from the other party as read.
    ///
    /// Returns how many messages changed. The count is broadcast to the
    /// rest of the room even when it is zero.
    ///
    /// # Errors
    ///
    /// The caller must be in the room; store outages are reported.
    pub async fn mark_as_read(
        &self,
        connection_id: &ConnectionId,
        exchange_id: ExchangeId,
    ) -> RelayResult<u64> {
        let user = self.registry.identity(connection_id)?;
        self.require_member(connection_id, exchange_id)?;

        let count = self.store.bulk_mark_read(exchange_id, user.id).await?;

        if let Some(room) = self.room(exchange_id) {
            let frame = ServerFrame::MessagesRead {
                exchange_id,
                reader_id: user.id,
                count,
            };
            let _ = room
                .request(|reply| RoomCommand::Publish {
                    connection_id: connection_id.clone(),
                    frame,
                    include_sender: false,
                    reply,
                })
                .await;
        }

        debug!(exchange = exchange_id, user = user.id, count, "Messages marked read");
        Ok(count)
    }

    /// The most recent messages of a room, oldest first.
    ///
    /// # Errors
    ///
    /// The caller must be in the room. A record that fails to decrypt fails
    /// the whole request with [`RelayError::Integrity`].
    pub async fn history(
        &self,
        connection_id: &ConnectionId,
        exchange_id: ExchangeId,
        limit: Option<usize>,
    ) -> RelayResult<Vec<ChatMessage>> {
        self.registry.identity(connection_id)?;
        self.require_member(connection_id, exchange_id)?;

        let limit = limit
            .unwrap_or(self.config.history_limit)
            .clamp(1, self.config.max_history);
        let records = self.store.query(exchange_id, limit).await?;

        let mut senders: HashMap<UserId, UserSummary> = HashMap::new();
        let mut messages = Vec::with_capacity(records.len());
        for record in &records {
            let sender = match senders.get(&record.sender_id) {
                Some(sender) => sender.clone(),
                None => {
                    let sender = self
                        .users
                        .resolve(record.sender_id)
                        .await?
                        .map(|p| p.summary())
                        .unwrap_or_else(|| UserSummary {
                            id: record.sender_id,
                            name: String::new(),
                        });
                    senders.insert(record.sender_id, sender.clone());
                    sender
                }
            };
            messages.push(self.open(record, sender)?);
        }

        Ok(messages)
    }

    /// Forward a WebRTC signal to every connection of `target_user_id`.
    ///
    /// Returns the number of connections reached; zero when the target is
    /// offline.
    ///
    /// # Errors
    ///
    /// The caller must be in the room and the target must be a participant
    /// of the exchange.
    pub async fn relay_signal(
        &self,
        connection_id: &ConnectionId,
        exchange_id: ExchangeId,
        target_user_id: UserId,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> RelayResult<usize> {
        self.registry.identity(connection_id)?;
        self.ask_room(connection_id, exchange_id, |reply| RoomCommand::Signal {
            connection_id: connection_id.clone(),
            kind,
            target_user_id,
            payload,
            reply,
        })
        .await?
    }

    /// Ring the other party. Returns the new call id.
    ///
    /// # Errors
    ///
    /// [`RelayError::CallAlreadyInProgress`] while a call is live.
    pub async fn call_start(
        &self,
        connection_id: &ConnectionId,
        exchange_id: ExchangeId,
        call_type: CallType,
    ) -> RelayResult<u64> {
        self.registry.identity(connection_id)?;
        self.ask_room(connection_id, exchange_id, |reply| RoomCommand::CallStart {
            connection_id: connection_id.clone(),
            call_type,
            reply,
        })
        .await?
    }

    /// Pick up a ringing call.
    ///
    /// # Errors
    ///
    /// [`RelayError::NoActiveCall`] if nothing rings,
    /// [`RelayError::Forbidden`] for the caller's own call.
    pub async fn call_accept(
        &self,
        connection_id: &ConnectionId,
        exchange_id: ExchangeId,
    ) -> RelayResult<u64> {
        self.registry.identity(connection_id)?;
        self.ask_room(connection_id, exchange_id, |reply| RoomCommand::CallAccept {
            connection_id: connection_id.clone(),
            reply,
        })
        .await?
    }

    /// Hang up or decline the live call.
    ///
    /// # Errors
    ///
    /// [`RelayError::NoActiveCall`] if there is none.
    pub async fn call_end(
        &self,
        connection_id: &ConnectionId,
        exchange_id: ExchangeId,
        reason: Option<String>,
    ) -> RelayResult<u64> {
        self.registry.identity(connection_id)?;
        let reason = reason.unwrap_or_else(|| REASON_HANGUP.to_string());
        self.ask_room(connection_id, exchange_id, |reply| RoomCommand::CallEnd {
            connection_id: connection_id.clone(),
            reason,
            reply,
        })
        .await?
    }

    /// Tear down a connection.
    ///
    /// Leaves every room and waits for each to settle before the
    /// connection is forgotten.
    pub async fn disconnect(&self, connection_id: &ConnectionId) {
        self.leave_all(connection_id).await;
        if let Some(user) = self.registry.unregister(connection_id) {
            debug!(connection = %connection_id, user = user.id, "Disconnected");
        }
    }

    async fn leave_all(&self, connection_id: &ConnectionId) {
        for exchange_id in self.registry.rooms(connection_id) {
            self.leave(connection_id, exchange_id).await;
        }
    }

    async fn leave(&self, connection_id: &ConnectionId, exchange_id: ExchangeId) -> bool {
        if !self.registry.remove_room(connection_id, exchange_id) {
            return false;
        }

        if let Some(room) = self.room(exchange_id) {
            let outcome = room
                .request(|reply| RoomCommand::Leave {
                    connection_id: connection_id.clone(),
                    reply,
                })
                .await;
            if matches!(outcome, Ok(LeaveOutcome { emptied: true, .. }) | Err(RoomClosed)) {
                self.forget_room(exchange_id, &room);
            }
        }

        debug!(connection = %connection_id, exchange = exchange_id, "Left room");
        true
    }

    async fn fetch_exchange(&self, exchange_id: ExchangeId) -> RelayResult<Exchange> {
        self.exchanges
            .get(exchange_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("exchange {exchange_id}")))
    }

    fn require_member(&self, connection_id: &ConnectionId, exchange_id: ExchangeId) -> RelayResult<()> {
        if self.registry.in_room(connection_id, exchange_id) {
            Ok(())
        } else {
            Err(RelayError::not_member(exchange_id))
        }
    }

    /// Decrypt a stored record into the message clients see.
    fn open(&self, record: &StoredMessage, sender: UserSummary) -> RelayResult<ChatMessage> {
        let aad = AssociatedData::new(record.sender_id, record.exchange_id);
        let text = self.cipher.decrypt(&record.sealed, &aad)?;
        Ok(ChatMessage {
            id: record.id.to_string(),
            exchange_id: record.exchange_id,
            sender,
            text,
            created_at: record.created_at,
            is_read: record.is_read,
        })
    }

    fn room(&self, exchange_id: ExchangeId) -> Option<RoomHandle> {
        let room = self.rooms.get(&exchange_id).map(|room| room.clone())?;
        if room.is_closed() {
            self.forget_room(exchange_id, &room);
            return None;
        }
        Some(room)
    }

    /// Drop a room handle unless a newer actor already replaced it.
    fn forget_room(&self, exchange_id: ExchangeId, room: &RoomHandle) {
        if self
            .rooms
            .remove_if(&exchange_id, |_, current| current.same_room(room))
            .is_some()
        {
            trace!(exchange = exchange_id, "Forgot room");
        }
    }

    fn room_or_spawn(&self, exchange_id: ExchangeId) -> RoomHandle {
        let mut entry = self.rooms.entry(exchange_id).or_insert_with(|| {
            RoomHandle::spawn(exchange_id, self.registry.clone(), &self.config.room)
        });
        if entry.is_closed() {
            *entry = RoomHandle::spawn(exchange_id, self.registry.clone(), &self.config.room);
        }
        entry.clone()
    }

    /// Send a command to a room the connection is in.
    async fn ask_room<T>(
        &self,
        connection_id: &ConnectionId,
        exchange_id: ExchangeId,
        make: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> RelayResult<T> {
        self.require_member(connection_id, exchange_id)?;
        let room = self
            .room(exchange_id)
            .ok_or_else(|| RelayError::not_member(exchange_id))?;
        room.request(make)
            .await
            .map_err(|RoomClosed| RelayError::not_member(exchange_id))
    }
}

/// Relay statistics.
#[derive(Debug, Clone)]
pub struct RelayStats {
    /// Number of live connections.
    pub connection_count: usize,
    /// Number of rooms with at least one member.
    pub room_count: usize,
}
