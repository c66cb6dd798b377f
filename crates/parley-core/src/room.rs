//! Room actor.
//!
//! Each exchange with at least one connected member gets its own task that
//! owns the room's presence, typing and call state. Commands arrive over a
//! bounded channel and are handled one at a time, so every
//! mutate-then-broadcast step is atomic with respect to the room.
//!
//! When the last member leaves, the actor closes its queue, drops anything
//! still buffered (the callers see [`RoomClosed`] and retry against a fresh
//! actor) and exits.

use crate::call::{CallSession, CallSlot, CallState, REASON_PARTICIPANT_LEFT};
use crate::error::{RelayError, RelayResult};
use crate::presence::Presence;
use crate::registry::{ConnectionId, Registry};
use crate::services::UserProfile;
use parley_protocol::{CallType, ExchangeId, ServerFrame, SignalKind, UserId, UserSummary};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Room configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Capacity of the command queue.
    pub command_capacity: usize,
    /// How long a call may ring before it is ended.
    pub ring_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            command_capacity: 256,
            ring_timeout: Duration::from_secs(30),
        }
    }
}

/// The room actor has shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomClosed;

/// Result of a leave request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LeaveOutcome {
    /// The connection was in the room.
    pub(crate) left: bool,
    /// The room is now empty and has stopped accepting commands.
    pub(crate) emptied: bool,
}

type Reply<T> = oneshot::Sender<T>;

pub(crate) enum RoomCommand {
    Join {
        connection_id: ConnectionId,
        user: UserProfile,
        participants: [UserId; 2],
        reply: Reply<Vec<UserSummary>>,
    },
    Leave {
        connection_id: ConnectionId,
        reply: Reply<LeaveOutcome>,
    },
    Typing {
        connection_id: ConnectionId,
        typing: bool,
        reply: Reply<RelayResult<()>>,
    },
    Members {
        connection_id: ConnectionId,
        reply: Reply<RelayResult<Vec<UserSummary>>>,
    },
    Publish {
        connection_id: ConnectionId,
        frame: ServerFrame,
        include_sender: bool,
        reply: Reply<usize>,
    },
    Signal {
        connection_id: ConnectionId,
        kind: SignalKind,
        target_user_id: UserId,
        payload: serde_json::Value,
        reply: Reply<RelayResult<usize>>,
    },
    CallStart {
        connection_id: ConnectionId,
        call_type: CallType,
        reply: Reply<RelayResult<u64>>,
    },
    CallAccept {
        connection_id: ConnectionId,
        reply: Reply<RelayResult<u64>>,
    },
    CallEnd {
        connection_id: ConnectionId,
        reason: String,
        reply: Reply<RelayResult<u64>>,
    },
    RingTimeout {
        call_id: u64,
    },
}

/// Handle to a running room actor.
#[derive(Clone)]
pub(crate) struct RoomHandle {
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    /// Spawn a new room actor.
    pub(crate) fn spawn(
        exchange_id: ExchangeId,
        registry: Arc<Registry>,
        config: &RoomConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.command_capacity);
        let actor = RoomActor {
            exchange_id,
            participants: None,
            presence: Presence::new(),
            calls: CallSlot::new(exchange_id),
            registry,
            rx,
            timer_tx: tx.downgrade(),
            ring_timeout: config.ring_timeout,
        };

        debug!(exchange = exchange_id, "Creating room");
        tokio::spawn(actor.run());
        Self { tx }
    }

    /// Whether the actor has stopped accepting commands.
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both handles point at the same actor.
    pub(crate) fn same_room(&self, other: &RoomHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Send a command and wait for its reply.
    pub(crate) async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> RoomCommand,
    ) -> Result<T, RoomClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| RoomClosed)?;
        rx.await.map_err(|_| RoomClosed)
    }
}

struct RoomActor {
    exchange_id: ExchangeId,
    /// Requester and provider, refreshed on every join.
    participants: Option<[UserId; 2]>,
    presence: Presence,
    calls: CallSlot,
    registry: Arc<Registry>,
    rx: mpsc::Receiver<RoomCommand>,
    timer_tx: mpsc::WeakSender<RoomCommand>,
    ring_timeout: Duration,
}

impl RoomActor {
    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            self.handle(command);

            if self.presence.is_empty() {
                self.rx.close();
                let mut bounced = 0;
                while self.rx.recv().await.is_some() {
                    bounced += 1;
                }
                debug!(exchange = self.exchange_id, bounced, "Room empty, shutting down");
                break;
            }
        }
    }

    fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Join {
                connection_id,
                user,
                participants,
                reply,
            } => {
                self.participants = Some(participants);
                let _ = reply.send(self.join(connection_id, user));
            }
            RoomCommand::Leave {
                connection_id,
                reply,
            } => {
                let left = self.leave(&connection_id);
                // Close before replying so the caller sees a closed handle.
                let emptied = self.presence.is_empty();
                if emptied {
                    self.rx.close();
                }
                let _ = reply.send(LeaveOutcome { left, emptied });
            }
            RoomCommand::Typing {
                connection_id,
                typing,
                reply,
            } => {
                let _ = reply.send(self.typing(&connection_id, typing));
            }
            RoomCommand::Members {
                connection_id,
                reply,
            } => {
                let result = self
                    .member(&connection_id)
                    .map(|_| self.presence.online_users());
                let _ = reply.send(result);
            }
            RoomCommand::Publish {
                connection_id,
                frame,
                include_sender,
                reply,
            } => {
                let except = (!include_sender).then_some(&connection_id);
                let _ = reply.send(self.broadcast(&frame, except));
            }
            RoomCommand::Signal {
                connection_id,
                kind,
                target_user_id,
                payload,
                reply,
            } => {
                let _ = reply.send(self.signal(&connection_id, kind, target_user_id, payload));
            }
            RoomCommand::CallStart {
                connection_id,
                call_type,
                reply,
            } => {
                let _ = reply.send(self.call_start(&connection_id, call_type));
            }
            RoomCommand::CallAccept {
                connection_id,
                reply,
            } => {
                let _ = reply.send(self.call_accept(&connection_id));
            }
            RoomCommand::CallEnd {
                connection_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.call_end(&connection_id, reason));
            }
            RoomCommand::RingTimeout { call_id } => {
                let exchange_id = self.exchange_id;
                if let Some(call) = self.calls.ring_timeout(call_id) {
                    let frame = call_ended(exchange_id, call, None);
                    debug!(exchange = exchange_id, call = call_id, "Call rang out");
                    self.broadcast(&frame, None);
                }
            }
        }
    }

    fn member(&self, connection_id: &ConnectionId) -> RelayResult<UserProfile> {
        self.presence
            .get(connection_id)
            .map(|m| m.user.clone())
            .ok_or_else(|| RelayError::not_member(self.exchange_id))
    }

    fn join(&mut self, connection_id: ConnectionId, user: UserProfile) -> Vec<UserSummary> {
        let already_online = self.presence.has_user(user.id);
        let summary = user.summary();

        if self.presence.join(connection_id.clone(), user) && !already_online {
            let frame = ServerFrame::UserJoined {
                exchange_id: self.exchange_id,
                user: summary,
            };
            self.broadcast(&frame, Some(&connection_id));
        }

        self.presence.online_users()
    }

    fn leave(&mut self, connection_id: &ConnectionId) -> bool {
        let Some(state) = self.presence.leave(connection_id) else {
            return false;
        };
        let user_id = state.user.id;

        if state.typing && !self.presence.is_user_typing(user_id) {
            let frame = ServerFrame::UserTyping {
                exchange_id: self.exchange_id,
                user_id,
                is_typing: false,
            };
            self.broadcast_to_others(&frame, user_id);
        }

        if !self.presence.has_user(user_id) {
            let frame = ServerFrame::UserLeft {
                exchange_id: self.exchange_id,
                user_id,
            };
            self.broadcast(&frame, None);

            let exchange_id = self.exchange_id;
            if let Ok(call) = self.calls.end(REASON_PARTICIPANT_LEFT) {
                let frame = call_ended(exchange_id, call, Some(user_id));
                self.broadcast(&frame, None);
            }
        }

        true
    }

    fn typing(&mut self, connection_id: &ConnectionId, typing: bool) -> RelayResult<()> {
        let user = self.member(connection_id)?;

        if let Some(is_typing) = self.presence.set_typing(connection_id, typing) {
            let frame = ServerFrame::UserTyping {
                exchange_id: self.exchange_id,
                user_id: user.id,
                is_typing,
            };
            self.broadcast_to_others(&frame, user.id);
        }
        Ok(())
    }

    fn signal(
        &mut self,
        connection_id: &ConnectionId,
        kind: SignalKind,
        target_user_id: UserId,
        payload: serde_json::Value,
    ) -> RelayResult<usize> {
        let user = self.member(connection_id)?;

        let is_participant = self
            .participants
            .map(|p| p.contains(&target_user_id))
            .unwrap_or(false);
        if !is_participant {
            return Err(RelayError::NotFound(format!(
                "user {target_user_id} is not part of exchange {}",
                self.exchange_id
            )));
        }

        // An answer from the callee picks up a ringing call.
        if kind == SignalKind::Answer {
            let exchange_id = self.exchange_id;
            let ringing_for_other = self
                .calls
                .live()
                .map(|c| c.initiator != user.id)
                .unwrap_or(false);
            if ringing_for_other {
                if let Ok(call) = self.calls.accept(user.id) {
                    let frame = call_accepted(exchange_id, call, user.id);
                    self.broadcast(&frame, Some(connection_id));
                }
            }
        }

        let frame = ServerFrame::signal(kind, self.exchange_id, user.id, payload);
        let delivered = self.registry.send_to_user(target_user_id, &frame);
        trace!(
            exchange = self.exchange_id,
            kind = kind.as_str(),
            target = target_user_id,
            delivered,
            "Relayed signal"
        );
        Ok(delivered)
    }

    fn call_start(&mut self, connection_id: &ConnectionId, call_type: CallType) -> RelayResult<u64> {
        let user = self.member(connection_id)?;
        let exchange_id = self.exchange_id;

        let call_id = self.calls.start(user.id, call_type)?.call_id;
        let frame = ServerFrame::CallStarted {
            exchange_id,
            call_id,
            initiator: user.summary(),
            call_type,
        };
        self.broadcast(&frame, Some(connection_id));
        self.arm_ring_timer(call_id);

        debug!(exchange = exchange_id, call = call_id, user = user.id, "Call ringing");
        Ok(call_id)
    }

    fn call_accept(&mut self, connection_id: &ConnectionId) -> RelayResult<u64> {
        let user = self.member(connection_id)?;
        let exchange_id = self.exchange_id;

        let call = self.calls.accept(user.id)?;
        let call_id = call.call_id;
        let frame = call_accepted(exchange_id, call, user.id);
        self.broadcast(&frame, Some(connection_id));
        Ok(call_id)
    }

    fn call_end(&mut self, connection_id: &ConnectionId, reason: String) -> RelayResult<u64> {
        let user = self.member(connection_id)?;
        let exchange_id = self.exchange_id;

        let call = self.calls.end(reason)?;
        let call_id = call.call_id;
        let frame = call_ended(exchange_id, call, Some(user.id));
        self.broadcast(&frame, Some(connection_id));
        Ok(call_id)
    }

    fn arm_ring_timer(&self, call_id: u64) {
        let tx = self.timer_tx.clone();
        let timeout = self.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(RoomCommand::RingTimeout { call_id }).await;
            }
        });
    }

    /// Queue a frame for every present connection except `except`.
    fn broadcast(&self, frame: &ServerFrame, except: Option<&ConnectionId>) -> usize {
        self.send_where(frame, |connection_id| Some(connection_id) != except)
    }

    /// Queue a frame for every present connection not owned by `user_id`.
    fn broadcast_to_others(&self, frame: &ServerFrame, user_id: UserId) -> usize {
        self.send_where(frame, |connection_id| {
            self.presence
                .get(connection_id)
                .is_some_and(|member| member.user.id != user_id)
        })
    }

    fn send_where(&self, frame: &ServerFrame, include: impl Fn(&ConnectionId) -> bool) -> usize {
        let mut delivered = 0;
        for connection_id in self.presence.connection_ids() {
            if !include(&connection_id) {
                continue;
            }
            if self.registry.send(&connection_id, frame.clone()) {
                delivered += 1;
            } else {
                warn!(
                    exchange = self.exchange_id,
                    connection = %connection_id,
                    "Dropping frame for vanished connection"
                );
            }
        }
        delivered
    }
}

fn call_accepted(exchange_id: ExchangeId, call: &CallSession, user_id: UserId) -> ServerFrame {
    ServerFrame::CallAccepted {
        exchange_id,
        call_id: call.call_id,
        user_id,
    }
}

fn call_ended(exchange_id: ExchangeId, call: &CallSession, ended_by: Option<UserId>) -> ServerFrame {
    let reason = match &call.state {
        CallState::Ended { reason } => reason.clone(),
        _ => String::new(),
    };
    ServerFrame::CallEnded {
        exchange_id,
        call_id: call.call_id,
        ended_by,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connect(registry: &Registry, user_id: UserId) -> (ConnectionId, UserProfile, UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = registry.register(tx);
        let user = UserProfile {
            id: user_id,
            name: format!("user-{user_id}"),
        };
        registry.bind(&conn, user.clone());
        (conn, user, rx)
    }

    async fn join(room: &RoomHandle, conn: &ConnectionId, user: &UserProfile) -> Vec<UserSummary> {
        room.request(|reply| RoomCommand::Join {
            connection_id: conn.clone(),
            user: user.clone(),
            participants: [1, 2],
            reply,
        })
        .await
        .unwrap()
    }

    fn drain(rx: &mut UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_room_shuts_down_when_empty() {
        let registry = Arc::new(Registry::new());
        let room = RoomHandle::spawn(42, registry.clone(), &RoomConfig::default());
        let (conn, user, _rx) = connect(&registry, 1);

        assert_eq!(join(&room, &conn, &user).await.len(), 1);
        let left = room
            .request(|reply| RoomCommand::Leave {
                connection_id: conn.clone(),
                reply,
            })
            .await
            .unwrap();
        assert_eq!(
            left,
            LeaveOutcome {
                left: true,
                emptied: true,
            }
        );

        // The queue is closed by the time the reply arrives.
        assert!(room.is_closed());
        let result = room
            .request(|reply| RoomCommand::Members {
                connection_id: conn.clone(),
                reply,
            })
            .await;
        assert_eq!(result.err(), Some(RoomClosed));
        assert!(room.is_closed());
    }

    #[tokio::test]
    async fn test_second_connection_of_same_user_is_silent() {
        let registry = Arc::new(Registry::new());
        let room = RoomHandle::spawn(42, registry.clone(), &RoomConfig::default());
        let (a, alice, mut rx_a) = connect(&registry, 1);
        let (a2, _, _rx_a2) = connect(&registry, 1);
        let (b, bob, mut rx_b) = connect(&registry, 2);

        join(&room, &b, &bob).await;
        join(&room, &a, &alice).await;
        join(&room, &a2, &alice).await;

        let frames = drain(&mut rx_b);
        assert_eq!(frames.len(), 1, "one userJoined for alice, got {frames:?}");
        assert!(drain(&mut rx_a).is_empty());

        room.request(|reply| RoomCommand::Leave {
            connection_id: a.clone(),
            reply,
        })
        .await
        .unwrap();
        // Alice is still online through the second connection.
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_typing_skips_typists_other_connections() {
        let registry = Arc::new(Registry::new());
        let room = RoomHandle::spawn(42, registry.clone(), &RoomConfig::default());
        let (a, alice, mut rx_a) = connect(&registry, 1);
        let (a2, _, mut rx_a2) = connect(&registry, 1);
        let (b, bob, mut rx_b) = connect(&registry, 2);
        join(&room, &a, &alice).await;
        join(&room, &a2, &alice).await;
        join(&room, &b, &bob).await;
        drain(&mut rx_a);
        drain(&mut rx_a2);
        drain(&mut rx_b);

        room.request(|reply| RoomCommand::Typing {
            connection_id: a.clone(),
            typing: true,
            reply,
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(
            drain(&mut rx_b),
            vec![ServerFrame::UserTyping {
                exchange_id: 42,
                user_id: 1,
                is_typing: true,
            }]
        );
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_a2).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ringing_call_times_out() {
        let registry = Arc::new(Registry::new());
        let config = RoomConfig {
            ring_timeout: Duration::from_secs(5),
            ..RoomConfig::default()
        };
        let room = RoomHandle::spawn(42, registry.clone(), &config);
        let (a, alice, mut rx_a) = connect(&registry, 1);
        let (b, bob, mut rx_b) = connect(&registry, 2);
        join(&room, &a, &alice).await;
        join(&room, &b, &bob).await;
        drain(&mut rx_a);

        let call_id = room
            .request(|reply| RoomCommand::CallStart {
                connection_id: a.clone(),
                call_type: CallType::Video,
                reply,
            })
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            drain(&mut rx_b).as_slice(),
            [ServerFrame::CallStarted { .. }]
        ));

        tokio::time::sleep(Duration::from_secs(6)).await;

        let expected = ServerFrame::CallEnded {
            exchange_id: 42,
            call_id,
            ended_by: None,
            reason: "timeout".to_string(),
        };
        assert_eq!(rx_a.recv().await.unwrap(), expected);
        assert_eq!(rx_b.recv().await.unwrap(), expected);

        // The timed-out call can no longer be ended.
        let ended = room
            .request(|reply| RoomCommand::CallEnd {
                connection_id: b.clone(),
                reason: "hangup".to_string(),
                reply,
            })
            .await
            .unwrap();
        assert!(matches!(ended, Err(RelayError::NoActiveCall(42))));
    }
}
