//! Connection hub
//!
//! Single authority over "who receives what". All mutation of the
//! registry, the channel subscription sets, and presence goes through
//! one control loop; the public [`Hub`] handle is a cheap clone whose
//! operations are message sends into that loop, so callers never
//! contend on hub state. A connection whose outbound queue is full at
//! fan-out time is evicted rather than waited on: a slow consumer must
//! never degrade delivery to healthy ones.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::connection::CloseSignal;
use crate::envelope::{self, PresenceStatus, ServerEnvelope};
use crate::presence::PresenceTracker;

pub type UserId = uuid::Uuid;
pub type ChannelId = uuid::Uuid;

/// Opaque handle identifying one live connection.
///
/// Allocated once per connection from a process-wide counter; the hub
/// keys every map on this handle instead of on the connection itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    /// Allocate a fresh handle.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

enum HubCommand {
    Register {
        conn_id: ConnId,
        user_id: UserId,
        outbound: mpsc::Sender<String>,
        close: CloseSignal,
    },
    Unregister {
        conn_id: ConnId,
    },
    Subscribe {
        conn_id: ConnId,
        channel_id: ChannelId,
    },
    Unsubscribe {
        conn_id: ConnId,
        channel_id: ChannelId,
    },
    Broadcast {
        channel_id: ChannelId,
        payload: String,
    },
    ConnectionCount {
        reply: oneshot::Sender<usize>,
    },
    SubscriberCount {
        channel_id: ChannelId,
        reply: oneshot::Sender<usize>,
    },
    ChannelCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to the hub control loop.
///
/// All operations are fire-and-forget sends on an unbounded control
/// channel; a send after the loop has shut down is a safe no-op.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::UnboundedSender<HubCommand>,
    presence: Arc<PresenceTracker>,
}

impl Hub {
    /// Spawn the control loop and return a handle to it.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let presence = Arc::new(PresenceTracker::new());

        let state = HubState {
            registry: HashMap::new(),
            channels: HashMap::new(),
            memberships: HashMap::new(),
            presence: presence.clone(),
        };
        tokio::spawn(state.run(rx));

        Self { tx, presence }
    }

    /// Add a connection to the live registry. The user's first live
    /// connection triggers a `presence_update` "online" broadcast to
    /// every registered connection.
    pub fn register(
        &self,
        conn_id: ConnId,
        user_id: UserId,
        outbound: mpsc::Sender<String>,
        close: CloseSignal,
    ) {
        let _ = self.tx.send(HubCommand::Register {
            conn_id,
            user_id,
            outbound,
            close,
        });
    }

    /// Remove a connection from the registry, every channel it was
    /// subscribed to, and presence. Idempotent.
    pub fn unregister(&self, conn_id: ConnId) {
        let _ = self.tx.send(HubCommand::Unregister { conn_id });
    }

    /// Add the connection to a channel's subscriber set. Membership must
    /// already have been checked by the caller.
    pub fn subscribe(&self, conn_id: ConnId, channel_id: ChannelId) {
        let _ = self.tx.send(HubCommand::Subscribe {
            conn_id,
            channel_id,
        });
    }

    /// Remove the connection from a channel's subscriber set. A channel
    /// the connection never joined is a no-op.
    pub fn unsubscribe(&self, conn_id: ConnId, channel_id: ChannelId) {
        let _ = self.tx.send(HubCommand::Unsubscribe {
            conn_id,
            channel_id,
        });
    }

    /// Enqueue a pre-encoded frame onto the outbound queue of every
    /// current subscriber of the channel. No subscribers is a silent
    /// no-op.
    pub fn broadcast_to_channel(&self, channel_id: ChannelId, payload: String) {
        let _ = self.tx.send(HubCommand::Broadcast {
            channel_id,
            payload,
        });
    }

    /// Presence index, readable without going through the loop.
    pub fn presence(&self) -> Arc<PresenceTracker> {
        self.presence.clone()
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.query(|reply| HubCommand::ConnectionCount { reply })
            .await
    }

    /// Number of connections subscribed to a channel.
    pub async fn subscriber_count(&self, channel_id: ChannelId) -> usize {
        self.query(|reply| HubCommand::SubscriberCount { channel_id, reply })
            .await
    }

    /// Number of channels with at least one subscriber.
    pub async fn channel_count(&self) -> usize {
        self.query(|reply| HubCommand::ChannelCount { reply }).await
    }

    async fn query(&self, make: impl FnOnce(oneshot::Sender<usize>) -> HubCommand) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(make(reply)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub").finish_non_exhaustive()
    }
}

struct Registered {
    user_id: UserId,
    outbound: mpsc::Sender<String>,
    close: CloseSignal,
}

/// State owned exclusively by the control loop.
struct HubState {
    registry: HashMap<ConnId, Registered>,
    channels: HashMap<ChannelId, HashSet<ConnId>>,
    /// Reverse index for O(subscriptions) unregister.
    memberships: HashMap<ConnId, HashSet<ChannelId>>,
    presence: Arc<PresenceTracker>,
}

impl HubState {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HubCommand>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        debug!("hub control loop stopped");
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register {
                conn_id,
                user_id,
                outbound,
                close,
            } => self.register(conn_id, user_id, outbound, close),
            HubCommand::Unregister { conn_id } => self.unregister(conn_id),
            HubCommand::Subscribe {
                conn_id,
                channel_id,
            } => self.subscribe(conn_id, channel_id),
            HubCommand::Unsubscribe {
                conn_id,
                channel_id,
            } => self.unsubscribe(conn_id, channel_id),
            HubCommand::Broadcast {
                channel_id,
                payload,
            } => self.broadcast(channel_id, &payload),
            HubCommand::ConnectionCount { reply } => {
                let _ = reply.send(self.registry.len());
            }
            HubCommand::SubscriberCount { channel_id, reply } => {
                let count = self.channels.get(&channel_id).map_or(0, HashSet::len);
                let _ = reply.send(count);
            }
            HubCommand::ChannelCount { reply } => {
                let _ = reply.send(self.channels.len());
            }
        }
    }

    fn register(
        &mut self,
        conn_id: ConnId,
        user_id: UserId,
        outbound: mpsc::Sender<String>,
        close: CloseSignal,
    ) {
        debug!(%conn_id, %user_id, "connection registered");
        self.registry.insert(
            conn_id,
            Registered {
                user_id,
                outbound,
                close,
            },
        );
        self.memberships.insert(conn_id, HashSet::new());

        if self.presence.set_online(user_id, conn_id) {
            self.broadcast_presence(user_id, PresenceStatus::Online);
        }
    }

    fn unregister(&mut self, conn_id: ConnId) {
        let Some(registered) = self.registry.remove(&conn_id) else {
            // Already gone. Every teardown path may race here.
            return;
        };

        if let Some(channels) = self.memberships.remove(&conn_id) {
            for channel_id in channels {
                if let Some(subscribers) = self.channels.get_mut(&channel_id) {
                    subscribers.remove(&conn_id);
                    if subscribers.is_empty() {
                        self.channels.remove(&channel_id);
                    }
                }
            }
        }

        registered.close.close();
        debug!(%conn_id, user_id = %registered.user_id, "connection unregistered");

        if self.presence.set_offline(registered.user_id, conn_id) {
            self.broadcast_presence(registered.user_id, PresenceStatus::Offline);
        }
        // Dropping the handle releases the outbound queue sender, which
        // lets the write pump drain and exit.
    }

    fn subscribe(&mut self, conn_id: ConnId, channel_id: ChannelId) {
        // Gone connections are a safe no-op.
        let Some(membership) = self.memberships.get_mut(&conn_id) else {
            debug!(%conn_id, %channel_id, "subscribe for unknown connection");
            return;
        };
        membership.insert(channel_id);
        self.channels.entry(channel_id).or_default().insert(conn_id);
        debug!(%conn_id, %channel_id, "subscribed");
    }

    fn unsubscribe(&mut self, conn_id: ConnId, channel_id: ChannelId) {
        if let Some(membership) = self.memberships.get_mut(&conn_id) {
            membership.remove(&channel_id);
        }
        if let Some(subscribers) = self.channels.get_mut(&channel_id) {
            subscribers.remove(&conn_id);
            if subscribers.is_empty() {
                self.channels.remove(&channel_id);
            }
        }
        debug!(%conn_id, %channel_id, "unsubscribed");
    }

    fn broadcast(&mut self, channel_id: ChannelId, payload: &str) {
        let Some(subscribers) = self.channels.get(&channel_id) else {
            debug!(%channel_id, "broadcast to channel with no subscribers");
            return;
        };

        let mut evicted = Vec::new();
        for conn_id in subscribers {
            let Some(registered) = self.registry.get(conn_id) else {
                continue;
            };
            match registered.outbound.try_send(payload.to_string()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(%conn_id, %channel_id, "outbound queue full, evicting slow consumer");
                    evicted.push(*conn_id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(%conn_id, "outbound queue closed, evicting");
                    evicted.push(*conn_id);
                }
            }
        }

        for conn_id in evicted {
            self.unregister(conn_id);
        }
    }

    /// Fan a presence transition out to every registered connection.
    fn broadcast_presence(&mut self, user_id: UserId, status: PresenceStatus) {
        let payload = envelope::encode(&ServerEnvelope::PresenceUpdate { user_id, status });
        debug!(%user_id, ?status, "presence transition");

        let mut evicted = Vec::new();
        for (conn_id, registered) in &self.registry {
            if registered.outbound.try_send(payload.clone()).is_err() {
                evicted.push(*conn_id);
            }
        }
        for conn_id in evicted {
            warn!(%conn_id, "evicting connection during presence broadcast");
            self.unregister(conn_id);
        }
    }
}
