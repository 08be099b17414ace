//! Rendezvous registry and signal routing
//!
//! [`SignalRelay`] owns the identity registry and the channel membership
//! table. It never awaits: every operation is a short synchronous mutation
//! that pushes notifications into per-connection outboxes, so the server can
//! keep it behind a plain mutex and admission stays atomic.

use crate::signaling::protocol::{ChannelId, DeliveredSignal, Destination, Notification, PeerId};
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Most peers a channel may hold
pub const MAX_CHANNEL_MEMBERS: usize = 2;

/// Notifications queued for one relay connection
pub type Outbox = mpsc::UnboundedSender<Notification>;

/// Proof of admission; required to disconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Identity granted to the connection
    pub peer_id: PeerId,
    /// Distinguishes this connection from later ones reusing the identity
    pub connection_id: Uuid,
}

/// Result of a successful channel join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Channel joined
    pub channel_id: ChannelId,
    /// Member count after the join
    pub members: usize,
    /// First member, notified to start the offer, when this join filled the channel
    pub initiator: Option<PeerId>,
}

struct PeerEntry {
    connection_id: Uuid,
    outbox: Outbox,
    admitted_at: Instant,
}

/// Peer registry, channel table, and signal router
#[derive(Default)]
pub struct SignalRelay {
    /// Live identities in admission order
    order: Vec<PeerId>,
    peers: HashMap<PeerId, PeerEntry>,
    /// Channel members in join order; never empty, never more than two
    channels: HashMap<ChannelId, Vec<PeerId>>,
}

impl SignalRelay {
    /// Create an empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a claimed identity and register the connection
    ///
    /// On success every connected peer, the new one included, receives the
    /// updated `peers` list.
    pub fn admit(&mut self, claimed: &str, outbox: Outbox) -> Result<Admission> {
        let peer_id = PeerId::parse(claimed)?;

        if self.peers.contains_key(&peer_id) {
            warn!("Rejecting duplicate identity: {}", peer_id);
            return Err(Error::PeerAlreadyConnected(peer_id.to_string()));
        }

        let connection_id = Uuid::new_v4();
        self.peers.insert(
            peer_id.clone(),
            PeerEntry {
                connection_id,
                outbox,
                admitted_at: Instant::now(),
            },
        );
        self.order.push(peer_id.clone());

        info!("Peer admitted: {} (total: {})", peer_id, self.order.len());
        self.broadcast_peers();

        Ok(Admission {
            peer_id,
            connection_id,
        })
    }

    /// Live identities in admission order
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.order.clone()
    }

    /// Whether an identity is currently registered
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Number of live peers
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no peer is connected
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Members of a channel in join order
    pub fn channel_members(&self, channel_id: &ChannelId) -> Vec<PeerId> {
        self.channels.get(channel_id).cloned().unwrap_or_default()
    }

    /// Number of live channels
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Add `peer_id` to a channel
    ///
    /// The second joiner makes the relay send `initiate` to the first member
    /// only. A third joiner is rejected and membership is left untouched.
    pub fn join_channel(&mut self, peer_id: &PeerId, channel: &str) -> Result<JoinOutcome> {
        let channel_id = ChannelId::parse(channel)?;
        let members = self.channels.entry(channel_id.clone()).or_default();

        if members.contains(peer_id) {
            debug!("Peer {} already in channel {}", peer_id, channel_id);
            return Ok(JoinOutcome {
                members: members.len(),
                channel_id,
                initiator: None,
            });
        }

        if members.len() >= MAX_CHANNEL_MEMBERS {
            warn!(
                "Channel {} full, rejecting {} (members: {:?})",
                channel_id, peer_id, members
            );
            return Err(Error::ChannelFull(channel_id.to_string()));
        }

        members.push(peer_id.clone());
        let count = members.len();
        let initiator = if count == MAX_CHANNEL_MEMBERS {
            members.first().cloned()
        } else {
            None
        };

        info!("Peer {} joined channel {} ({} members)", peer_id, channel_id, count);

        if let Some(first) = &initiator {
            debug!("Asking {} to initiate channel {}", first, channel_id);
            self.deliver(first, Notification::Initiate(channel_id.clone()));
        }

        Ok(JoinOutcome {
            channel_id,
            members: count,
            initiator,
        })
    }

    /// Forward an opaque payload from `from` to `destination`
    ///
    /// Returns the number of peers the payload was handed to. The payload is
    /// passed through untouched.
    pub fn route(&self, from: &PeerId, destination: &Destination, payload: Value) -> Result<usize> {
        match destination {
            Destination::Peer(to) => {
                debug!("Forwarding signal: {} -> {}", from, to);
                let signal = Notification::Signal(DeliveredSignal::Peer {
                    from: from.clone(),
                    signal: payload,
                });
                if self.deliver(to, signal) {
                    Ok(1)
                } else {
                    Err(Error::UnknownReceiver(to.to_string()))
                }
            }
            Destination::Channel(channel_id) => {
                let members = self
                    .channels
                    .get(channel_id)
                    .filter(|members| members.contains(from))
                    .ok_or_else(|| Error::NotChannelMember {
                        peer_id: from.to_string(),
                        channel_id: channel_id.to_string(),
                    })?;

                let mut delivered = 0;
                for member in members.iter().filter(|m| *m != from) {
                    debug!("Forwarding channel {} signal: {} -> {}", channel_id, from, member);
                    let signal = Notification::Signal(DeliveredSignal::Channel {
                        channel_id: channel_id.clone(),
                        data: payload.clone(),
                    });
                    if self.deliver(member, signal) {
                        delivered += 1;
                    }
                }
                Ok(delivered)
            }
        }
    }

    /// Remove an admitted connection from the registry and every channel
    ///
    /// Idempotent; a stale admission (identity since reused by a newer
    /// connection) is ignored. Returns whether anything was removed.
    pub fn disconnect(&mut self, admission: &Admission) -> bool {
        let owned = self
            .peers
            .get(&admission.peer_id)
            .is_some_and(|entry| entry.connection_id == admission.connection_id);
        if !owned {
            return false;
        }
        let Some(entry) = self.peers.remove(&admission.peer_id) else {
            return false;
        };
        self.order.retain(|id| id != &admission.peer_id);

        self.channels.retain(|channel_id, members| {
            let before = members.len();
            members.retain(|id| id != &admission.peer_id);
            if members.len() != before {
                debug!("Peer {} left channel {}", admission.peer_id, channel_id);
            }
            !members.is_empty()
        });

        info!(
            "Peer disconnected: {} after {:?} (remaining: {})",
            admission.peer_id,
            entry.admitted_at.elapsed(),
            self.order.len()
        );
        self.broadcast_peers();
        true
    }

    fn deliver(&self, peer_id: &PeerId, notification: Notification) -> bool {
        match self.peers.get(peer_id) {
            Some(entry) => match entry.outbox.send(notification) {
                Ok(()) => true,
                Err(_) => {
                    warn!("Outbox for {} closed, dropping notification", peer_id);
                    false
                }
            },
            None => false,
        }
    }

    fn broadcast_peers(&self) {
        for peer_id in &self.order {
            self.deliver(peer_id, Notification::Peers(self.order.clone()));
        }
    }
}
