//! Per-peer session: offer/answer/ICE through the relay, then reliable sends
//!
//! A session binds to exactly one remote destination, either a peer identity
//! ([`PeerSession::connect`]) or a rendezvous channel
//! ([`PeerSession::join_channel`]). One background task reacts to relay
//! notifications and connection events; a second one per data channel feeds
//! received payloads to the application and wakes the send queue.

use super::capability::{
    ConnectionState, DataChannel, DataChannelEvent, DataChannelState, PeerConnection,
    PeerConnectionEvent,
};
use super::rtc::RtcPeerConnection;
use crate::channels::{ChannelSlot, QueueSettings, SendQueue};
use crate::config::SessionConfig;
use crate::payload::{validate_message, Payload};
use crate::poll::wait_until;
use crate::sdp::{remote_max_message_size, DEFAULT_REMOTE_MAX_MESSAGE_SIZE};
use crate::signaling::protocol::{
    ChannelId, DeliveredSignal, Destination, IceCandidate, Notification, PeerId,
    SessionDescription, SignalPayload,
};
use crate::signaling::SignalingClient;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Establishment progress of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing sent or received yet
    Idle,
    /// Offer sent, waiting for the answer
    Offering,
    /// Offer received, answer being produced
    Answering,
    /// Descriptions exchanged, waiting for connectivity
    Negotiating,
    /// Connection connected and data channel open
    Open,
    Closed,
    /// Establishment failed; the relay connection is kept
    Failed,
}

impl SessionState {
    /// Whether no further transitions (other than close) can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Offering => "offering",
            SessionState::Answering => "answering",
            SessionState::Negotiating => "negotiating",
            SessionState::Open => "open",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Diagnostic snapshot returned by [`PeerSession::debug_state`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDebugState {
    pub state: SessionState,
    pub connection_state: ConnectionState,
    pub channel_state: Option<DataChannelState>,
    pub buffered_amount: Option<usize>,
    pub queued: usize,
    pub remote_max_message_size: usize,
}

struct SessionInner {
    config: SessionConfig,
    signaling: SignalingClient,
    connection: Arc<dyn PeerConnection>,
    /// Bound once, at offer-send or offer-receive time
    remote: Mutex<Option<Destination>>,
    slot: ChannelSlot,
    queue: SendQueue,
    state: watch::Sender<SessionState>,
    remote_max_message_size: AtomicUsize,
    remote_description_set: AtomicBool,
    /// Remote candidates that arrived before the remote description, by sender
    pending_candidates: Mutex<Vec<(Destination, IceCandidate)>>,
    /// First establishment failure, reported by `connect` and `wait_open`
    failure: Mutex<Option<String>>,
    incoming_tx: mpsc::UnboundedSender<Payload>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Local end of a peer-to-peer data channel
pub struct PeerSession {
    inner: Arc<SessionInner>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Payload>>>,
}

impl PeerSession {
    /// Connect to the relay as `peer_id` and prepare a webrtc-rs connection
    pub async fn connect_relay(config: SessionConfig, peer_id: &str) -> Result<Self> {
        config.validate()?;
        let signaling = SignalingClient::connect(&config.signal_server_url, peer_id).await?;
        let connection = Arc::new(RtcPeerConnection::new(&config).await?);
        Self::with_connection(config, signaling, connection)
    }

    /// Build a session over an admitted relay client and a peer connection
    pub fn with_connection(
        config: SessionConfig,
        signaling: SignalingClient,
        connection: Arc<dyn PeerConnection>,
    ) -> Result<Self> {
        config.validate()?;
        let notifications = signaling
            .take_notifications()
            .ok_or_else(|| Error::Session("relay notifications already taken".to_string()))?;
        let connection_events = connection
            .take_events()
            .ok_or_else(|| Error::Session("connection events already taken".to_string()))?;

        let slot: ChannelSlot = Arc::new(RwLock::new(None));
        let queue = SendQueue::new(Arc::clone(&slot), QueueSettings::from(&config));
        let (state, _) = watch::channel(SessionState::Idle);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(SessionInner {
            config,
            signaling,
            connection,
            remote: Mutex::new(None),
            slot,
            queue,
            state,
            remote_max_message_size: AtomicUsize::new(DEFAULT_REMOTE_MAX_MESSAGE_SIZE),
            remote_description_set: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            incoming_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let task = tokio::spawn(SessionInner::run(
            Arc::clone(&inner),
            notifications,
            connection_events,
        ));
        inner.tasks.lock().push(task);

        Ok(Self {
            inner,
            incoming: Mutex::new(Some(incoming_rx)),
        })
    }

    /// Offer a connection to `remote_id` and wait for it to connect
    ///
    /// Returns the negotiation error as soon as applying the answer or a
    /// candidate fails. Fails with a timeout (and moves to `Failed`) when the
    /// connection does not report "connected" within the configured bound.
    #[instrument(skip(self), fields(local = %self.inner.signaling.peer_id()))]
    pub async fn connect(&self, remote_id: &str) -> Result<()> {
        let destination = Destination::Peer(PeerId::parse(remote_id)?);
        if *self.inner.state.borrow() != SessionState::Idle {
            return Err(Error::Session("session already started".to_string()));
        }
        self.inner.bind_remote(&destination)?;

        if let Err(e) = self.inner.start_offer(&destination).await {
            self.inner.fail(&e);
            return Err(e);
        }

        let inner = Arc::clone(&self.inner);
        let settled = wait_until(
            "connection connected",
            self.inner.config.poll_interval,
            self.inner.config.connect_timeout,
            || {
                let settled = inner.connection.connection_state() == ConnectionState::Connected
                    || inner.state.borrow().is_terminal();
                async move { settled }
            },
        )
        .await;

        match self.state() {
            SessionState::Failed => return Err(self.inner.failure()),
            SessionState::Closed => return Err(Error::ChannelClosed),
            _ => {}
        }
        if settled.is_err() {
            let e = Error::Timeout("connection timeout".to_string());
            self.inner.fail(&e);
            return Err(e);
        }
        self.inner.check_open();
        Ok(())
    }

    /// Join a two-member rendezvous channel
    ///
    /// The relay picks the first member as the offering side; establishment
    /// then proceeds in the background. Returns the member count after joining.
    #[instrument(skip(self), fields(local = %self.inner.signaling.peer_id()))]
    pub async fn join_channel(&self, channel_id: &str) -> Result<usize> {
        let destination = Destination::Channel(ChannelId::parse(channel_id)?);
        if *self.inner.state.borrow() != SessionState::Idle {
            return Err(Error::Session("session already started".to_string()));
        }
        self.inner.bind_remote(&destination)?;

        match self.inner.signaling.join_channel(channel_id).await {
            Ok(members) => {
                info!("Joined channel {} ({} members)", channel_id, members);
                Ok(members)
            }
            Err(e) => {
                // Let the caller try another channel
                self.inner.remote.lock().take();
                Err(e)
            }
        }
    }

    /// Wait until the session is open
    pub async fn wait_open(&self, timeout: Duration) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        let reached = tokio::time::timeout(timeout, state.wait_for(|s| *s == SessionState::Open || s.is_terminal()))
            .await
            .map_err(|_| Error::Timeout("session open".to_string()))?
            .map_err(|_| Error::Session("session dropped".to_string()))?;
        match *reached {
            SessionState::Open => Ok(()),
            SessionState::Failed => Err(self.inner.failure()),
            _ => Err(Error::ChannelClosed),
        }
    }

    /// Queue a payload and wait until it is handed to the transport
    ///
    /// Payloads over the local cap are rejected before queueing.
    pub async fn send_async(&self, payload: impl Into<Payload>) -> Result<()> {
        self.inner.queue.send_async(payload.into()).await
    }

    /// Send immediately, bypassing the queue and its backpressure
    ///
    /// Returns whether the transport accepted the payload.
    pub async fn send(&self, payload: impl Into<Payload>) -> bool {
        let payload = payload.into();
        if let Err(e) = validate_message(&payload, self.inner.config.max_message_size) {
            warn!("Rejected direct send: {}", e);
            return false;
        }
        let Some(channel) = self.inner.open_channel() else {
            warn!("Direct send while data channel is not open");
            return false;
        };
        match channel.send(&payload).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Direct send failed: {}", e);
                false
            }
        }
    }

    /// Take the stream of received payloads; `None` after the first call
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Payload>> {
        self.incoming.lock().take()
    }

    /// Largest message the remote announced (informational)
    pub fn remote_max_message_size(&self) -> usize {
        self.inner.remote_max_message_size.load(Ordering::SeqCst)
    }

    /// Identity granted by the relay
    pub fn local_id(&self) -> &PeerId {
        self.inner.signaling.peer_id()
    }

    /// Destination this session is bound to, if any
    pub fn remote(&self) -> Option<Destination> {
        self.inner.remote.lock().clone()
    }

    /// Latest live-peer list announced by the relay
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.signaling.peers()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Snapshot of connection, channel and queue state, also logged
    pub async fn debug_state(&self) -> SessionDebugState {
        let channel = self.inner.slot.read().clone();
        let (channel_state, buffered_amount) = match channel {
            Some(channel) => (
                Some(channel.ready_state()),
                Some(channel.buffered_amount().await),
            ),
            None => (None, None),
        };
        let snapshot = SessionDebugState {
            state: self.state(),
            connection_state: self.inner.connection.connection_state(),
            channel_state,
            buffered_amount,
            queued: self.inner.queue.len(),
            remote_max_message_size: self.remote_max_message_size(),
        };
        info!(?snapshot, "Session debug state");
        snapshot
    }

    /// Close the data channel, the connection, and the relay session
    pub async fn close(&self) -> Result<()> {
        info!("Closing session {}", self.local_id());
        self.inner.transition(SessionState::Closed);
        self.inner.queue.close_all();

        let channel = self.inner.slot.read().clone();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!("Failed to close data channel: {}", e);
            }
        }
        self.inner.connection.close().await?;
        self.inner.signaling.close();
        self.inner.abort_tasks();
        Ok(())
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.inner.queue.close_all();
        self.inner.abort_tasks();
    }
}

impl SessionInner {
    async fn run(
        inner: Arc<SessionInner>,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
        mut connection_events: mpsc::UnboundedReceiver<PeerConnectionEvent>,
    ) {
        loop {
            tokio::select! {
                note = notifications.recv() => match note {
                    Some(note) => inner.on_notification(note).await,
                    None => {
                        info!("Relay connection closed, ending session");
                        inner.transition(SessionState::Closed);
                        inner.queue.close_all();
                        break;
                    }
                },
                Some(event) = connection_events.recv() => inner.on_connection_event(event).await,
            }
        }
    }

    fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            let allowed = match (*current, next) {
                (SessionState::Closed, _) => false,
                (SessionState::Failed, SessionState::Closed) => true,
                (SessionState::Failed, _) => false,
                (from, to) => from != to,
            };
            if allowed {
                debug!("Session state: {} -> {}", current, next);
                *current = next;
            }
            allowed
        })
    }

    fn fail(&self, error: &Error) {
        error!(
            retryable = error.is_retryable(),
            "Session establishment failed: {}", error
        );
        let reason = match error {
            Error::Negotiation(reason) => reason.clone(),
            other => other.to_string(),
        };
        if !self.state.borrow().is_terminal() {
            self.failure.lock().get_or_insert(reason);
        }
        self.transition(SessionState::Failed);
    }

    /// Recorded failure as a negotiation error
    fn failure(&self) -> Error {
        let reason = self.failure.lock().clone();
        Error::Negotiation(reason.unwrap_or_else(|| "establishment failed".to_string()))
    }

    fn bind_remote(&self, destination: &Destination) -> Result<()> {
        let mut remote = self.remote.lock();
        match &*remote {
            None => {
                *remote = Some(destination.clone());
                Ok(())
            }
            Some(existing) if existing == destination => Ok(()),
            Some(existing) => Err(Error::Session(format!(
                "session already bound to {}",
                existing
            ))),
        }
    }

    fn bound_to(&self, destination: &Destination) -> bool {
        self.remote.lock().as_ref() == Some(destination)
    }

    fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.slot
            .read()
            .as_ref()
            .filter(|channel| channel.ready_state() == DataChannelState::Open)
            .cloned()
    }

    fn check_open(&self) {
        if self.connection.connection_state() == ConnectionState::Connected
            && self.open_channel().is_some()
            && self.transition(SessionState::Open)
        {
            info!("Session open");
            self.queue.trigger_drain();
        }
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn send_signal(&self, destination: &Destination, payload: SignalPayload) -> Result<()> {
        debug!("Sending {} to {}", payload.kind(), destination);
        let value = serde_json::to_value(payload)?;
        self.signaling.signal(destination, value).await
    }

    /// Offering side: create the channel, the offer, and send it
    async fn start_offer(self: &Arc<Self>, destination: &Destination) -> Result<()> {
        let channel = self
            .connection
            .create_data_channel(&self.config.channel_label)
            .await?;
        self.attach_channel(channel).await;

        let offer = self.connection.create_offer().await?;
        self.connection.set_local_description(offer.clone()).await?;
        // The answer can arrive before the relay acknowledges the offer
        self.transition(SessionState::Offering);
        self.send_signal(destination, SignalPayload::Offer(offer)).await
    }

    /// Answering side: apply the offer, answer it, and send the answer back
    async fn respond(&self, destination: &Destination, offer: SessionDescription) -> Result<()> {
        self.transition(SessionState::Answering);
        self.apply_remote_description(offer).await?;

        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;
        self.send_signal(destination, SignalPayload::Answer(answer)).await?;
        self.transition(SessionState::Negotiating);
        Ok(())
    }

    async fn apply_remote_description(&self, description: SessionDescription) -> Result<()> {
        let announced = remote_max_message_size(&description.sdp);
        self.connection.set_remote_description(description).await?;
        self.remote_max_message_size.store(announced, Ordering::SeqCst);
        self.remote_description_set.store(true, Ordering::SeqCst);
        debug!("Remote max message size: {}", announced);

        let pending: Vec<(Destination, IceCandidate)> =
            self.pending_candidates.lock().drain(..).collect();
        for (source, candidate) in pending {
            if self.bound_to(&source) {
                self.apply_candidate(candidate).await?;
            } else {
                debug!("Discarding buffered candidate from {}", source);
            }
        }
        Ok(())
    }

    async fn apply_candidate(&self, candidate: IceCandidate) -> Result<()> {
        debug!("Applying remote candidate {}", candidate.candidate);
        self.connection.add_ice_candidate(candidate).await
    }

    async fn attach_channel(self: &Arc<Self>, channel: Arc<dyn DataChannel>) {
        info!("Data channel '{}' attached", channel.label());
        channel
            .set_buffered_amount_low_threshold(self.config.max_message_size)
            .await;
        let events = channel.take_events();
        *self.slot.write() = Some(channel);

        let Some(mut events) = events else {
            warn!("Data channel events already taken");
            return;
        };
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    DataChannelEvent::Open => {
                        debug!("Data channel open");
                        inner.check_open();
                        inner.queue.trigger_drain();
                    }
                    DataChannelEvent::Message(payload) => {
                        let _ = inner.incoming_tx.send(payload);
                    }
                    DataChannelEvent::BufferedAmountLow => inner.queue.trigger_drain(),
                    DataChannelEvent::Error(e) => warn!("Data channel error: {}", e),
                    DataChannelEvent::Close => {
                        info!("Data channel closed");
                        inner.queue.close_all();
                        inner.transition(SessionState::Closed);
                        break;
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    async fn on_notification(self: &Arc<Self>, note: Notification) {
        match note {
            Notification::Peers(peers) => debug!("Relay peers: {:?}", peers),
            Notification::Initiate(channel_id) => {
                let destination = Destination::Channel(channel_id);
                if !self.bound_to(&destination) || *self.state.borrow() != SessionState::Idle {
                    warn!("Ignoring initiate for {}", destination);
                    return;
                }
                info!("Initiating on {}", destination);
                if let Err(e) = self.start_offer(&destination).await {
                    self.fail(&e);
                }
            }
            Notification::Signal(DeliveredSignal::Peer { from, signal }) => {
                self.on_signal(Destination::Peer(from), signal).await
            }
            Notification::Signal(DeliveredSignal::Channel { channel_id, data }) => {
                self.on_signal(Destination::Channel(channel_id), data).await
            }
        }
    }

    async fn on_signal(self: &Arc<Self>, source: Destination, value: Value) {
        let payload: SignalPayload = match serde_json::from_value(value) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("Ignoring unrecognized signal from {}: {}", source, e);
                return;
            }
        };
        debug!("Received {} from {}", payload.kind(), source);

        match payload {
            SignalPayload::Offer(offer) => {
                let idle = *self.state.borrow() == SessionState::Idle;
                if !idle || self.bind_remote(&source).is_err() {
                    warn!("Ignoring offer from {}", source);
                    return;
                }
                if let Err(e) = self.respond(&source, offer).await {
                    self.fail(&e);
                }
            }
            SignalPayload::Answer(answer) => {
                if !self.bound_to(&source) || *self.state.borrow() != SessionState::Offering {
                    warn!("Ignoring answer from {}", source);
                    return;
                }
                match self.apply_remote_description(answer).await {
                    Ok(()) => {
                        self.transition(SessionState::Negotiating);
                        self.check_open();
                    }
                    Err(e) => self.fail(&e),
                }
            }
            SignalPayload::Candidate(candidate) => {
                // Candidates may overtake the offer that binds the session
                if self.remote_description_set.load(Ordering::SeqCst) {
                    if !self.bound_to(&source) {
                        warn!("Ignoring candidate from {}", source);
                    } else if let Err(e) = self.apply_candidate(candidate).await {
                        self.fail(&e);
                    }
                } else {
                    debug!("Buffering early candidate from {}", source);
                    self.pending_candidates.lock().push((source, candidate));
                }
            }
        }
    }

    async fn on_connection_event(self: &Arc<Self>, event: PeerConnectionEvent) {
        match event {
            PeerConnectionEvent::IceCandidate(candidate) => {
                let remote = self.remote.lock().clone();
                let Some(destination) = remote else {
                    debug!("Dropping local candidate: no remote bound");
                    return;
                };
                if let Err(e) = self
                    .send_signal(&destination, SignalPayload::Candidate(candidate))
                    .await
                {
                    warn!("Failed to forward local candidate: {}", e);
                }
            }
            PeerConnectionEvent::DataChannel(channel) => {
                self.attach_channel(channel).await;
                self.check_open();
            }
            PeerConnectionEvent::StateChange(state) => match state {
                ConnectionState::Connected => self.check_open(),
                ConnectionState::Failed => {
                    self.fail(&Error::Negotiation("connection failed".to_string()))
                }
                _ => debug!("Connection state: {}", state),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::mock::{MockNetwork, MockPeerConnection};
    use crate::signaling::{RelayServer, RelayServerHandle};
    use std::net::SocketAddr;

    struct Fixture {
        relay: RelayServerHandle,
        network: MockNetwork,
        connection: Arc<MockPeerConnection>,
        session: PeerSession,
    }

    async fn fixture(peer_id: &str) -> Fixture {
        let relay = RelayServer::new(RelayConfig {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        })
        .unwrap()
        .start()
        .await
        .unwrap();
        let network = MockNetwork::new();
        let connection = network.create_connection();
        let signaling = SignalingClient::connect(&relay.url(), peer_id).await.unwrap();
        let dyn_connection: Arc<dyn PeerConnection> = connection.clone();
        let session = PeerSession::with_connection(
            SessionConfig::with_signal_server(relay.url()),
            signaling,
            dyn_connection,
        )
        .unwrap();
        Fixture {
            relay,
            network,
            connection,
            session,
        }
    }

    fn peer(id: &str) -> Destination {
        Destination::Peer(PeerId::parse(id).unwrap())
    }

    fn candidate(tag: &str) -> Value {
        serde_json::to_value(SignalPayload::Candidate(IceCandidate {
            candidate: format!("candidate:{} 1 udp 1 127.0.0.1 9 typ host", tag),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }))
        .unwrap()
    }

    /// Offer from another connection on the fixture's network
    async fn remote_offer(network: &MockNetwork) -> (Arc<MockPeerConnection>, SessionDescription) {
        let offerer = network.create_connection();
        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        (offerer, offer)
    }

    #[tokio::test]
    async fn test_closed_is_absorbing() {
        let f = fixture("A").await;
        let inner = &f.session.inner;

        assert!(inner.transition(SessionState::Offering));
        assert!(inner.transition(SessionState::Closed));
        for next in [
            SessionState::Idle,
            SessionState::Offering,
            SessionState::Answering,
            SessionState::Negotiating,
            SessionState::Open,
            SessionState::Failed,
        ] {
            assert!(!inner.transition(next), "closed -> {}", next);
        }
        assert_eq!(f.session.state(), SessionState::Closed);

        f.relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_only_moves_to_closed() {
        let f = fixture("A").await;
        let inner = &f.session.inner;

        assert!(!inner.transition(SessionState::Idle));
        inner.transition(SessionState::Negotiating);
        inner.fail(&Error::Negotiation("answer rejected".to_string()));
        assert_eq!(f.session.state(), SessionState::Failed);
        assert!(f.session.state().is_terminal());

        assert!(!inner.transition(SessionState::Open));
        assert!(!inner.transition(SessionState::Idle));
        assert!(inner.transition(SessionState::Closed));

        f.relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_first_failure_reason_is_kept() {
        let f = fixture("A").await;
        let inner = &f.session.inner;

        inner.fail(&Error::Timeout("connection timeout".to_string()));
        inner.fail(&Error::Negotiation("later".to_string()));
        assert_eq!(
            inner.failure().to_string(),
            "negotiation failed: Operation timeout: connection timeout"
        );

        let err = f
            .session
            .wait_open(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Negotiation(_)));

        f.relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_binds_once() {
        let f = fixture("A").await;
        let inner = &f.session.inner;

        inner.bind_remote(&peer("B")).unwrap();
        inner.bind_remote(&peer("B")).unwrap();
        assert!(matches!(inner.bind_remote(&peer("C")), Err(Error::Session(_))));
        let room = Destination::Channel(ChannelId::parse("room").unwrap());
        assert!(matches!(inner.bind_remote(&room), Err(Error::Session(_))));
        assert_eq!(f.session.remote(), Some(peer("B")));

        f.relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_early_candidates_replayed_for_bound_source_only() {
        let f = fixture("A").await;
        let inner = &f.session.inner;
        let (_offerer, offer) = remote_offer(&f.network).await;

        inner.bind_remote(&peer("B")).unwrap();
        inner.on_signal(peer("B"), candidate("b")).await;
        inner.on_signal(peer("C"), candidate("c")).await;
        assert_eq!(inner.pending_candidates.lock().len(), 2);
        assert_eq!(f.connection.applied_candidates(), 0);

        inner.apply_remote_description(offer).await.unwrap();
        assert_eq!(f.connection.applied_candidates(), 1);
        assert!(inner.pending_candidates.lock().is_empty());

        // Once the description is set, candidates apply immediately
        inner.on_signal(peer("B"), candidate("b2")).await;
        inner.on_signal(peer("C"), candidate("c2")).await;
        assert_eq!(f.connection.applied_candidates(), 2);
        assert_eq!(f.session.state(), SessionState::Idle);

        f.relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_candidate_failures_fail_negotiation() {
        let f = fixture("A").await;
        let inner = &f.session.inner;
        let (_offerer, offer) = remote_offer(&f.network).await;
        f.network.reject_candidates(true);

        inner.bind_remote(&peer("B")).unwrap();
        inner.on_signal(peer("B"), candidate("early")).await;
        let err = inner.apply_remote_description(offer).await.unwrap_err();
        assert_eq!(err.to_string(), "negotiation failed: candidate rejected");

        inner.on_signal(peer("B"), candidate("late")).await;
        assert_eq!(f.session.state(), SessionState::Failed);
        assert_eq!(
            inner.failure().to_string(),
            "negotiation failed: candidate rejected"
        );

        f.relay.shutdown().await;
    }
}
