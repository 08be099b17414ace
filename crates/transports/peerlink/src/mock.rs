//! In-memory peer connections for tests
//!
//! [`MockNetwork`] hands out [`MockPeerConnection`]s that negotiate through
//! the real signal relay but move data through in-process channels. The
//! offer carries a token naming the offering connection; applying that offer
//! on another connection of the same network links the two, and applying the
//! answer on the offerer "connects" them and opens the paired data channels.

use crate::payload::Payload;
use crate::peer::capability::{
    ConnectionState, DataChannel, DataChannelEvent, DataChannelState, PeerConnection,
    PeerConnectionEvent,
};
use crate::signaling::protocol::{IceCandidate, SdpKind, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use tokio::sync::mpsc;
use tracing::debug;

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"a=mock-token:(\d+)").expect("token pattern compiles"));

#[derive(Default)]
struct NetworkInner {
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, Weak<MockPeerConnection>>>,
    announced_max_message_size: Mutex<Option<usize>>,
    reject_offers: AtomicBool,
    reject_answers: AtomicBool,
    reject_candidates: AtomicBool,
}

/// Shared namespace in which mock connections find each other
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<NetworkInner>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce `a=max-message-size` with this value in generated descriptions
    pub fn announce_max_message_size(&self, size: usize) {
        *self.inner.announced_max_message_size.lock() = Some(size);
    }

    /// Make every `set_remote_description(offer)` fail
    pub fn reject_offers(&self, reject: bool) {
        self.inner.reject_offers.store(reject, Ordering::SeqCst);
    }

    /// Make every `set_remote_description(answer)` fail
    pub fn reject_answers(&self, reject: bool) {
        self.inner.reject_answers.store(reject, Ordering::SeqCst);
    }

    /// Make every `add_ice_candidate` fail once a remote description is set
    pub fn reject_candidates(&self, reject: bool) {
        self.inner.reject_candidates.store(reject, Ordering::SeqCst);
    }

    /// Create a connection attached to this network
    pub fn create_connection(&self) -> Arc<MockPeerConnection> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(MockPeerConnection {
            id,
            network: Arc::clone(&self.inner),
            state: Mutex::new(ConnectionState::New),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
            applied_candidates: AtomicUsize::new(0),
        });
        self.inner
            .connections
            .lock()
            .insert(id, Arc::downgrade(&connection));
        connection
    }
}

/// Loopback peer connection
pub struct MockPeerConnection {
    id: u64,
    network: Arc<NetworkInner>,
    state: Mutex<ConnectionState>,
    events_tx: mpsc::UnboundedSender<PeerConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerConnectionEvent>>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    /// Channels created locally; paired with remote ones on connect
    channels: Mutex<Vec<Arc<MockDataChannel>>>,
    applied_candidates: AtomicUsize,
}

impl MockPeerConnection {
    /// Remote candidates applied so far
    pub fn applied_candidates(&self) -> usize {
        self.applied_candidates.load(Ordering::SeqCst)
    }

    fn description(&self, kind: SdpKind) -> SessionDescription {
        let mut sdp = format!(
            "v=0\r\no=mock {id} 0 IN IP4 127.0.0.1\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mock-token:{id}\r\n",
            id = self.id
        );
        if let Some(size) = *self.network.announced_max_message_size.lock() {
            sdp.push_str(&format!("a=max-message-size:{}\r\n", size));
        }
        SessionDescription { kind, sdp }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
        let _ = self.events_tx.send(PeerConnectionEvent::StateChange(state));
    }

    /// Offerer side: link channels with the answering connection and open them
    fn establish(&self, answerer: &MockPeerConnection) {
        for side in [self, answerer] {
            side.set_state(ConnectionState::Connecting);
            side.set_state(ConnectionState::Connected);
        }

        let channels = self.channels.lock().clone();
        for local in channels {
            let remote = MockDataChannel::new(&local.label);
            MockDataChannel::pair(&local, &remote);
            let _ = answerer
                .events_tx
                .send(PeerConnectionEvent::DataChannel(remote.clone()));
            local.open();
            remote.open();
        }
        debug!("Mock connections {} and {} established", self.id, answerer.id);
    }
}

fn token(sdp: &str) -> Option<u64> {
    TOKEN
        .captures(sdp)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let channel = MockDataChannel::new(label);
        self.channels.lock().push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(self.description(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        match &*self.remote.lock() {
            Some(remote) if remote.kind == SdpKind::Offer => Ok(self.description(SdpKind::Answer)),
            _ => Err(Error::Negotiation(
                "cannot answer without a remote offer".to_string(),
            )),
        }
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        *self.local.lock() = Some(description);
        let _ = self
            .events_tx
            .send(PeerConnectionEvent::IceCandidate(IceCandidate {
                candidate: format!("candidate:mock{} 1 udp 2130706431 127.0.0.1 9 typ host", self.id),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            }));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote_id = token(&description.sdp)
            .ok_or_else(|| Error::Negotiation("description carries no mock token".to_string()))?;
        let remote = self
            .network
            .connections
            .lock()
            .get(&remote_id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Negotiation(format!("no mock connection {}", remote_id)))?;

        match description.kind {
            SdpKind::Offer => {
                if self.network.reject_offers.load(Ordering::SeqCst) {
                    return Err(Error::Negotiation("offer rejected".to_string()));
                }
                debug!("Mock connection {} received offer from {}", self.id, remote.id);
                *self.remote.lock() = Some(description);
            }
            SdpKind::Answer => {
                if self.network.reject_answers.load(Ordering::SeqCst) {
                    return Err(Error::Negotiation("answer rejected".to_string()));
                }
                let has_offer = matches!(
                    &*self.local.lock(),
                    Some(local) if local.kind == SdpKind::Offer
                );
                if !has_offer {
                    return Err(Error::Negotiation(
                        "answer applied without a local offer".to_string(),
                    ));
                }
                *self.remote.lock() = Some(description);
                self.establish(&remote);
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.remote.lock().is_none() {
            return Err(Error::Negotiation(
                "remote description not set".to_string(),
            ));
        }
        if self.network.reject_candidates.load(Ordering::SeqCst) {
            return Err(Error::Negotiation("candidate rejected".to_string()));
        }
        debug!("Mock connection {} applied {}", self.id, candidate.candidate);
        self.applied_candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerConnectionEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<()> {
        self.set_state(ConnectionState::Closed);
        let channels = self.channels.lock().clone();
        for channel in channels {
            channel.close().await?;
        }
        Ok(())
    }
}

/// Loopback data channel with a settable buffered amount
pub struct MockDataChannel {
    label: String,
    state: Mutex<DataChannelState>,
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    events_tx: mpsc::UnboundedSender<DataChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DataChannelEvent>>>,
    remote: Mutex<Weak<MockDataChannel>>,
    sent: Mutex<Vec<Payload>>,
    fail_sends: AtomicBool,
}

impl MockDataChannel {
    /// Unpaired channel in the `connecting` state
    pub fn new(label: &str) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(DataChannelState::Connecting),
            buffered: AtomicUsize::new(0),
            low_threshold: AtomicUsize::new(0),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            remote: Mutex::new(Weak::new()),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// Deliver each side's sends to the other
    pub fn pair(a: &Arc<Self>, b: &Arc<Self>) {
        *a.remote.lock() = Arc::downgrade(b);
        *b.remote.lock() = Arc::downgrade(a);
    }

    /// Move to `open` and raise the open event
    pub fn open(&self) {
        *self.state.lock() = DataChannelState::Open;
        let _ = self.events_tx.send(DataChannelEvent::Open);
    }

    /// Pretend the transport holds `amount` unsent bytes
    ///
    /// Falling to or below the low threshold raises `bufferedamountlow`.
    pub fn set_buffered_amount(&self, amount: usize) {
        let previous = self.buffered.swap(amount, Ordering::SeqCst);
        let threshold = self.low_threshold.load(Ordering::SeqCst);
        if previous > threshold && amount <= threshold {
            let _ = self.events_tx.send(DataChannelEvent::BufferedAmountLow);
        }
    }

    /// Make subsequent sends fail at the transport
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Payloads accepted by `send`, in order
    pub fn sent(&self) -> Vec<Payload> {
        self.sent.lock().clone()
    }

    /// Current low-water threshold
    pub fn low_threshold(&self) -> usize {
        self.low_threshold.load(Ordering::SeqCst)
    }

    fn mark_closed(&self) -> bool {
        let mut state = self.state.lock();
        if *state == DataChannelState::Closed {
            return false;
        }
        *state = DataChannelState::Closed;
        let _ = self.events_tx.send(DataChannelEvent::Close);
        true
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn ready_state(&self) -> DataChannelState {
        *self.state.lock()
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.low_threshold.store(threshold, Ordering::SeqCst);
    }

    async fn send(&self, payload: &Payload) -> Result<usize> {
        if self.ready_state() != DataChannelState::Open {
            return Err(Error::ChannelNotOpen);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::TransportSend("mock send failure".to_string()));
        }
        self.sent.lock().push(payload.clone());
        if let Some(remote) = self.remote.lock().upgrade() {
            let _ = remote
                .events_tx
                .send(DataChannelEvent::Message(payload.clone()));
        }
        Ok(payload.byte_length())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DataChannelEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<()> {
        if self.mark_closed() {
            if let Some(remote) = self.remote.lock().upgrade() {
                remote.mark_closed();
            }
        }
        Ok(())
    }
}
