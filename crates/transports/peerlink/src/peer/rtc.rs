//! webrtc-rs backed peer connection and data channel

use super::capability::{
    ConnectionState, DataChannel, DataChannelEvent, DataChannelState, PeerConnection,
    PeerConnectionEvent,
};
use crate::config::SessionConfig;
use crate::payload::{Payload, MAX_MESSAGE_SIZE};
use crate::signaling::protocol::{IceCandidate, SdpKind, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Peer connection on top of `webrtc::RTCPeerConnection`
pub struct RtcPeerConnection {
    inner: Arc<RTCPeerConnection>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PeerConnectionEvent>>>,
}

impl RtcPeerConnection {
    /// Build a peer connection with the configured STUN/TURN servers
    #[instrument(skip(config))]
    pub async fn new(config: &SessionConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::WebRtc(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let inner = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| Error::WebRtc(format!("Failed to create peer connection: {}", e)))?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        inner.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // None marks end of gathering; nothing to forward
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerConnectionEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let tx = events_tx.clone();
        inner.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!("Peer connection state: {}", s);
                let _ = tx.send(PeerConnectionEvent::StateChange(map_connection_state(s)));
            })
        }));

        let tx = events_tx;
        inner.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            Box::pin(async move {
                info!("Remote opened data channel '{}'", dc.label());
                let channel = RtcDataChannel::wrap(dc).await;
                let _ = tx.send(PeerConnectionEvent::DataChannel(channel));
            })
        }));

        Ok(Self {
            inner,
            events: Mutex::new(Some(events_rx)),
        })
    }
}

fn map_connection_state(s: RTCPeerConnectionState) -> ConnectionState {
    match s {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|e| Error::Negotiation(format!("Failed to parse description: {}", e)))
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(Error::Negotiation(format!(
            "Unsupported description type: {:?}",
            other
        ))),
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .inner
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to create data channel: {}", e)))?;
        Ok(RtcDataChannel::wrap(dc).await)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .inner
            .create_offer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create offer: {}", e)))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .inner
            .create_answer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create answer: {}", e)))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.inner
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.inner
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };
        self.inner
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to add ICE candidate: {}", e)))
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.inner.connection_state())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerConnectionEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection");
        self.inner.close().await?;
        Ok(())
    }
}

/// Data channel on top of `webrtc::RTCDataChannel`
pub struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
    events: Mutex<Option<mpsc::UnboundedReceiver<DataChannelEvent>>>,
}

impl RtcDataChannel {
    /// Wrap a channel and route its callbacks into an event stream
    async fn wrap(inner: Arc<RTCDataChannel>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let label = inner.label().to_string();

        let tx = events_tx.clone();
        let open_label = label.clone();
        inner.on_open(Box::new(move || {
            let tx = tx.clone();
            let label = open_label.clone();
            Box::pin(async move {
                debug!("Data channel '{}' opened", label);
                let _ = tx.send(DataChannelEvent::Open);
            })
        }));

        let tx = events_tx.clone();
        let close_label = label.clone();
        inner.on_close(Box::new(move || {
            let tx = tx.clone();
            let label = close_label.clone();
            Box::pin(async move {
                debug!("Data channel '{}' closed", label);
                let _ = tx.send(DataChannelEvent::Close);
            })
        }));

        let tx = events_tx.clone();
        let error_label = label.clone();
        inner.on_error(Box::new(move |err: webrtc::Error| {
            let tx = tx.clone();
            let label = error_label.clone();
            Box::pin(async move {
                error!("Data channel '{}' error: {}", label, err);
                let _ = tx.send(DataChannelEvent::Error(err.to_string()));
            })
        }));

        let tx = events_tx.clone();
        inner.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            let payload = Payload::from_wire(msg.data, msg.is_string);
            Box::pin(async move {
                let _ = tx.send(DataChannelEvent::Message(payload));
            })
        }));

        let tx = events_tx;
        inner
            .on_buffered_amount_low(Box::new(move || {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(DataChannelEvent::BufferedAmountLow);
                })
            }))
            .await;
        inner.set_buffered_amount_low_threshold(MAX_MESSAGE_SIZE).await;

        Arc::new(Self {
            inner,
            events: Mutex::new(Some(events_rx)),
        })
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    fn ready_state(&self) -> DataChannelState {
        match self.inner.ready_state() {
            RTCDataChannelState::Open => DataChannelState::Open,
            RTCDataChannelState::Closing => DataChannelState::Closing,
            RTCDataChannelState::Closed => DataChannelState::Closed,
            _ => DataChannelState::Connecting,
        }
    }

    async fn buffered_amount(&self) -> usize {
        self.inner.buffered_amount().await
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.inner.set_buffered_amount_low_threshold(threshold).await;
    }

    async fn send(&self, payload: &Payload) -> Result<usize> {
        let sent = match payload {
            Payload::Text(text) => self.inner.send_text(text.clone()).await,
            Payload::Binary(data) => self.inner.send(data).await,
        };
        sent.map_err(|e| Error::TransportSend(e.to_string()))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DataChannelEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await?;
        Ok(())
    }
}
