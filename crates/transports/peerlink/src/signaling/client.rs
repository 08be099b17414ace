//! WebSocket client for the JSON-RPC 2.0 signal relay

use super::protocol::{
    methods, ChannelParams, Destination, HandshakeParams, IncomingFrame, JsonRpcRequest,
    Notification, PeerId, PeersParams, SignalParams,
};
use crate::{Error, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value>>>;

/// Bound on waiting for the relay to answer a request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared with the background receiver task
#[derive(Default)]
struct Shared {
    pending: Mutex<PendingMap>,
    peers: RwLock<Vec<PeerId>>,
    connected: AtomicBool,
}

/// Request side of the relay socket
struct Requester {
    /// Outgoing frame sender
    tx: mpsc::UnboundedSender<Message>,
    next_id: AtomicU64,
    shared: Arc<Shared>,
}

impl Requester {
    /// Send a request and wait for the relay's reply
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, waiter_tx);

        let text = JsonRpcRequest::new(method, params, Some(json!(id))).to_json()?;
        if !self.shared.connected.load(Ordering::SeqCst)
            || self.tx.send(Message::Text(text)).is_err()
        {
            self.shared.pending.lock().remove(&id);
            return Err(Error::WebSocket("relay connection closed".to_string()));
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, waiter_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::WebSocket("relay connection closed".to_string())),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(Error::Timeout(format!("relay reply to '{}'", method)))
            }
        }
    }
}

/// Admitted connection to the signal relay
pub struct SignalingClient {
    /// Identity granted by the relay
    peer_id: PeerId,

    requester: Requester,

    /// Relay notifications; taken once by the owner
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
}

impl SignalingClient {
    /// Connect to a relay and claim `peer_id`
    ///
    /// The identity is sent as-is; the relay is the authority on its
    /// validity and uniqueness. A rejected claim surfaces as
    /// [`Error::AdmissionRejected`].
    pub async fn connect(url: &str, peer_id: &str) -> Result<Self> {
        info!("Connecting to signal relay: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocket(format!("Failed to connect: {}", e)))?;

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (note_tx, note_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        shared.connected.store(true, Ordering::SeqCst);

        tokio::spawn(Self::sender_task(write, rx));
        tokio::spawn(Self::receiver_task(read, Arc::clone(&shared), note_tx));

        let requester = Requester {
            tx,
            next_id: AtomicU64::new(1),
            shared,
        };

        let params = serde_json::to_value(HandshakeParams {
            peer_id: peer_id.to_string(),
        })?;
        let result = requester.request(methods::HANDSHAKE, params).await?;
        let granted: HandshakeParams = serde_json::from_value(result)?;
        let peer_id = PeerId::parse(granted.peer_id)?;

        info!("Admitted to signal relay as {}", peer_id);
        Ok(Self {
            peer_id,
            requester,
            notifications: Mutex::new(Some(note_rx)),
        })
    }

    /// Sender task: sends frames from the channel to the WebSocket
    async fn sender_task(
        mut write: SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }

        debug!("Sender task terminated");
    }

    /// Receiver task: resolves pending requests and forwards notifications
    async fn receiver_task(
        mut read: SplitStream<WsStream>,
        shared: Arc<Shared>,
        note_tx: mpsc::UnboundedSender<Notification>,
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    if let Err(e) = Self::handle_frame(&text, &shared, &note_tx) {
                        warn!("Failed to handle relay frame: {}", e);
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!("Relay closed the connection: {:?}", frame);
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        shared.connected.store(false, Ordering::SeqCst);
        for (_, waiter) in shared.pending.lock().drain() {
            let _ = waiter.send(Err(Error::WebSocket("relay connection closed".to_string())));
        }
        debug!("Receiver task terminated");
    }

    fn handle_frame(
        text: &str,
        shared: &Shared,
        note_tx: &mpsc::UnboundedSender<Notification>,
    ) -> Result<()> {
        match serde_json::from_str::<IncomingFrame>(text)? {
            IncomingFrame::Response(response) => {
                Self::resolve(shared, &response.id, Ok(response.result));
            }
            IncomingFrame::Error(err) => {
                let error = Error::from_rpc(err.error.code, err.error.message);
                if err.id.is_null() {
                    warn!("Relay reported an uncorrelated error: {}", error);
                } else {
                    Self::resolve(shared, &err.id, Err(error));
                }
            }
            IncomingFrame::Notification(request) => {
                let notification = Notification::from_request(request)?;
                if let Notification::Peers(peers) = &notification {
                    debug!("Live peers: {:?}", peers);
                    *shared.peers.write() = peers.clone();
                }
                let _ = note_tx.send(notification);
            }
        }
        Ok(())
    }

    fn resolve(shared: &Shared, id: &Value, outcome: Result<Value>) {
        let waiter = id.as_u64().and_then(|id| shared.pending.lock().remove(&id));
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => warn!("Reply for unknown request id {}", id),
        }
    }

    /// Identity granted by the relay
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Whether the relay connection is still up
    pub fn is_connected(&self) -> bool {
        self.requester.shared.connected.load(Ordering::SeqCst)
    }

    /// Latest live-peer list announced by the relay
    pub fn peers(&self) -> Vec<PeerId> {
        self.requester.shared.peers.read().clone()
    }

    /// Take the relay notification stream
    ///
    /// Returns `None` after the first call. The stream ends when the relay
    /// connection closes.
    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.notifications.lock().take()
    }

    /// Join a rendezvous channel; returns the member count after joining
    pub async fn join_channel(&self, channel_id: &str) -> Result<usize> {
        let params = serde_json::to_value(ChannelParams {
            channel_id: channel_id.to_string(),
        })?;
        let result = self.requester.request(methods::CHANNEL, params).await?;
        let members = result
            .get("members")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Serialization("channel reply without members".to_string()))?;
        Ok(members as usize)
    }

    /// Ask the relay to forward an opaque payload
    pub async fn signal(&self, destination: &Destination, payload: Value) -> Result<()> {
        let params = serde_json::to_value(SignalParams::new(destination, payload))?;
        self.requester.request(methods::SIGNAL, params).await?;
        Ok(())
    }

    /// Ask the relay for the live-peer list
    pub async fn list_peers(&self) -> Result<Vec<PeerId>> {
        let result = self.requester.request(methods::PEER_LIST, json!({})).await?;
        let params: PeersParams = serde_json::from_value(result)?;
        Ok(params.peers)
    }

    /// Close the relay connection
    pub fn close(&self) {
        let _ = self.requester.tx.send(Message::Close(None));
    }
}

impl fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingClient")
            .field("peer_id", &self.peer_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}
