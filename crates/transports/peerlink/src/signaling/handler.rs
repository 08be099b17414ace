//! WebSocket connection handler for the JSON-RPC 2.0 relay
//!
//! One task per connection reads frames and dispatches them against the shared
//! [`SignalRelay`]; a forward task writes replies and relay notifications back
//! to the socket.

use super::protocol::{
    error_codes, methods, ChannelParams, Destination, HandshakeParams, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, Notification, PeerId, SignalParams, JSONRPC_VERSION,
};
use super::relay::{Admission, SignalRelay};
use crate::config::RelayConfig;
use crate::{ChannelId, Error, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::{
    accept_async_with_config,
    tungstenite::{Message, Result as WsResult},
};
use tracing::{debug, error, info, warn};

/// How long queued replies get to flush once a connection is finished
const FLUSH_GRACE: Duration = Duration::from_secs(1);

/// Shared state across all relay connections
pub struct SharedState {
    /// Registry and channel table; never held across an await
    pub relay: Mutex<SignalRelay>,
    pub config: Arc<RelayConfig>,
}

impl SharedState {
    /// Create new shared state with an empty relay
    pub fn new(config: Arc<RelayConfig>) -> Self {
        Self {
            relay: Mutex::new(SignalRelay::new()),
            config,
        }
    }
}

/// Per-connection admission state
#[derive(Default)]
struct Connection {
    admission: Option<Admission>,
    /// Handed to the relay on successful handshake
    outbox: Option<mpsc::UnboundedSender<Notification>>,
}

/// What the read loop does after a frame
enum Flow {
    Continue,
    Close,
}

/// Handle a single WebSocket connection
pub async fn handle_connection(stream: TcpStream, state: Arc<SharedState>) -> WsResult<()> {
    let addr = stream.peer_addr()?;
    info!("New WebSocket connection from: {}", addr);

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_frame_size = Some(state.config.max_frame_size);
    ws_config.max_message_size = Some(state.config.max_frame_size);
    let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Direct replies (and the closing frame) for this connection
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Message>();
    // Relay notifications; the sender moves into the registry on admission
    let (note_tx, mut note_rx) = mpsc::unbounded_channel::<Notification>();

    let forward_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(msg) = reply_rx.recv() => msg,
                Some(note) = note_rx.recv() => match note.to_json() {
                    Ok(json) => Message::Text(json),
                    Err(e) => {
                        error!("Failed to encode notification: {}", e);
                        continue;
                    }
                },
                else => break,
            };
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = ws_tx.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
    });
    let forward_abort = forward_task.abort_handle();

    let mut conn = Connection {
        admission: None,
        outbox: Some(note_tx),
    };

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Flow::Close = handle_message(&text, &state, &mut conn, &reply_tx) {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                warn!("Ignoring binary frame from {}", addr);
            }
            Ok(Message::Ping(data)) => {
                let _ = reply_tx.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => {
                info!("WebSocket connection closed by client: {}", addr);
                break;
            }
            Err(e) => {
                error!("WebSocket error from {}: {}", addr, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect
    if let Some(admission) = conn.admission.take() {
        info!("Cleaning up peer: {}", admission.peer_id);
        state.relay.lock().disconnect(&admission);
    }
    drop(conn);
    drop(reply_tx);

    if tokio::time::timeout(FLUSH_GRACE, forward_task).await.is_err() {
        debug!("Forward task for {} did not drain in time", addr);
        forward_abort.abort();
    }

    Ok(())
}

/// Handle one JSON-RPC frame
fn handle_message(
    text: &str,
    state: &SharedState,
    conn: &mut Connection,
    reply: &mpsc::UnboundedSender<Message>,
) -> Flow {
    let request: JsonRpcRequest = match serde_json::from_str(text) {
        Ok(req) => req,
        Err(e) => {
            let error = JsonRpcError::new(
                error_codes::PARSE_ERROR,
                format!("Failed to parse JSON: {}", e),
                json!(null),
            );
            send_json(reply, error.to_json());
            return Flow::Continue;
        }
    };

    let id = request.id.clone();

    if request.jsonrpc != JSONRPC_VERSION {
        let error = JsonRpcError::new(
            error_codes::INVALID_REQUEST,
            format!("Invalid JSON-RPC version: {}", request.jsonrpc),
            id.unwrap_or(Value::Null),
        );
        send_json(reply, error.to_json());
        return Flow::Continue;
    }

    debug!("Received JSON-RPC request: method={}", request.method);

    let Some(admission) = conn.admission.clone() else {
        return handle_handshake(request, state, conn, reply);
    };

    let result = match request.method.as_str() {
        methods::CHANNEL => handle_channel(request.params, state, &admission.peer_id),
        methods::SIGNAL => handle_signal(request.params, state, &admission.peer_id),
        methods::PEER_LIST => Ok(json!({ "peers": state.relay.lock().peer_ids() })),
        methods::HANDSHAKE => Err(Error::Relay {
            code: error_codes::INVALID_REQUEST,
            message: format!("handshake already completed as '{}'", admission.peer_id),
        }),
        other => Err(Error::Relay {
            code: error_codes::METHOD_NOT_FOUND,
            message: format!("Method not found: {}", other),
        }),
    };

    // Notifications get no reply, successful or not
    let Some(id) = id else {
        if let Err(e) = result {
            debug!("Dropping error for notification from {}: {}", admission.peer_id, e);
        }
        return Flow::Continue;
    };

    match result {
        Ok(value) => send_json(reply, JsonRpcResponse::new(value, id).to_json()),
        Err(e) => {
            if e.is_routing_error() {
                debug!("Routing error for {}: {}", admission.peer_id, e);
            } else {
                warn!("Request from {} failed: {}", admission.peer_id, e);
            }
            send_json(reply, JsonRpcError::from_error(&e, id).to_json());
        }
    }
    Flow::Continue
}

/// First frame on a connection: admit or reject
fn handle_handshake(
    request: JsonRpcRequest,
    state: &SharedState,
    conn: &mut Connection,
    reply: &mpsc::UnboundedSender<Message>,
) -> Flow {
    let id = request.id.clone().unwrap_or(Value::Null);

    let admitted = if request.method == methods::HANDSHAKE {
        serde_json::from_value::<HandshakeParams>(request.params)
            .map_err(Error::from)
            .and_then(|params| {
                let outbox = conn
                    .outbox
                    .take()
                    .ok_or_else(|| Error::Session("connection outbox already used".to_string()))?;
                state.relay.lock().admit(&params.peer_id, outbox)
            })
    } else {
        Err(Error::HandshakeRequired(request.method.clone()))
    };

    match admitted {
        Ok(admission) => {
            send_json(
                reply,
                JsonRpcResponse::new(json!({ "peer_id": admission.peer_id }), id).to_json(),
            );
            conn.admission = Some(admission);
            Flow::Continue
        }
        Err(e) => {
            warn!("Handshake rejected: {}", e);
            let reason = e.to_string();
            send_json(reply, JsonRpcError::from_error(&e, id).to_json());
            let _ = reply.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: Cow::Owned(reason),
            })));
            Flow::Close
        }
    }
}

fn handle_channel(params: Value, state: &SharedState, peer_id: &PeerId) -> Result<Value> {
    let params: ChannelParams = serde_json::from_value(params)?;
    let outcome = state.relay.lock().join_channel(peer_id, &params.channel_id)?;
    Ok(json!({
        "channel_id": outcome.channel_id,
        "members": outcome.members,
    }))
}

fn handle_signal(params: Value, state: &SharedState, peer_id: &PeerId) -> Result<Value> {
    let params: SignalParams = serde_json::from_value(params)?;
    let (destination, payload) = match params {
        SignalParams::Peer { to, signal } => {
            // An id that cannot be registered cannot be connected either
            let to = PeerId::parse(to.clone()).map_err(|_| Error::UnknownReceiver(to))?;
            (Destination::Peer(to), signal)
        }
        SignalParams::Channel { channel_id, data } => {
            (Destination::Channel(ChannelId::parse(channel_id)?), data)
        }
    };
    let delivered = state.relay.lock().route(peer_id, &destination, payload)?;
    Ok(json!({ "delivered": delivered }))
}

fn send_json(reply: &mpsc::UnboundedSender<Message>, json: Result<String>) {
    match json {
        Ok(text) => {
            let _ = reply.send(Message::Text(text));
        }
        Err(e) => error!("Failed to encode reply: {}", e),
    }
}
