//! FIFO of outbound payloads with high-watermark backpressure
//!
//! Entries are validated before they are queued. A single drain task moves
//! them to the data channel strictly in order: the head waits (bounded) for
//! the channel to open, is deferred while the transport buffer is too full,
//! and is never overtaken by later entries.

use crate::config::SessionConfig;
use crate::payload::{validate_message, Payload};
use crate::peer::capability::{DataChannel, DataChannelState};
use crate::poll::wait_until;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Slot holding the session's data channel once it exists
pub type ChannelSlot = Arc<RwLock<Option<Arc<dyn DataChannel>>>>;

/// Drain timing and limits
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub high_watermark: usize,
    pub max_message_size: usize,
    pub retry_delay: Duration,
    pub open_timeout: Duration,
    pub poll_interval: Duration,
}

impl From<&SessionConfig> for QueueSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            high_watermark: config.high_watermark,
            max_message_size: config.max_message_size,
            retry_delay: config.backpressure_retry_delay,
            open_timeout: config.channel_open_timeout,
            poll_interval: config.poll_interval,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

/// A pending outbound payload
struct QueueEntry {
    payload: Payload,
    byte_length: usize,
    completion: oneshot::Sender<Result<()>>,
}

/// Why a drain pass stopped
enum DrainEnd {
    Empty,
    Failed,
}

struct QueueInner {
    entries: Mutex<VecDeque<QueueEntry>>,
    draining: AtomicBool,
    closed: AtomicBool,
    slot: ChannelSlot,
    settings: QueueSettings,
}

/// Ordered outbound queue for one data channel
#[derive(Clone)]
pub struct SendQueue {
    inner: Arc<QueueInner>,
}

impl SendQueue {
    pub fn new(slot: ChannelSlot, settings: QueueSettings) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                entries: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                slot,
                settings,
            }),
        }
    }

    /// Validate, enqueue, and wait for the payload to be handed to the transport
    ///
    /// Oversized payloads are rejected before anything is queued.
    pub async fn send_async(&self, payload: Payload) -> Result<()> {
        let byte_length = validate_message(&payload, self.inner.settings.max_message_size)?;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }

        let (completion, done) = oneshot::channel();
        self.inner.entries.lock().push_back(QueueEntry {
            payload,
            byte_length,
            completion,
        });
        self.trigger_drain();

        done.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Start a drain pass unless one is already running
    pub fn trigger_drain(&self) {
        QueueInner::trigger(&self.inner);
    }

    /// Number of entries not yet handed to the transport
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail every queued entry with "channel closed" and refuse new ones
    pub fn close_all(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let pending: Vec<QueueEntry> = self.inner.entries.lock().drain(..).collect();
        if !pending.is_empty() {
            debug!("Failing {} queued entries: channel closed", pending.len());
        }
        for entry in pending {
            let _ = entry.completion.send(Err(Error::ChannelClosed));
        }
    }
}

impl QueueInner {
    fn trigger(this: &Arc<Self>) {
        if this.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            let end = inner.drain().await;
            inner.draining.store(false, Ordering::SeqCst);
            // An entry may have been appended after the last empty check
            if matches!(end, DrainEnd::Empty) && !inner.entries.lock().is_empty() {
                QueueInner::trigger(&inner);
            }
        });
    }

    fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.slot
            .read()
            .as_ref()
            .filter(|channel| channel.ready_state() == DataChannelState::Open)
            .cloned()
    }

    fn fail_head(&self, error: Error) {
        if let Some(entry) = self.entries.lock().pop_front() {
            let _ = entry.completion.send(Err(error));
        }
    }

    async fn drain(&self) -> DrainEnd {
        loop {
            let Some(byte_length) = self.entries.lock().front().map(|e| e.byte_length) else {
                return DrainEnd::Empty;
            };

            let ready = wait_until(
                "data channel open",
                self.settings.poll_interval,
                self.settings.open_timeout,
                || {
                    let open = self.open_channel().is_some();
                    async move { open }
                },
            )
            .await;
            let channel = match ready.ok().and_then(|_| self.open_channel()) {
                Some(channel) => channel,
                None => {
                    warn!("Data channel not open, failing queued send");
                    self.fail_head(Error::ChannelNotOpen);
                    return DrainEnd::Failed;
                }
            };

            let buffered = channel.buffered_amount().await;
            if buffered + byte_length >= self.settings.high_watermark {
                debug!(
                    "Backpressure: {} buffered + {} >= {}, retrying in {:?}",
                    buffered, byte_length, self.settings.high_watermark, self.settings.retry_delay
                );
                tokio::time::sleep(self.settings.retry_delay).await;
                continue;
            }

            let Some(entry) = self.entries.lock().pop_front() else {
                return DrainEnd::Empty;
            };
            match channel.send(&entry.payload).await {
                Ok(_) => {
                    let _ = entry.completion.send(Ok(()));
                }
                Err(e) => {
                    warn!("Data channel send failed: {}", e);
                    let error = if matches!(e, Error::TransportSend(_) | Error::ChannelNotOpen) {
                        e
                    } else {
                        Error::TransportSend(e.to_string())
                    };
                    let _ = entry.completion.send(Err(error));
                    return DrainEnd::Failed;
                }
            }
        }
    }
}
