//! Message bus: named channels carrying serialized [`BusRecord`]s between worker units.
//!
//! Each unit owns three channels derived from its name: `<name>.inbound`, `<name>.outbound`
//! and `<name>.event`. A channel is a single queue; every subscriber of the same channel
//! competes for records, so a restarted unit resumes from whatever is still queued.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::message::{BusRecord, EnvelopeError};

pub const INBOUND_SUFFIX: &str = ".inbound";
pub const OUTBOUND_SUFFIX: &str = ".outbound";
pub const EVENT_SUFFIX: &str = ".event";

/// Channel metrics batches are published on.
pub const METRICS_CHANNEL: &str = "courier.metrics";

const DEFAULT_CAPACITY: usize = 256;
const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

pub fn inbound_channel(unit: &str) -> String {
    format!("{}{}", unit, INBOUND_SUFFIX)
}

pub fn outbound_channel(unit: &str) -> String {
    format!("{}{}", unit, OUTBOUND_SUFFIX)
}

pub fn event_channel(unit: &str) -> String {
    format!("{}{}", unit, EVENT_SUFFIX)
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("channel {0} is closed")]
    Closed(String),
    #[error("channel {channel} did not accept the record within {timeout:?}")]
    Timeout { channel: String, timeout: Duration },
    #[error("encoding record for {channel}: {source}")]
    Encode {
        channel: String,
        #[source]
        source: EnvelopeError,
    },
}

/// Transport between units. Publishing enqueues and returns; it only waits while the
/// destination queue is full, up to the bus's publish timeout.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, channel: &str, record: &BusRecord) -> Result<(), DeliveryError>;

    async fn subscribe(&self, channel: &str) -> Subscription;

    /// Whether records taken by a unit that fails are handed to the next subscriber.
    fn supports_redelivery(&self) -> bool {
        false
    }
}

/// Receiving end of a channel. Clones share the same queue.
#[derive(Clone)]
pub struct Subscription {
    channel: String,
    rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next record. `None` once the channel is closed and drained.
    pub async fn recv(&self) -> Option<Result<BusRecord, EnvelopeError>> {
        let bytes = self.rx.lock().await.recv().await?;
        Some(BusRecord::from_wire(&bytes))
    }

    /// Take a queued record without waiting.
    pub fn try_recv(&self) -> Option<Result<BusRecord, EnvelopeError>> {
        let mut rx = self.rx.try_lock().ok()?;
        match rx.try_recv() {
            Ok(bytes) => Some(BusRecord::from_wire(&bytes)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

struct LocalChannel {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
}

/// In-process bus: one bounded tokio queue per channel, created on first use.
/// Records are serialized on publish and decoded on receipt, as on a networked bus.
pub struct LocalBus {
    capacity: usize,
    publish_timeout: Duration,
    channels: RwLock<HashMap<String, LocalChannel>>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_PUBLISH_TIMEOUT)
    }
}

impl LocalBus {
    pub fn new(capacity: usize, publish_timeout: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            publish_timeout,
            channels: RwLock::new(HashMap::new()),
        }
    }

    async fn sender(&self, channel: &str) -> mpsc::Sender<Vec<u8>> {
        if let Some(c) = self.channels.read().await.get(channel) {
            return c.tx.clone();
        }
        self.open(channel).await.0
    }

    async fn open(&self, channel: &str) -> (mpsc::Sender<Vec<u8>>, Arc<Mutex<mpsc::Receiver<Vec<u8>>>>) {
        let mut channels = self.channels.write().await;
        let entry = channels.entry(channel.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.capacity);
            LocalChannel {
                tx,
                rx: Arc::new(Mutex::new(rx)),
            }
        });
        (entry.tx.clone(), entry.rx.clone())
    }

    /// Number of records waiting on a channel.
    pub async fn queued(&self, channel: &str) -> usize {
        match self.channels.read().await.get(channel) {
            Some(c) => c.tx.max_capacity() - c.tx.capacity(),
            None => 0,
        }
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, channel: &str, record: &BusRecord) -> Result<(), DeliveryError> {
        let bytes = record.to_wire().map_err(|source| DeliveryError::Encode {
            channel: channel.to_string(),
            source,
        })?;
        let tx = self.sender(channel).await;
        tx.send_timeout(bytes, self.publish_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => DeliveryError::Timeout {
                    channel: channel.to_string(),
                    timeout: self.publish_timeout,
                },
                SendTimeoutError::Closed(_) => DeliveryError::Closed(channel.to_string()),
            })
    }

    async fn subscribe(&self, channel: &str) -> Subscription {
        let (_, rx) = self.open(channel).await;
        Subscription::new(channel, rx)
    }
}
