//! In-process message fabric: named exchanges, queue bindings, routing keys.
//!
//! The pipeline's exchanges and routing keys follow the deployment's broker
//! naming so producers and consumers elsewhere in the system line up
//! bit-exactly. Inside one process the fabric is a set of bounded channels:
//! a queue is an mpsc receiver bound to an `(exchange, routing key)` pair,
//! and receiving a delivery is the acknowledgement (upstream delivery is
//! at-least-once, and consumers ack before republishing).
//!
//! Publishing to a routing key with no bound queue drops the message, like
//! an unrouted topic publish.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

// =============================================================================
// Exchange and routing-key names
// =============================================================================

/// BGP update exchange: raw updates in, annotated updates out.
pub const UPDATE_EXCHANGE: &str = "bgp-update";
/// Hijack event exchange: ongoing rescans in, event records out.
pub const HIJACK_EXCHANGE: &str = "hijack-update";
/// Mitigation exchange: requests in, actionable orders out.
pub const MITIGATION_EXCHANGE: &str = "mitigation";
/// Bridge exchange used by the storage service for stored-update replays.
pub const PG_AMQ_BRIDGE: &str = "amq.direct";
/// Control command exchange (`stop-<module>` routing keys).
pub const COMMAND_EXCHANGE: &str = "command";

pub mod routing {
    pub const UPDATE: &str = "update";
    pub const UPDATE_WITH_PREFIX_NODE: &str = "update-with-prefix-node";
    pub const STORED_UPDATE_WITH_PREFIX_NODE: &str = "stored-update-with-prefix-node";
    pub const UPDATE_INSERT: &str = "update-insert";
    pub const ONGOING: &str = "ongoing";
    pub const ONGOING_WITH_PREFIX_NODE: &str = "ongoing-with-prefix-node";
    pub const IGNORE: &str = "ignore";
    pub const MITIGATE: &str = "mitigate";
    pub const MITIGATE_WITH_ACTION: &str = "mitigate-with-action";

    /// Routing key of the stop command for a worker module.
    pub fn stop(module: &str) -> String {
        format!("stop-{module}")
    }
}

/// Per-queue buffer bound; limits memory under bursts and backpressures
/// slow consumers.
pub const PREFETCH_COUNT: usize = 100;

// =============================================================================
// Deliveries
// =============================================================================

/// Serializer tag carried with every delivery.
///
/// Both tags are JSON on the wire; `txtjson` marks JSON delivered as
/// `text/utf-8` by the storage bridge, which only the stored-replay queue
/// accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serializer {
    Ujson,
    Txtjson,
}

impl Serializer {
    pub fn content_type(&self) -> &'static str {
        match self {
            Serializer::Ujson => "application/json",
            Serializer::Txtjson => "text",
        }
    }
}

/// A serialized message in flight.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Vec<u8>,
    pub serializer: Serializer,
}

impl Delivery {
    pub fn encode<T: Serialize>(message: &T, serializer: Serializer) -> Result<Self> {
        let payload = serde_json::to_vec(message).context("serializing message")?;
        Ok(Self {
            payload,
            serializer,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).context("deserializing message")
    }
}

// =============================================================================
// Fabric
// =============================================================================

struct Binding {
    routing_key: String,
    accept: Vec<Serializer>,
    tx: mpsc::Sender<Delivery>,
}

/// The process-wide fabric handle. Cheap to share behind an `Arc`.
pub struct Fabric {
    exchanges: Mutex<HashMap<String, Vec<Binding>>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self {
            exchanges: Mutex::new(HashMap::new()),
        }
    }

    /// Declare a queue bound to `(exchange, routing_key)`, accepting the
    /// given serializer tags.
    pub fn queue(&self, exchange: &str, routing_key: &str, accept: &[Serializer]) -> Queue {
        let (tx, rx) = mpsc::channel(PREFETCH_COUNT);
        let mut exchanges = lock(&self.exchanges);
        exchanges
            .entry(exchange.to_string())
            .or_default()
            .push(Binding {
                routing_key: routing_key.to_string(),
                accept: accept.to_vec(),
                tx,
            });
        Queue {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            rx,
        }
    }

    /// Publish a message to every queue bound to `(exchange, routing_key)`
    /// that accepts the serializer. Waits for queue capacity rather than
    /// dropping under bursts.
    pub async fn publish<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        serializer: Serializer,
        message: &T,
    ) -> Result<()> {
        let delivery = Delivery::encode(message, serializer)?;
        let senders: Vec<mpsc::Sender<Delivery>> = {
            let mut exchanges = lock(&self.exchanges);
            let bindings = exchanges.entry(exchange.to_string()).or_default();
            bindings.retain(|binding| !binding.tx.is_closed());
            bindings
                .iter()
                .filter(|binding| {
                    binding.routing_key == routing_key && binding.accept.contains(&serializer)
                })
                .map(|binding| binding.tx.clone())
                .collect()
        };

        if senders.is_empty() {
            tracing::trace!(exchange, routing_key, "unrouted publish dropped");
            return Ok(());
        }
        for tx in senders {
            if tx.send(delivery.clone()).await.is_err() {
                tracing::debug!(exchange, routing_key, "queue consumer gone");
            }
        }
        Ok(())
    }
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A consumer handle for one bound queue.
pub struct Queue {
    exchange: String,
    routing_key: String,
    rx: mpsc::Receiver<Delivery>,
}

impl Queue {
    /// Receive the next delivery; `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    /// Decode the next delivery, logging and skipping malformed payloads.
    pub async fn recv_decoded<T: DeserializeOwned>(&mut self) -> Option<T> {
        loop {
            let delivery = self.rx.recv().await?;
            match delivery.decode() {
                Ok(message) => return Some(message),
                Err(error) => {
                    tracing::warn!(
                        exchange = %self.exchange,
                        routing_key = %self.routing_key,
                        %error,
                        "dropping malformed message"
                    );
                }
            }
        }
    }
}
