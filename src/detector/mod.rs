//! Hijack detector worker.
//!
//! Consumes annotated updates, classifies each against its attached rule
//! node, and maintains hijack events. New and updated event records go out
//! on the hijack-update exchange; a freshly created event whose first rule
//! configures a non-manual mitigation also emits a mitigation request.

pub mod classify;
pub mod events;

pub use classify::{classify, Classification, PathDim, PolicyDim, PrefixDim, TypeTuple};
pub use events::{
    event_key, EventStore, HijackEvent, HijackState, IgnoreRequest, MitigationOrder,
    MitigationRequest,
};

use crate::bgp::BgpUpdate;
use crate::fabric::{
    routing, Fabric, Queue, Serializer, COMMAND_EXCHANGE, HIJACK_EXCHANGE, MITIGATION_EXCHANGE,
    UPDATE_EXCHANGE,
};
use crate::policy::MITIGATION_MANUAL;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Module name of the detector worker, as used in command routing keys.
pub const MODULE_NAME: &str = "detection";

/// How often open events are checked against the outdated horizon.
const EXPIRY_TICK: Duration = Duration::from_secs(60);

fn now_epoch() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// The detector's bound input queues. Declared at construction time so a
/// stop command published right after startup is never unrouted.
struct Inputs {
    live: Queue,
    stored: Queue,
    rescans: Queue,
    ignores: Queue,
    stop: Queue,
}

/// The detector data worker: one consume loop over its input queues.
pub struct Detector {
    fabric: Arc<Fabric>,
    store: EventStore,
    outdated_horizon_secs: u64,
    inputs: Option<Inputs>,
}

impl Detector {
    pub fn new(fabric: Arc<Fabric>, outdated_horizon_secs: u64) -> Self {
        let inputs = Inputs {
            live: fabric.queue(
                UPDATE_EXCHANGE,
                routing::UPDATE_WITH_PREFIX_NODE,
                &[Serializer::Ujson],
            ),
            stored: fabric.queue(
                UPDATE_EXCHANGE,
                routing::STORED_UPDATE_WITH_PREFIX_NODE,
                &[Serializer::Ujson],
            ),
            rescans: fabric.queue(
                HIJACK_EXCHANGE,
                routing::ONGOING_WITH_PREFIX_NODE,
                &[Serializer::Ujson],
            ),
            ignores: fabric.queue(HIJACK_EXCHANGE, routing::IGNORE, &[Serializer::Ujson]),
            stop: fabric.queue(
                COMMAND_EXCHANGE,
                &routing::stop(MODULE_NAME),
                &[Serializer::Ujson],
            ),
        };
        Self {
            fabric,
            store: EventStore::new(),
            outdated_horizon_secs,
            inputs: Some(inputs),
        }
    }

    /// Run the consume loop until a stop command arrives or every input
    /// queue is gone.
    pub async fn run(mut self) -> Result<()> {
        let Some(mut inputs) = self.inputs.take() else {
            return Ok(());
        };
        let mut expiry = tokio::time::interval(EXPIRY_TICK);
        expiry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(module = MODULE_NAME, "data worker started");

        let mut should_stop = false;
        while !should_stop {
            tokio::select! {
                Some(update) = inputs.live.recv_decoded::<BgpUpdate>() => {
                    self.handle_update(update).await;
                }
                Some(update) = inputs.stored.recv_decoded::<BgpUpdate>() => {
                    self.handle_update(update).await;
                }
                Some(batch) = inputs.rescans.recv_decoded::<Vec<BgpUpdate>>() => {
                    for update in batch {
                        self.handle_update(update).await;
                    }
                }
                Some(request) = inputs.ignores.recv_decoded::<IgnoreRequest>() => {
                    self.handle_ignore(request).await;
                }
                Some(_) = inputs.stop.recv() => {
                    tracing::info!(module = MODULE_NAME, "stop command received");
                    should_stop = true;
                }
                _ = expiry.tick() => {
                    self.expire_outdated().await;
                }
                else => break,
            }
        }
        tracing::info!(module = MODULE_NAME, "data worker stopped");
        Ok(())
    }

    async fn handle_update(&mut self, update: BgpUpdate) {
        let Some(node) = update.prefix_node.clone() else {
            tracing::warn!(prefix = %update.prefix, "dropping update without prefix node");
            return;
        };

        if !update.is_announcement() {
            for event in self
                .store
                .withdraw(&update.prefix, update.peer_asn, update.timestamp)
            {
                self.publish_event(&event).await;
            }
            return;
        }

        if update.as_path.is_empty() {
            tracing::warn!(prefix = %update.prefix, "dropping announcement with empty AS path");
            return;
        }

        let Some(classification) = classify(&update, &node) else {
            return;
        };
        let (event, created) = self.store.upsert(&update, &classification, &node);
        tracing::info!(
            key = %event.key,
            hijack_type = %event.hijack_type,
            prefix = %event.prefix,
            created,
            "hijack event"
        );
        self.publish_event(&event).await;

        if created && event.rule_mitigation != MITIGATION_MANUAL {
            let request = MitigationRequest {
                key: event.key.clone(),
                prefix: event.prefix,
            };
            if let Err(error) = self
                .fabric
                .publish(
                    MITIGATION_EXCHANGE,
                    routing::MITIGATE,
                    Serializer::Ujson,
                    &request,
                )
                .await
            {
                tracing::warn!(%error, "failed to publish mitigation request");
            }
        }
    }

    async fn handle_ignore(&mut self, request: IgnoreRequest) {
        match self.store.ignore(&request.key) {
            Some(event) => self.publish_event(&event).await,
            None => tracing::warn!(key = %request.key, "ignore for unknown or closed event"),
        }
    }

    async fn expire_outdated(&mut self) {
        for event in self.store.expire(self.outdated_horizon_secs, now_epoch()) {
            tracing::info!(key = %event.key, "hijack event outdated");
            self.publish_event(&event).await;
        }
    }

    async fn publish_event(&self, event: &HijackEvent) {
        if let Err(error) = self
            .fabric
            .publish(
                HIJACK_EXCHANGE,
                routing::UPDATE,
                Serializer::Ujson,
                event,
            )
            .await
        {
            tracing::warn!(%error, "failed to publish hijack event");
        }
    }
}
