//! Annotator worker: resolves incoming updates against the prefix index.
//!
//! Four input streams feed the worker — live updates, stored-update
//! replays, ongoing-hijack rescans, and mitigation requests — plus the stop
//! command queue. Each message is matched with longest-prefix lookup against
//! a worker-local index copy, which is rebuilt from the shared registry
//! whenever a reconfiguration has been installed. Updates with no matching
//! configured prefix are dropped silently.

use crate::bgp::BgpUpdate;
use crate::detector::{MitigationOrder, MitigationRequest};
use crate::fabric::{
    routing, Delivery, Fabric, Queue, Serializer, COMMAND_EXCHANGE, HIJACK_EXCHANGE,
    MITIGATION_EXCHANGE, PG_AMQ_BRIDGE, UPDATE_EXCHANGE,
};
use crate::index::PrefixIndex;
use crate::policy::PrefixNode;
use crate::registry::SharedRegistry;
use anyhow::Result;
use ipnet::IpNet;
use std::sync::Arc;

/// Module name of the annotator worker, as used in command routing keys.
pub const MODULE_NAME: &str = "prefixtree";

/// The annotator's bound input queues. Declared at construction time so a
/// stop command published right after startup is never unrouted.
struct Inputs {
    updates: Queue,
    stored: Queue,
    ongoing: Queue,
    mitigations: Queue,
    stop: Queue,
}

/// The annotator data worker: one consume loop over its input queues.
pub struct Annotator {
    fabric: Arc<Fabric>,
    registry: Arc<SharedRegistry>,
    index: PrefixIndex,
    inputs: Option<Inputs>,
}

impl Annotator {
    pub fn new(fabric: Arc<Fabric>, registry: Arc<SharedRegistry>) -> Self {
        let mut index = PrefixIndex::new();
        registry.refresh_index(&mut index);
        let inputs = Inputs {
            updates: fabric.queue(UPDATE_EXCHANGE, routing::UPDATE, &[Serializer::Ujson]),
            stored: fabric.queue(
                PG_AMQ_BRIDGE,
                routing::UPDATE_INSERT,
                &[Serializer::Ujson, Serializer::Txtjson],
            ),
            ongoing: fabric.queue(HIJACK_EXCHANGE, routing::ONGOING, &[Serializer::Ujson]),
            mitigations: fabric.queue(
                MITIGATION_EXCHANGE,
                routing::MITIGATE,
                &[Serializer::Ujson],
            ),
            stop: fabric.queue(
                COMMAND_EXCHANGE,
                &routing::stop(MODULE_NAME),
                &[Serializer::Ujson],
            ),
        };
        Self {
            fabric,
            registry,
            index,
            inputs: Some(inputs),
        }
    }

    /// Run the consume loop until a stop command arrives or every input
    /// queue is gone.
    pub async fn run(mut self) -> Result<()> {
        let Some(mut inputs) = self.inputs.take() else {
            return Ok(());
        };
        tracing::info!(module = MODULE_NAME, "data worker started");

        let mut should_stop = false;
        while !should_stop {
            tokio::select! {
                Some(delivery) = inputs.updates.recv() => {
                    self.annotate_bgp_update(delivery).await;
                }
                Some(delivery) = inputs.stored.recv() => {
                    self.annotate_stored_bgp_update(delivery).await;
                }
                Some(delivery) = inputs.ongoing.recv() => {
                    self.annotate_ongoing_hijack_updates(delivery).await;
                }
                Some(delivery) = inputs.mitigations.recv() => {
                    self.annotate_mitigation_request(delivery).await;
                }
                Some(_) = inputs.stop.recv() => {
                    tracing::info!(module = MODULE_NAME, "stop command received");
                    should_stop = true;
                }
                else => break,
            }
        }
        tracing::info!(module = MODULE_NAME, "data worker stopped");
        Ok(())
    }

    /// Longest-prefix match against the local index copy, rebuilding it
    /// first when a reconfiguration has been installed.
    fn find_prefix_node(&mut self, prefix: &IpNet) -> Option<PrefixNode> {
        self.registry.refresh_index(&mut self.index);
        self.index.lookup(prefix).cloned()
    }

    async fn annotate_bgp_update(&mut self, delivery: Delivery) {
        let Some(mut update) = decode_update(&delivery) else {
            return;
        };
        if let Some(node) = self.find_prefix_node(&update.prefix) {
            update.prefix_node = Some(node);
            self.publish(
                UPDATE_EXCHANGE,
                routing::UPDATE_WITH_PREFIX_NODE,
                &update,
            )
            .await;
        }
    }

    async fn annotate_stored_bgp_update(&mut self, delivery: Delivery) {
        let Some(mut update) = decode_update(&delivery) else {
            return;
        };
        if let Some(node) = self.find_prefix_node(&update.prefix) {
            update.prefix_node = Some(node);
            self.publish(
                UPDATE_EXCHANGE,
                routing::STORED_UPDATE_WITH_PREFIX_NODE,
                &update,
            )
            .await;
        }
    }

    /// Rescan batches keep their full contents: updates without a match are
    /// passed through unannotated so downstream tallies stay complete.
    async fn annotate_ongoing_hijack_updates(&mut self, delivery: Delivery) {
        let mut updates: Vec<BgpUpdate> = match delivery.decode() {
            Ok(updates) => updates,
            Err(error) => {
                tracing::warn!(%error, "dropping malformed rescan batch");
                return;
            }
        };
        for update in &mut updates {
            if let Some(node) = self.find_prefix_node(&update.prefix) {
                update.prefix_node = Some(node);
            }
        }
        self.publish(
            HIJACK_EXCHANGE,
            routing::ONGOING_WITH_PREFIX_NODE,
            &updates,
        )
        .await;
    }

    /// Attach the mitigation action of the first matching rule; a prefix is
    /// not expected to carry conflicting actions across rules.
    async fn annotate_mitigation_request(&mut self, delivery: Delivery) {
        let request: MitigationRequest = match delivery.decode() {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!(%error, "dropping malformed mitigation request");
                return;
            }
        };
        if let Some(node) = self.find_prefix_node(&request.prefix) {
            let order = MitigationOrder {
                hijack_info: request,
                mitigation_action: node.mitigation().to_string(),
            };
            self.publish(
                MITIGATION_EXCHANGE,
                routing::MITIGATE_WITH_ACTION,
                &order,
            )
            .await;
        }
    }

    async fn publish<T: serde::Serialize>(&self, exchange: &str, routing_key: &str, message: &T) {
        if let Err(error) = self
            .fabric
            .publish(exchange, routing_key, Serializer::Ujson, message)
            .await
        {
            tracing::warn!(exchange, routing_key, %error, "publish failed");
        }
    }
}

fn decode_update(delivery: &Delivery) -> Option<BgpUpdate> {
    match delivery.decode() {
        Ok(update) => Some(update),
        Err(error) => {
            tracing::warn!(%error, "dropping malformed BGP update");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::UpdateType;
    use crate::policy::ConfigDoc;
    use std::collections::BTreeSet;

    fn configured_registry() -> Arc<SharedRegistry> {
        let registry = Arc::new(SharedRegistry::new());
        let doc: ConfigDoc = serde_json::from_value(serde_json::json!({
            "timestamp": 10,
            "rules": [{
                "prefixes": ["10.0.0.0/24"],
                "origin_asns": [65001],
                "neighbors": [65002],
                "mitigation": "deaggregate"
            }]
        }))
        .unwrap();
        registry.apply(&doc).unwrap();
        registry
    }

    fn update(prefix: &str) -> BgpUpdate {
        BgpUpdate {
            prefix: prefix.parse().unwrap(),
            origin_asn: Some(65001),
            as_path: vec![65002, 65001],
            peer_asn: 64901,
            communities: BTreeSet::new(),
            service: "ris".to_string(),
            update_type: UpdateType::Announcement,
            timestamp: 100.0,
            prefix_node: None,
        }
    }

    async fn stop_worker(fabric: &Fabric, task: tokio::task::JoinHandle<Result<()>>) {
        fabric
            .publish(
                COMMAND_EXCHANGE,
                &routing::stop(MODULE_NAME),
                Serializer::Ujson,
                &"",
            )
            .await
            .unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_annotates_matching_updates_in_order() {
        let fabric = Arc::new(Fabric::new());
        let registry = configured_registry();
        let mut annotated = fabric.queue(
            UPDATE_EXCHANGE,
            routing::UPDATE_WITH_PREFIX_NODE,
            &[Serializer::Ujson],
        );

        let worker = Annotator::new(fabric.clone(), registry);
        let task = tokio::spawn(worker.run());

        // a more-specific update, then an exact one; an unconfigured update
        // in between is dropped silently
        for prefix in ["10.0.0.128/25", "192.0.2.0/24", "10.0.0.0/24"] {
            fabric
                .publish(
                    UPDATE_EXCHANGE,
                    routing::UPDATE,
                    Serializer::Ujson,
                    &update(prefix),
                )
                .await
                .unwrap();
        }

        let first: BgpUpdate = annotated.recv_decoded().await.unwrap();
        assert_eq!(first.prefix.to_string(), "10.0.0.128/25");
        let node = first.prefix_node.unwrap();
        assert_eq!(node.prefix.to_string(), "10.0.0.0/24");
        assert!(node.confs[0].origin_asns.contains(&65001));

        let second: BgpUpdate = annotated.recv_decoded().await.unwrap();
        assert_eq!(second.prefix.to_string(), "10.0.0.0/24");

        stop_worker(&fabric, task).await;
    }

    #[tokio::test]
    async fn test_stored_replays_accept_txtjson() {
        let fabric = Arc::new(Fabric::new());
        let registry = configured_registry();
        let mut annotated = fabric.queue(
            UPDATE_EXCHANGE,
            routing::STORED_UPDATE_WITH_PREFIX_NODE,
            &[Serializer::Ujson],
        );

        let worker = Annotator::new(fabric.clone(), registry);
        let task = tokio::spawn(worker.run());

        fabric
            .publish(
                PG_AMQ_BRIDGE,
                routing::UPDATE_INSERT,
                Serializer::Txtjson,
                &update("10.0.0.0/24"),
            )
            .await
            .unwrap();

        let out: BgpUpdate = annotated.recv_decoded().await.unwrap();
        assert!(out.prefix_node.is_some());

        stop_worker(&fabric, task).await;
    }

    #[tokio::test]
    async fn test_rescan_batch_keeps_unmatched_updates() {
        let fabric = Arc::new(Fabric::new());
        let registry = configured_registry();
        let mut annotated = fabric.queue(
            HIJACK_EXCHANGE,
            routing::ONGOING_WITH_PREFIX_NODE,
            &[Serializer::Ujson],
        );

        let worker = Annotator::new(fabric.clone(), registry);
        let task = tokio::spawn(worker.run());

        let batch = vec![update("10.0.0.0/24"), update("192.0.2.0/24")];
        fabric
            .publish(HIJACK_EXCHANGE, routing::ONGOING, Serializer::Ujson, &batch)
            .await
            .unwrap();

        let out: Vec<BgpUpdate> = annotated.recv_decoded().await.unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].prefix_node.is_some());
        assert!(out[1].prefix_node.is_none());

        stop_worker(&fabric, task).await;
    }

    #[tokio::test]
    async fn test_mitigation_request_gets_first_rule_action() {
        let fabric = Arc::new(Fabric::new());
        let registry = configured_registry();
        let mut orders = fabric.queue(
            MITIGATION_EXCHANGE,
            routing::MITIGATE_WITH_ACTION,
            &[Serializer::Ujson],
        );

        let worker = Annotator::new(fabric.clone(), registry);
        let task = tokio::spawn(worker.run());

        let request = MitigationRequest {
            key: "abc".to_string(),
            prefix: "10.0.0.0/24".parse().unwrap(),
        };
        fabric
            .publish(
                MITIGATION_EXCHANGE,
                routing::MITIGATE,
                Serializer::Ujson,
                &request,
            )
            .await
            .unwrap();

        let order: MitigationOrder = orders.recv_decoded().await.unwrap();
        assert_eq!(order.mitigation_action, "deaggregate");
        assert_eq!(order.hijack_info.key, "abc");

        stop_worker(&fabric, task).await;
    }

    #[tokio::test]
    async fn test_reconfiguration_is_picked_up() {
        let fabric = Arc::new(Fabric::new());
        let registry = configured_registry();
        let mut annotated = fabric.queue(
            UPDATE_EXCHANGE,
            routing::UPDATE_WITH_PREFIX_NODE,
            &[Serializer::Ujson],
        );

        let worker = Annotator::new(fabric.clone(), registry.clone());
        let task = tokio::spawn(worker.run());

        // not configured yet: dropped
        fabric
            .publish(
                UPDATE_EXCHANGE,
                routing::UPDATE,
                Serializer::Ujson,
                &update("192.0.2.0/24"),
            )
            .await
            .unwrap();

        let doc: ConfigDoc = serde_json::from_value(serde_json::json!({
            "timestamp": 20,
            "rules": [{"prefixes": ["192.0.2.0/24"], "origin_asns": [65001], "neighbors": []}]
        }))
        .unwrap();
        registry.apply(&doc).unwrap();

        fabric
            .publish(
                UPDATE_EXCHANGE,
                routing::UPDATE,
                Serializer::Ujson,
                &update("192.0.2.0/24"),
            )
            .await
            .unwrap();

        let out: BgpUpdate = annotated.recv_decoded().await.unwrap();
        assert_eq!(out.prefix.to_string(), "192.0.2.0/24");
        assert_eq!(out.prefix_node.unwrap().timestamp, 20.0);

        stop_worker(&fabric, task).await;
    }
}
