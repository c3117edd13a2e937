//! Hijack event records and the in-memory upsert store.
//!
//! Events are identified by a stable fingerprint over
//! `(prefix, type, hijacker, configured prefix)`; repeated observations of
//! the same incident merge into one record. Resolution, operator ignores,
//! and age-based expiry are terminal.

use super::classify::{Classification, TypeTuple};
use crate::bgp::{Asn, BgpUpdate};
use crate::policy::PrefixNode;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Lifecycle of a hijack event. `Ongoing` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HijackState {
    Ongoing,
    /// Every announcing peer has withdrawn the offending route.
    Resolved,
    /// An operator dismissed the event.
    Ignored,
    /// No observation within the configured horizon.
    Outdated,
}

/// One detected hijack incident, updated over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HijackEvent {
    pub key: String,

    #[serde(rename = "type")]
    pub hijack_type: TypeTuple,

    /// Offending announced prefix.
    pub prefix: IpNet,

    pub hijacker_asn: Option<Asn>,

    /// The configured prefix whose rules the announcement violated.
    pub configured_prefix: IpNet,

    /// First and latest observation, UNIX epoch seconds.
    pub time_started: f64,
    pub time_last: f64,

    /// Monitor peers currently announcing the offending route.
    pub peer_asns_seen: BTreeSet<Asn>,
    pub num_peers_seen: usize,

    /// ASes inferred to route toward the hijacker.
    pub asns_inf: BTreeSet<Asn>,
    pub num_asns_inf: usize,

    /// Mitigation label from the first matching rule.
    pub rule_mitigation: String,

    pub state: HijackState,
}

/// A mitigation request emitted when an event with a non-manual mitigation
/// label is created. The annotator resolves it into an actionable order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MitigationRequest {
    pub key: String,
    pub prefix: IpNet,
}

/// A mitigation request annotated with the configured action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MitigationOrder {
    pub hijack_info: MitigationRequest,
    pub mitigation_action: String,
}

/// An operator instruction to dismiss an open event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IgnoreRequest {
    pub key: String,
}

/// Stable fingerprint of an incident.
pub fn event_key(
    prefix: &IpNet,
    hijack_type: &TypeTuple,
    hijacker_asn: Option<Asn>,
    configured_prefix: &IpNet,
) -> String {
    let hijacker = match hijacker_asn {
        Some(asn) => asn.to_string(),
        None => "-".to_string(),
    };
    let fingerprint = format!("{prefix}|{hijack_type}|{hijacker}|{configured_prefix}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, fingerprint.as_bytes())
        .simple()
        .to_string()
}

/// In-memory store of hijack events keyed by fingerprint.
#[derive(Default)]
pub struct EventStore {
    events: HashMap<String, HijackEvent>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an observation into its event, creating the event if no open
    /// one exists. A terminal event under the same key is replaced by a
    /// fresh ongoing one. Returns the post-merge record and whether it was
    /// newly created.
    pub fn upsert(
        &mut self,
        update: &BgpUpdate,
        classification: &Classification,
        node: &PrefixNode,
    ) -> (HijackEvent, bool) {
        let prefix = update.prefix.trunc();
        let key = event_key(
            &prefix,
            &classification.hijack_type,
            classification.hijacker_asn,
            &node.prefix,
        );

        if let Some(event) = self
            .events
            .get_mut(&key)
            .filter(|event| event.state == HijackState::Ongoing)
        {
            event.time_last = event.time_last.max(update.timestamp);
            event.peer_asns_seen.insert(update.peer_asn);
            event.asns_inf.extend(classification.asns_inf.iter().copied());
            event.num_peers_seen = event.peer_asns_seen.len();
            event.num_asns_inf = event.asns_inf.len();
            return (event.clone(), false);
        }

        let event = HijackEvent {
            key: key.clone(),
            hijack_type: classification.hijack_type,
            prefix,
            hijacker_asn: classification.hijacker_asn,
            configured_prefix: node.prefix,
            time_started: update.timestamp,
            time_last: update.timestamp,
            peer_asns_seen: BTreeSet::from([update.peer_asn]),
            num_peers_seen: 1,
            asns_inf: classification.asns_inf.clone(),
            num_asns_inf: classification.asns_inf.len(),
            rule_mitigation: node.mitigation().to_string(),
            state: HijackState::Ongoing,
        };
        self.events.insert(key, event.clone());
        (event, true)
    }

    /// Apply a withdrawal: the peer stops announcing the prefix, and an
    /// event whose last announcing peer withdrew resolves. Returns every
    /// event the withdrawal changed.
    pub fn withdraw(&mut self, prefix: &IpNet, peer_asn: Asn, timestamp: f64) -> Vec<HijackEvent> {
        let prefix = prefix.trunc();
        let mut changed = Vec::new();
        for event in self.events.values_mut() {
            if event.state != HijackState::Ongoing || event.prefix != prefix {
                continue;
            }
            if !event.peer_asns_seen.remove(&peer_asn) {
                continue;
            }
            event.num_peers_seen = event.peer_asns_seen.len();
            event.time_last = event.time_last.max(timestamp);
            if event.peer_asns_seen.is_empty() {
                event.state = HijackState::Resolved;
            }
            changed.push(event.clone());
        }
        changed
    }

    /// Operator dismissal of an open event.
    pub fn ignore(&mut self, key: &str) -> Option<HijackEvent> {
        let event = self
            .events
            .get_mut(key)
            .filter(|event| event.state == HijackState::Ongoing)?;
        event.state = HijackState::Ignored;
        Some(event.clone())
    }

    /// Expire open events not observed within `horizon_secs`.
    pub fn expire(&mut self, horizon_secs: u64, now: f64) -> Vec<HijackEvent> {
        let mut expired = Vec::new();
        for event in self.events.values_mut() {
            if event.state == HijackState::Ongoing
                && now - event.time_last > horizon_secs as f64
            {
                event.state = HijackState::Outdated;
                expired.push(event.clone());
            }
        }
        expired
    }

    pub fn get(&self, key: &str) -> Option<&HijackEvent> {
        self.events.get(key)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn ongoing_count(&self) -> usize {
        self.events
            .values()
            .filter(|event| event.state == HijackState::Ongoing)
            .count()
    }
}
