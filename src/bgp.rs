//! BGP update records as delivered by the (external) collection layer.
//!
//! Collectors normalize wire-level BGP messages into [`BgpUpdate`] values and
//! feed them into the fabric. The annotator attaches the matching
//! [`PrefixNode`](crate::policy::PrefixNode) to produce an annotated update;
//! the two states share one struct with an optional `prefix_node` field so
//! the wire format stays stable across the pipeline.

use crate::policy::PrefixNode;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An autonomous system number.
pub type Asn = u32;

/// A BGP community, as an `(asn, value)` pair.
pub type Community = (Asn, u32);

/// Announcement or withdrawal, using the single-letter wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateType {
    #[serde(rename = "A")]
    Announcement,
    #[serde(rename = "W")]
    Withdrawal,
}

/// A normalized BGP update.
///
/// `prefix_node` is `None` on the raw input streams and `Some` once the
/// annotator has resolved the update against the prefix index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BgpUpdate {
    /// Announced or withdrawn prefix.
    pub prefix: IpNet,

    /// Origin ASN as reported by the collector, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_asn: Option<Asn>,

    /// AS path, origin last. Empty for withdrawals.
    #[serde(default)]
    pub as_path: Vec<Asn>,

    /// Monitor peer that observed the update.
    pub peer_asn: Asn,

    /// Communities attached to the update.
    #[serde(default)]
    pub communities: BTreeSet<Community>,

    /// Monitor service that delivered the update (e.g. a route-collector
    /// project name).
    #[serde(default)]
    pub service: String,

    #[serde(rename = "type")]
    pub update_type: UpdateType,

    /// UNIX epoch seconds.
    pub timestamp: f64,

    /// Matching configuration node, attached by the annotator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_node: Option<PrefixNode>,
}

impl BgpUpdate {
    pub fn is_announcement(&self) -> bool {
        self.update_type == UpdateType::Announcement
    }

    /// Origin AS of the announcement: the rightmost entry of the AS path.
    pub fn origin(&self) -> Option<Asn> {
        self.as_path.last().copied()
    }

    /// AS immediately preceding the origin in the AS path.
    pub fn upstream(&self) -> Option<Asn> {
        if self.as_path.len() >= 2 {
            Some(self.as_path[self.as_path.len() - 2])
        } else {
            None
        }
    }
}
