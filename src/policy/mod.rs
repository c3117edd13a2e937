//! Prefix-ownership policy model.
//!
//! A configuration document declares, per rule, which origin ASes may
//! announce a set of prefixes, which neighbors they may announce through,
//! and which export policies apply. The compiler
//! ([`compiler`]) turns a document into an immutable prefix-to-rule index;
//! ASN-range and RFC 2622 prefix expansion live in [`expand`].

pub mod compiler;
pub mod expand;

use crate::bgp::{Asn, Community};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub use compiler::{compile, CompiledConfig};

/// Export policy labels understood by the detector.
pub const POLICY_NO_EXPORT: &str = "no-export";
pub const POLICY_NO_ADVERTISE: &str = "no-advertise";

/// Default mitigation label: events are escalated to an operator.
pub const MITIGATION_MANUAL: &str = "manual";

fn default_mitigation() -> String {
    MITIGATION_MANUAL.to_string()
}

/// Monitor-source name to monitor identifiers (route-collector projects,
/// peers).
pub type MonitorRoster = BTreeMap<String, Vec<String>>;

/// A named community pattern scoping an export policy.
///
/// The first annotation whose `include` communities are all present on an
/// update and whose `exclude` communities are all absent marks the update as
/// scope-compliant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityAnnotation {
    pub name: String,
    #[serde(default)]
    pub include: Vec<Community>,
    #[serde(default)]
    pub exclude: Vec<Community>,
}

/// The effective policy of one rule, with ASN ranges already expanded.
///
/// Immutable after compilation; a reconfiguration replaces every conf
/// wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConf {
    /// ASes allowed to originate the rule's prefixes. Empty means the
    /// prefixes must never be announced (squatting detection).
    pub origin_asns: BTreeSet<Asn>,

    /// ASes permitted immediately before the origin in the AS path. Empty
    /// means the first hop is unconstrained.
    pub neighbors: BTreeSet<Asn>,

    /// Expected trailing origin-prepend pattern, possibly empty.
    #[serde(default)]
    pub prepend_seq: Vec<Asn>,

    /// Export policies, e.g. `no-export`.
    #[serde(default)]
    pub policies: BTreeSet<String>,

    /// Community patterns scoping the export policies; first match wins.
    #[serde(default)]
    pub community_annotations: Vec<CommunityAnnotation>,

    /// Mitigation label attached to events for these prefixes.
    #[serde(default = "default_mitigation")]
    pub mitigation: String,
}

impl RuleConf {
    /// True when the conf carries no AS-path requirements beyond the origin.
    pub fn path_unconstrained(&self) -> bool {
        self.neighbors.is_empty() && self.prepend_seq.is_empty()
    }
}

/// A prefix with every rule that applies to it, in configuration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefixNode {
    pub prefix: IpNet,
    pub confs: Vec<RuleConf>,
    /// Timestamp of the configuration that produced this node.
    pub timestamp: f64,
}

impl PrefixNode {
    /// True when no rule lists any legitimate origin: the prefix is declared
    /// as never-to-be-announced.
    pub fn is_squat(&self) -> bool {
        self.confs.iter().all(|conf| conf.origin_asns.is_empty())
    }

    /// Mitigation of the first rule; the first rule wins when multiple rules
    /// apply to the same prefix.
    pub fn mitigation(&self) -> &str {
        self.confs
            .first()
            .map(|conf| conf.mitigation.as_str())
            .unwrap_or(MITIGATION_MANUAL)
    }
}

/// An ASN as written in a configuration document: a plain number, a numeric
/// string, or an `A-B` range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AsnExpr {
    Asn(Asn),
    Expr(String),
}

/// One rule as written in a configuration document, before expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Prefixes, optionally carrying RFC 2622 length qualifiers
    /// (`^+`, `^-`, `^n`, `^n-m`).
    #[serde(default)]
    pub prefixes: Vec<String>,

    #[serde(default)]
    pub origin_asns: Vec<AsnExpr>,

    #[serde(default)]
    pub neighbors: Vec<AsnExpr>,

    #[serde(default)]
    pub prepend_seq: Vec<Asn>,

    #[serde(default)]
    pub policies: Vec<String>,

    #[serde(default)]
    pub community_annotations: Vec<CommunityAnnotation>,

    #[serde(default = "default_mitigation")]
    pub mitigation: String,
}

/// A full configuration document, as POSTed to `/config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDoc {
    /// UNIX epoch seconds; documents with non-increasing timestamps are
    /// no-ops.
    pub timestamp: f64,

    #[serde(default)]
    pub rules: Vec<RuleSpec>,

    #[serde(default)]
    pub monitors: MonitorRoster,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_conf_defaults() {
        let conf: RuleConf = serde_json::from_str(
            r#"{"origin_asns": [65001], "neighbors": []}"#,
        )
        .unwrap();
        assert_eq!(conf.mitigation, MITIGATION_MANUAL);
        assert!(conf.prepend_seq.is_empty());
        assert!(conf.path_unconstrained());
    }

    #[test]
    fn test_asn_expr_forms() {
        let spec: RuleSpec = serde_json::from_str(
            r#"{"prefixes": ["10.0.0.0/24"], "origin_asns": [65001, "65010-65012"]}"#,
        )
        .unwrap();
        assert_eq!(
            spec.origin_asns,
            vec![
                AsnExpr::Asn(65001),
                AsnExpr::Expr("65010-65012".to_string())
            ]
        );
    }

    #[test]
    fn test_prefix_node_first_rule_mitigation() {
        let first: RuleConf = serde_json::from_str(
            r#"{"origin_asns": [1], "neighbors": [], "mitigation": "deaggregate"}"#,
        )
        .unwrap();
        let second: RuleConf =
            serde_json::from_str(r#"{"origin_asns": [2], "neighbors": []}"#).unwrap();
        let node = PrefixNode {
            prefix: "10.0.0.0/24".parse().unwrap(),
            confs: vec![first, second],
            timestamp: 1.0,
        };
        assert_eq!(node.mitigation(), "deaggregate");
        assert!(!node.is_squat());
    }

    #[test]
    fn test_config_doc_from_json() {
        let doc: ConfigDoc = serde_json::from_str(
            r#"{
                "timestamp": 10,
                "rules": [{
                    "prefixes": ["10.0.0.0/24"],
                    "origin_asns": [65001],
                    "neighbors": [65002],
                    "policies": ["no-export"]
                }],
                "monitors": {"riperis": [""], "bgpstreamlive": ["routeviews", "ris"]}
            }"#,
        )
        .unwrap();
        assert_eq!(doc.rules.len(), 1);
        assert_eq!(doc.monitors.len(), 2);
        assert_eq!(doc.rules[0].policies, vec![POLICY_NO_EXPORT.to_string()]);
    }
}
