//! Hijack classification.
//!
//! Every annotated announcement is evaluated along four independent
//! dimensions — prefix, AS-path, data plane, policy — and the resulting
//! tuple names the hijack type (`E|0|-|-`, `S|1|-|-`, ...). The data-plane
//! dimension is reserved for active probing and always reads `-` here.

use crate::bgp::{Asn, BgpUpdate};
use crate::policy::{PrefixNode, RuleConf, POLICY_NO_EXPORT};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Dimensions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrefixDim {
    /// The announced prefix is configured exactly.
    Exact,
    /// The announced prefix is strictly more specific than the configured
    /// enclosing prefix.
    SubPrefix,
    /// The enclosing prefix is configured with no legitimate origins at all.
    Squatting,
    Unset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathDim {
    /// Illegitimate origin AS (type-0).
    Origin,
    /// Legitimate origin behind an unexpected first hop (type-1).
    FirstHop,
    /// Origin and first hop legitimate, but the trailing path does not end
    /// in the expected prepend pattern.
    Prepend,
    /// The matched rule carries no path constraints; nothing to verify.
    Unconstrained,
    Unset,
}

impl PathDim {
    /// Whether this value marks an actual path violation. `U` is
    /// informational.
    pub fn is_violation(&self) -> bool {
        matches!(self, PathDim::Origin | PathDim::FirstHop | PathDim::Prepend)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataPlaneDim {
    Unset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyDim {
    /// The update escaped the scope encoded by the rule's export policy.
    Leak,
    Unset,
}

// =============================================================================
// Type tuple
// =============================================================================

/// The four-dimensional hijack type, rendered `P|A|D|L` on the wire
/// (for example `E|0|-|-` for an origin hijack of an exactly-configured
/// prefix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTuple {
    pub prefix: PrefixDim,
    pub path: PathDim,
    pub data_plane: DataPlaneDim,
    pub policy: PolicyDim,
}

impl fmt::Display for TypeTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.prefix {
            PrefixDim::Exact => "E",
            PrefixDim::SubPrefix => "S",
            PrefixDim::Squatting => "Q",
            PrefixDim::Unset => "-",
        };
        let path = match self.path {
            PathDim::Origin => "0",
            PathDim::FirstHop => "1",
            PathDim::Prepend => "P",
            PathDim::Unconstrained => "U",
            PathDim::Unset => "-",
        };
        let policy = match self.policy {
            PolicyDim::Leak => "L",
            PolicyDim::Unset => "-",
        };
        write!(f, "{prefix}|{path}|-|{policy}")
    }
}

impl FromStr for TypeTuple {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = text.split('|').collect();
        let [prefix, path, data_plane, policy] = parts.as_slice() else {
            return Err(format!("invalid hijack type '{text}'"));
        };
        let prefix = match *prefix {
            "E" => PrefixDim::Exact,
            "S" => PrefixDim::SubPrefix,
            "Q" => PrefixDim::Squatting,
            "-" => PrefixDim::Unset,
            other => return Err(format!("invalid prefix dimension '{other}'")),
        };
        let path = match *path {
            "0" => PathDim::Origin,
            "1" => PathDim::FirstHop,
            "P" => PathDim::Prepend,
            "U" => PathDim::Unconstrained,
            "-" => PathDim::Unset,
            other => return Err(format!("invalid path dimension '{other}'")),
        };
        if *data_plane != "-" {
            return Err(format!("invalid data-plane dimension '{data_plane}'"));
        }
        let policy = match *policy {
            "L" => PolicyDim::Leak,
            "-" => PolicyDim::Unset,
            other => return Err(format!("invalid policy dimension '{other}'")),
        };
        Ok(Self {
            prefix,
            path,
            data_plane: DataPlaneDim::Unset,
            policy,
        })
    }
}

impl Serialize for TypeTuple {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TypeTuple {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Classification
// =============================================================================

/// The outcome of classifying one announcement against its rule node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub hijack_type: TypeTuple,
    /// Origin for type-0, first hop for type-1, unknown otherwise.
    pub hijacker_asn: Option<Asn>,
    /// ASes inferred to route toward the hijacker: the AS path minus its
    /// trusted tail.
    pub asns_inf: BTreeSet<Asn>,
}

struct ConfEval {
    path: PathDim,
    policy: PolicyDim,
}

impl ConfEval {
    fn satisfied(&self) -> bool {
        !self.path.is_violation() && self.policy == PolicyDim::Unset
    }
}

/// Classify an announcement. Returns `None` when the update is legitimate
/// under at least one applicable rule (or carries nothing to evaluate).
///
/// Rules are evaluated in configuration order; when none legitimizes the
/// update, the first rule's evaluation is the one reported.
pub fn classify(update: &BgpUpdate, node: &PrefixNode) -> Option<Classification> {
    let origin = update.origin()?;
    if node.confs.is_empty() {
        return None;
    }

    let prefix_dim = if node.is_squat() {
        PrefixDim::Squatting
    } else if update.prefix.trunc() == node.prefix {
        PrefixDim::Exact
    } else {
        PrefixDim::SubPrefix
    };

    let evals: Vec<ConfEval> = node
        .confs
        .iter()
        .map(|conf| ConfEval {
            path: eval_path(update, conf, origin),
            policy: eval_policy(update, conf),
        })
        .collect();

    let chosen = match prefix_dim {
        PrefixDim::Exact => {
            if evals.iter().any(ConfEval::satisfied) {
                return None;
            }
            &evals[0]
        }
        // sub-prefix and squatting announcements are hijacks regardless of
        // the path, but a satisfied rule still shapes the reported path
        // dimension
        _ => evals
            .iter()
            .find(|eval| eval.satisfied())
            .unwrap_or(&evals[0]),
    };

    // a pure policy leak on an exactly-configured prefix reports neither a
    // prefix nor a path dimension
    let (prefix_dim, path_dim) = if prefix_dim == PrefixDim::Exact && !chosen.path.is_violation() {
        (PrefixDim::Unset, PathDim::Unset)
    } else {
        (prefix_dim, chosen.path)
    };

    let hijacker_asn = match path_dim {
        PathDim::Origin => Some(origin),
        PathDim::FirstHop => update.upstream(),
        _ => None,
    };

    let trusted_tail = match path_dim {
        PathDim::FirstHop => 2,
        _ => 1,
    };
    let path = &update.as_path;
    let asns_inf = path[..path.len().saturating_sub(trusted_tail)]
        .iter()
        .copied()
        .collect();

    Some(Classification {
        hijack_type: TypeTuple {
            prefix: prefix_dim,
            path: path_dim,
            data_plane: DataPlaneDim::Unset,
            policy: chosen.policy,
        },
        hijacker_asn,
        asns_inf,
    })
}

/// Evaluate the AS path against one rule. Announcements with a single-hop
/// path carry no first hop to verify; the empty path is rejected upstream as
/// malformed.
fn eval_path(update: &BgpUpdate, conf: &RuleConf, origin: Asn) -> PathDim {
    if !conf.origin_asns.contains(&origin) {
        return PathDim::Origin;
    }
    if let Some(upstream) = update.upstream() {
        if !conf.neighbors.is_empty() && !conf.neighbors.contains(&upstream) {
            return PathDim::FirstHop;
        }
    }
    if !conf.prepend_seq.is_empty() && !update.as_path.ends_with(&conf.prepend_seq) {
        return PathDim::Prepend;
    }
    if conf.path_unconstrained() {
        return PathDim::Unconstrained;
    }
    PathDim::Unset
}

/// Evaluate community scope against one rule. An update is compliant when
/// the first annotation whose `include` communities are all present and
/// whose `exclude` communities are all absent matches; with `no-export`
/// configured and annotations defined, a non-compliant update has leaked.
fn eval_policy(update: &BgpUpdate, conf: &RuleConf) -> PolicyDim {
    if !conf.policies.contains(POLICY_NO_EXPORT) || conf.community_annotations.is_empty() {
        return PolicyDim::Unset;
    }
    let compliant = conf.community_annotations.iter().find(|annotation| {
        annotation
            .include
            .iter()
            .all(|community| update.communities.contains(community))
            && annotation
                .exclude
                .iter()
                .all(|community| !update.communities.contains(community))
    });
    match compliant {
        Some(_) => PolicyDim::Unset,
        None => PolicyDim::Leak,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::UpdateType;
    use crate::policy::{CommunityAnnotation, PrefixNode};

    fn conf(origins: &[Asn], neighbors: &[Asn]) -> RuleConf {
        RuleConf {
            origin_asns: origins.iter().copied().collect(),
            neighbors: neighbors.iter().copied().collect(),
            prepend_seq: vec![],
            policies: BTreeSet::new(),
            community_annotations: vec![],
            mitigation: "manual".to_string(),
        }
    }

    fn node(prefix: &str, confs: Vec<RuleConf>) -> PrefixNode {
        PrefixNode {
            prefix: prefix.parse().unwrap(),
            confs,
            timestamp: 1.0,
        }
    }

    fn announcement(prefix: &str, as_path: Vec<Asn>) -> BgpUpdate {
        BgpUpdate {
            prefix: prefix.parse().unwrap(),
            origin_asn: as_path.last().copied(),
            as_path,
            peer_asn: 64999,
            communities: BTreeSet::new(),
            service: "ris".to_string(),
            update_type: UpdateType::Announcement,
            timestamp: 1_700_000_000.0,
            prefix_node: None,
        }
    }

    fn tuple(text: &str) -> TypeTuple {
        text.parse().unwrap()
    }

    #[test]
    fn test_exact_legitimate_announcement() {
        // S1
        let node = node("10.0.0.0/24", vec![conf(&[65001], &[65002])]);
        let update = announcement("10.0.0.0/24", vec![65002, 65001]);
        assert_eq!(classify(&update, &node), None);
    }

    #[test]
    fn test_origin_hijack_exact_prefix() {
        // S2
        let node = node("10.0.0.0/24", vec![conf(&[65001], &[65002])]);
        let update = announcement("10.0.0.0/24", vec![65099, 65500]);
        let result = classify(&update, &node).unwrap();
        assert_eq!(result.hijack_type, tuple("E|0|-|-"));
        assert_eq!(result.hijacker_asn, Some(65500));
        assert_eq!(result.asns_inf, BTreeSet::from([65099]));
    }

    #[test]
    fn test_first_hop_hijack_sub_prefix() {
        // S3
        let node = node("10.0.0.0/24", vec![conf(&[65001], &[65002])]);
        let update = announcement("10.0.0.128/25", vec![65003, 65001]);
        let result = classify(&update, &node).unwrap();
        assert_eq!(result.hijack_type, tuple("S|1|-|-"));
        assert_eq!(result.hijacker_asn, Some(65003));
    }

    #[test]
    fn test_squatting_announcement() {
        // S4
        let node = node("10.1.0.0/16", vec![conf(&[], &[])]);
        let update = announcement("10.1.0.0/16", vec![65500]);
        let result = classify(&update, &node).unwrap();
        assert_eq!(result.hijack_type, tuple("Q|0|-|-"));
        assert_eq!(result.hijacker_asn, Some(65500));
        assert!(result.asns_inf.is_empty());
    }

    #[test]
    fn test_policy_leak_reports_only_policy_dimension() {
        // S5
        let mut leak_conf = conf(&[65001], &[]);
        leak_conf.policies.insert(POLICY_NO_EXPORT.to_string());
        leak_conf.community_annotations.push(CommunityAnnotation {
            name: "internal".to_string(),
            include: vec![(65001, 100)],
            exclude: vec![],
        });
        let node = node("10.0.0.0/24", vec![leak_conf]);
        let update = announcement("10.0.0.0/24", vec![65002, 65001]);
        let result = classify(&update, &node).unwrap();
        assert_eq!(result.hijack_type, tuple("-|-|-|L"));
        assert_eq!(result.hijacker_asn, None);
    }

    #[test]
    fn test_policy_scope_compliance_first_match_wins() {
        let mut scoped = conf(&[65001], &[]);
        scoped.policies.insert(POLICY_NO_EXPORT.to_string());
        scoped.community_annotations.push(CommunityAnnotation {
            name: "blocked".to_string(),
            include: vec![(65001, 100)],
            exclude: vec![(65001, 666)],
        });
        scoped.community_annotations.push(CommunityAnnotation {
            name: "fallback".to_string(),
            include: vec![(65001, 100)],
            exclude: vec![],
        });
        let node = node("10.0.0.0/24", vec![scoped]);

        // compliant via the second annotation: first one is excluded
        let mut update = announcement("10.0.0.0/24", vec![65002, 65001]);
        update.communities.insert((65001, 100));
        update.communities.insert((65001, 666));
        assert_eq!(classify(&update, &node), None);

        // marker missing entirely: leak
        let update = announcement("10.0.0.0/24", vec![65002, 65001]);
        let result = classify(&update, &node).unwrap();
        assert_eq!(result.hijack_type.policy, PolicyDim::Leak);
    }

    #[test]
    fn test_prepend_pattern_violation() {
        let mut prepend_conf = conf(&[65001], &[65002]);
        prepend_conf.prepend_seq = vec![65001, 65001];
        let node = node("10.0.0.0/24", vec![prepend_conf]);

        let good = announcement("10.0.0.0/24", vec![65002, 65001, 65001]);
        assert_eq!(classify(&good, &node), None);

        let bad = announcement("10.0.0.0/24", vec![65002, 65001]);
        let result = classify(&bad, &node).unwrap();
        assert_eq!(result.hijack_type, tuple("E|P|-|-"));
        assert_eq!(result.hijacker_asn, None);
    }

    #[test]
    fn test_sub_prefix_with_satisfied_path_still_flagged() {
        let node = node("10.0.0.0/24", vec![conf(&[65001], &[65002])]);
        let update = announcement("10.0.0.64/26", vec![65002, 65001]);
        let result = classify(&update, &node).unwrap();
        assert_eq!(result.hijack_type, tuple("S|-|-|-"));
        assert_eq!(result.hijacker_asn, None);
    }

    #[test]
    fn test_sub_prefix_with_unconstrained_rule() {
        let node = node("10.0.0.0/24", vec![conf(&[65001], &[])]);
        let update = announcement("10.0.0.64/26", vec![65002, 65001]);
        let result = classify(&update, &node).unwrap();
        assert_eq!(result.hijack_type, tuple("S|U|-|-"));
    }

    #[test]
    fn test_any_satisfied_rule_legitimizes_exact_announcement() {
        let node = node(
            "10.0.0.0/24",
            vec![conf(&[65001], &[65002]), conf(&[65500], &[])],
        );
        let update = announcement("10.0.0.0/24", vec![65099, 65500]);
        assert_eq!(classify(&update, &node), None);
    }

    #[test]
    fn test_first_rule_reported_when_none_satisfied() {
        let node = node(
            "10.0.0.0/24",
            vec![conf(&[65001], &[65002]), conf(&[65002], &[65003])],
        );
        // origin valid under neither rule
        let update = announcement("10.0.0.0/24", vec![65099, 65500]);
        let result = classify(&update, &node).unwrap();
        assert_eq!(result.hijack_type, tuple("E|0|-|-"));
    }

    #[test]
    fn test_single_hop_path_skips_neighbor_check() {
        let node = node("10.0.0.0/24", vec![conf(&[65001], &[65002])]);
        let update = announcement("10.0.0.0/24", vec![65001]);
        assert_eq!(classify(&update, &node), None);
    }

    #[test]
    fn test_empty_path_is_not_classified() {
        let node = node("10.0.0.0/24", vec![conf(&[65001], &[65002])]);
        let update = announcement("10.0.0.0/24", vec![]);
        assert_eq!(classify(&update, &node), None);
    }

    #[test]
    fn test_type_tuple_round_trip() {
        for text in ["E|0|-|-", "S|1|-|-", "Q|0|-|-", "-|-|-|L", "S|U|-|-"] {
            assert_eq!(tuple(text).to_string(), text);
        }
        assert!("E|X|-|-".parse::<TypeTuple>().is_err());
        assert!("E|0|-".parse::<TypeTuple>().is_err());
    }
}
