//! Configuration compiler: document in, prefix index out.
//!
//! Expansion and node merging happen here; staleness checks and atomic
//! installation belong to the registry, which owns the timestamp.

use super::expand::{expand_asns, expand_rfc2622};
use super::{ConfigDoc, MonitorRoster, PrefixNode, RuleConf};
use crate::index::{PrefixIndex, PrefixMap};
use anyhow::{Context, Result};
use ipnet::IpNet;
use std::collections::BTreeSet;

/// Everything derived from one configuration document.
#[derive(Debug, Clone)]
pub struct CompiledConfig {
    pub timestamp: f64,
    pub tree: PrefixMap,
    pub monitors: MonitorRoster,
    pub monitored_prefixes: BTreeSet<IpNet>,
    pub configured_prefix_count: usize,
}

/// Compile a configuration document into a fresh prefix map plus derived
/// state. Fails without side effects on any invalid rule.
pub fn compile(doc: &ConfigDoc) -> Result<CompiledConfig> {
    let mut tree = PrefixMap::new();

    for (rule_idx, rule) in doc.rules.iter().enumerate() {
        let origin_asns = expand_asns(&rule.origin_asns)
            .with_context(|| format!("rule {rule_idx}: origin_asns"))?;
        let neighbors = expand_asns(&rule.neighbors)
            .with_context(|| format!("rule {rule_idx}: neighbors"))?;

        let conf = RuleConf {
            origin_asns,
            neighbors,
            prepend_seq: rule.prepend_seq.clone(),
            policies: rule.policies.iter().cloned().collect(),
            community_annotations: rule.community_annotations.clone(),
            mitigation: rule.mitigation.clone(),
        };

        for prefix_expr in &rule.prefixes {
            let expanded = expand_rfc2622(prefix_expr)
                .with_context(|| format!("rule {rule_idx}: prefix '{prefix_expr}'"))?;
            for prefix in expanded {
                tree.entry(prefix)
                    .or_insert_with(|| PrefixNode {
                        prefix,
                        confs: Vec::new(),
                        timestamp: doc.timestamp,
                    })
                    .confs
                    .push(conf.clone());
            }
        }
    }

    let index = PrefixIndex::from_map(&tree);
    let monitored_prefixes = tree
        .keys()
        .filter_map(|prefix| index.worst_prefix(prefix))
        .collect();

    Ok(CompiledConfig {
        timestamp: doc.timestamp,
        configured_prefix_count: tree.len(),
        monitored_prefixes,
        monitors: doc.monitors.clone(),
        tree,
    })
}
