//! Longest-prefix-match index over configured prefixes.
//!
//! Built on `ipnet-trie`, which keeps separate tries per address family.
//! The registry shares the index in plain-map form; each worker rebuilds its
//! own [`PrefixIndex`] from that map when the recalculate flag is raised, so
//! lookups never cross a lock.

use crate::policy::PrefixNode;
use ipnet::IpNet;
use ipnet_trie::IpnetTrie;
use std::collections::BTreeMap;

/// The shared, lock-friendly form of the index: canonical prefix to node.
pub type PrefixMap = BTreeMap<IpNet, PrefixNode>;

/// Per-family longest-prefix-match structure holding configuration nodes.
pub struct PrefixIndex {
    trie: IpnetTrie<PrefixNode>,
    len: usize,
}

impl PrefixIndex {
    pub fn new() -> Self {
        Self {
            trie: IpnetTrie::new(),
            len: 0,
        }
    }

    /// Build an index from the shared map form.
    pub fn from_map(map: &PrefixMap) -> Self {
        let mut index = Self::new();
        for node in map.values() {
            index.insert(node.clone());
        }
        index
    }

    /// Insert a node keyed by its canonicalized prefix, replacing any
    /// existing node at that exact prefix.
    pub fn insert(&mut self, mut node: PrefixNode) {
        node.prefix = node.prefix.trunc();
        let prefix = node.prefix;
        match self.trie.exact_match_mut(prefix) {
            Some(existing) => *existing = node,
            None => {
                self.trie.insert(prefix, node);
                self.len += 1;
            }
        }
    }

    /// Exact-prefix lookup.
    pub fn exact(&self, prefix: &IpNet) -> Option<&PrefixNode> {
        self.trie.exact_match(prefix.trunc())
    }

    /// Longest-prefix match: the tightest configured prefix enclosing
    /// `prefix` (including `prefix` itself).
    pub fn lookup(&self, prefix: &IpNet) -> Option<&PrefixNode> {
        let prefix = prefix.trunc();
        self.trie.longest_match(&prefix).map(|(_, node)| node)
    }

    /// The shortest-mask configured prefix enclosing `prefix`: the monitored
    /// prefix under which `prefix` falls.
    ///
    /// Walks the possible super-prefix lengths from the top of the address
    /// family down, so the first hit is the worst (least specific) match.
    pub fn worst_prefix(&self, prefix: &IpNet) -> Option<IpNet> {
        let prefix = prefix.trunc();
        for len in 0..=prefix.prefix_len() {
            let Ok(super_net) = IpNet::new(prefix.addr(), len) else {
                continue;
            };
            let super_net = super_net.trunc();
            if self.trie.exact_match(super_net).is_some() {
                return Some(super_net);
            }
        }
        None
    }

    /// Number of distinct configured prefixes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for PrefixIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Address-family tag of a prefix, as used in logs and counters.
pub fn ip_version(net: &IpNet) -> &'static str {
    match net {
        IpNet::V4(_) => "v4",
        IpNet::V6(_) => "v6",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RuleConf;
    use std::collections::BTreeSet;

    fn node(prefix: &str) -> PrefixNode {
        PrefixNode {
            prefix: prefix.parse().unwrap(),
            confs: vec![RuleConf {
                origin_asns: BTreeSet::from([65001]),
                neighbors: BTreeSet::new(),
                prepend_seq: vec![],
                policies: BTreeSet::new(),
                community_annotations: vec![],
                mitigation: "manual".to_string(),
            }],
            timestamp: 1.0,
        }
    }

    fn index_of(prefixes: &[&str]) -> PrefixIndex {
        let mut index = PrefixIndex::new();
        for prefix in prefixes {
            index.insert(node(prefix));
        }
        index
    }

    #[test]
    fn test_exact_and_longest_match() {
        let index = index_of(&["10.0.0.0/8", "10.0.0.0/24"]);

        assert_eq!(index.len(), 2);
        assert!(index.exact(&"10.0.0.0/24".parse().unwrap()).is_some());
        assert!(index.exact(&"10.0.0.0/16".parse().unwrap()).is_none());

        // more-specific update resolves to the tightest enclosing prefix
        let hit = index.lookup(&"10.0.0.128/25".parse().unwrap()).unwrap();
        assert_eq!(hit.prefix.to_string(), "10.0.0.0/24");

        let hit = index.lookup(&"10.1.0.0/16".parse().unwrap()).unwrap();
        assert_eq!(hit.prefix.to_string(), "10.0.0.0/8");

        assert!(index.lookup(&"192.0.2.0/24".parse().unwrap()).is_none());
    }

    #[test]
    fn test_insert_canonicalizes_host_bits() {
        let index = index_of(&["10.0.0.77/24"]);
        let hit = index.lookup(&"10.0.0.1/32".parse().unwrap()).unwrap();
        assert_eq!(hit.prefix.to_string(), "10.0.0.0/24");
    }

    #[test]
    fn test_families_are_separate() {
        let index = index_of(&["10.0.0.0/8", "2001:db8::/32"]);
        assert!(index.lookup(&"2001:db8:1::/48".parse().unwrap()).is_some());
        assert!(index.lookup(&"10.2.0.0/16".parse().unwrap()).is_some());
        assert!(index.lookup(&"2001:db9::/32".parse().unwrap()).is_none());
    }

    #[test]
    fn test_worst_prefix_walks_to_least_specific() {
        let index = index_of(&["10.0.0.0/8", "10.0.0.0/24", "10.0.0.0/25"]);

        let worst = index.worst_prefix(&"10.0.0.0/25".parse().unwrap()).unwrap();
        assert_eq!(worst.to_string(), "10.0.0.0/8");

        // worst_prefix is idempotent
        assert_eq!(index.worst_prefix(&worst), Some(worst));

        // unconfigured prefix still resolves to its enclosing monitored prefix
        let worst = index.worst_prefix(&"10.9.9.0/24".parse().unwrap()).unwrap();
        assert_eq!(worst.to_string(), "10.0.0.0/8");

        assert_eq!(index.worst_prefix(&"192.0.2.0/24".parse().unwrap()), None);
    }

    #[test]
    fn test_from_map_round_trip() {
        let mut map = PrefixMap::new();
        for prefix in ["10.0.0.0/24", "2001:db8::/32"] {
            let node = node(prefix);
            map.insert(node.prefix, node);
        }
        let index = PrefixIndex::from_map(&map);
        assert_eq!(index.len(), 2);
        assert!(index.exact(&"2001:db8::/32".parse().unwrap()).is_some());
    }
}
