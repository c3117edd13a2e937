//! Process-wide shared state behind segmented locks.
//!
//! One lock per logical field, acquired in a fixed order:
//! `config_timestamp → prefix_tree → monitors → monitored_prefixes →
//! configured_prefix_count → data_worker`. Lock holders perform no blocking
//! I/O and guards are never held across an await point.
//!
//! The prefix tree is shared in plain-map form together with a
//! `recalculate` flag; workers that keep a local trie rebuild it from the
//! map under the tree lock and clear the flag inside the same critical
//! section.

use crate::index::{PrefixIndex, PrefixMap};
use crate::policy::{compile, ConfigDoc, MonitorRoster};
use anyhow::Result;
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Timestamp value before any configuration has been installed.
const UNCONFIGURED: f64 = -1.0;

/// Result of applying a configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The document was compiled and installed.
    Installed,
    /// The document's timestamp was not newer than the installed one; the
    /// registry is untouched.
    Stale,
}

struct SharedTree {
    map: PrefixMap,
    recalculate: bool,
}

/// Lock-segmented registry shared by the control plane and the workers.
pub struct SharedRegistry {
    config_timestamp: RwLock<f64>,
    prefix_tree: RwLock<SharedTree>,
    monitors: RwLock<MonitorRoster>,
    monitored_prefixes: RwLock<BTreeSet<IpNet>>,
    configured_prefix_count: RwLock<usize>,
    data_worker: RwLock<bool>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self {
            config_timestamp: RwLock::new(UNCONFIGURED),
            prefix_tree: RwLock::new(SharedTree {
                map: PrefixMap::new(),
                recalculate: true,
            }),
            monitors: RwLock::new(MonitorRoster::new()),
            monitored_prefixes: RwLock::new(BTreeSet::new()),
            configured_prefix_count: RwLock::new(0),
            data_worker: RwLock::new(false),
        }
    }

    /// Compile and atomically install a configuration document.
    ///
    /// Holding the timestamp lock across compilation serializes concurrent
    /// reconfigurations; only documents with a strictly greater timestamp
    /// take effect, so the installed timestamp is monotone non-decreasing.
    pub fn apply(&self, doc: &ConfigDoc) -> Result<ApplyOutcome> {
        let mut timestamp = write(&self.config_timestamp);
        if doc.timestamp <= *timestamp {
            tracing::info!(
                timestamp = doc.timestamp,
                installed = *timestamp,
                "ignoring stale configuration"
            );
            return Ok(ApplyOutcome::Stale);
        }

        let compiled = compile(doc)?;

        {
            let mut tree = write(&self.prefix_tree);
            tree.map = compiled.tree;
            tree.recalculate = true;
        }
        *write(&self.monitors) = compiled.monitors;
        *write(&self.monitored_prefixes) = compiled.monitored_prefixes;
        *write(&self.configured_prefix_count) = compiled.configured_prefix_count;
        *timestamp = compiled.timestamp;

        tracing::info!(
            timestamp = compiled.timestamp,
            prefixes = compiled.configured_prefix_count,
            "configuration installed"
        );
        Ok(ApplyOutcome::Installed)
    }

    /// Rebuild `index` from the shared map if a reconfiguration has been
    /// installed since the last rebuild. Returns true when a rebuild
    /// happened. The flag is cleared inside the tree critical section.
    pub fn refresh_index(&self, index: &mut PrefixIndex) -> bool {
        let mut tree = write(&self.prefix_tree);
        if !tree.recalculate {
            return false;
        }
        *index = PrefixIndex::from_map(&tree.map);
        tree.recalculate = false;
        tracing::info!(prefixes = index.len(), "prefix index rebuilt from configuration");
        true
    }

    pub fn config_timestamp(&self) -> f64 {
        *read(&self.config_timestamp)
    }

    /// True once any configuration has been installed.
    pub fn configured(&self) -> bool {
        self.config_timestamp() > UNCONFIGURED
    }

    pub fn monitors(&self) -> MonitorRoster {
        read(&self.monitors).clone()
    }

    pub fn monitored_prefixes(&self) -> Vec<IpNet> {
        read(&self.monitored_prefixes).iter().copied().collect()
    }

    pub fn configured_prefix_count(&self) -> usize {
        *read(&self.configured_prefix_count)
    }

    pub fn data_worker_running(&self) -> bool {
        *read(&self.data_worker)
    }

    /// Mark the data worker running unless it already is. Returns false when
    /// a worker was already marked running.
    pub fn try_start_data_worker(&self) -> bool {
        let mut running = write(&self.data_worker);
        if *running {
            return false;
        }
        *running = true;
        true
    }

    pub fn set_data_worker_running(&self, running: bool) {
        *write(&self.data_worker) = running;
    }
}

impl Default for SharedRegistry {
    fn default() -> Self {
        Self::new()
    }
}
