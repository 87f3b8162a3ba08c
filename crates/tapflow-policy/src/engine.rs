//! Classifier coordinator: rule lifecycle, table publication, counters.
//!
//! One control-plane thread mutates rules; many data-plane workers run
//! lookups concurrently. Compiled tables and the netmask map are
//! published as immutable snapshots behind [`ArcSwap`], so a reader
//! observes either the pre-update or the post-update view, never a mix.
//! Fast-path columns are partitioned by (queue, tap); the per-column
//! mutex is uncontended as long as callers honour the one-worker-per-
//! `fast_index` contract, and keeps the engine safe if they do not.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use tapflow_common::{
    Acl, AtomicCounter, IpGroupData, LookupKey, PlatformData, TapFlowResult, TAP_MAX,
};

use crate::compiler::Compiled;
use crate::fast_path::FastTable;
use crate::netmask::NetmaskMap;

/// Fast-path entries older than this relative to the query clock are
/// evicted on access.
pub const POLICY_TIMEOUT: Duration = Duration::from_secs(60);

/// Lock-free hit counters, all monotone
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub(crate) first_path_hit: AtomicCounter,
    pub(crate) first_path_hit_tick: AtomicCounter,
    pub(crate) fast_path_hit: AtomicCounter,
    pub(crate) fast_path_hit_tick: AtomicCounter,
    pub(crate) acl_hit_max: AtomicU64,
}

impl EngineCounters {
    /// Raise the matched-action high-water mark. Lost races only ever
    /// keep an equal-or-larger value, so the maximum stays monotone.
    pub(crate) fn record_acl_hit(&self, hit: u64) {
        loop {
            let current = self.acl_hit_max.load(Ordering::Relaxed);
            if hit <= current {
                break;
            }
            if self
                .acl_hit_max
                .compare_exchange_weak(current, hit, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Point-in-time view of every counter
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            first_path_hit: self.first_path_hit.get(),
            first_path_hit_tick: self.first_path_hit_tick.get(),
            fast_path_hit: self.fast_path_hit.get(),
            fast_path_hit_tick: self.fast_path_hit_tick.get(),
            acl_hit_max: self.acl_hit_max.load(Ordering::Relaxed),
        }
    }
}

/// Counter snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    /// Slow-tier resolutions since start
    pub first_path_hit: u64,
    /// Slow-tier resolutions in the current tick window
    pub first_path_hit_tick: u64,
    /// Fast-tier hits since start
    pub fast_path_hit: u64,
    /// Fast-tier hits in the current tick window
    pub fast_path_hit_tick: u64,
    /// Largest action count any single lookup has merged
    pub acl_hit_max: u64,
}

/// Two-tier traffic policy classifier.
///
/// `fast_index` on the lookup key selects the worker's fast-path
/// column and must be unique per worker and below the `queue_count`
/// the engine was built with.
pub struct PolicyEngine {
    raw_acls: Mutex<Vec<Acl>>,
    pub(crate) compiled: ArcSwap<Compiled>,
    ip_netmask: ArcSwap<NetmaskMap>,
    pub(crate) fast_tables: Vec<[Mutex<FastTable>; TAP_MAX]>,
    pub(crate) fast_path_disable: bool,
    map_size: usize,
    pub(crate) counters: EngineCounters,
}

impl PolicyEngine {
    /// Allocate per-(queue, tap) fast-path LRUs of capacity `map_size`
    pub fn new(queue_count: usize, map_size: usize, fast_path_disable: bool) -> Self {
        let fast_tables = (0..queue_count)
            .map(|_| std::array::from_fn(|_| Mutex::new(FastTable::new(map_size))))
            .collect();

        Self {
            raw_acls: Mutex::new(Vec::new()),
            compiled: ArcSwap::from_pointee(Compiled::default()),
            ip_netmask: ArcSwap::from_pointee(NetmaskMap::default()),
            fast_tables,
            fast_path_disable,
            map_size,
            counters: EngineCounters::default(),
        }
    }

    /// Replace the rule base and atomically publish the recompiled
    /// tables. Rules with over-wide group ids are rejected as a whole.
    pub fn update_acls(&self, acls: Vec<Acl>) -> TapFlowResult<()> {
        for acl in &acls {
            acl.validate()?;
        }

        let compiled = Compiled::build(&acls);
        info!("rule tables rebuilt from {} acls", acls.len());
        *self.raw_acls.lock() = acls;
        self.compiled.store(Arc::new(compiled));
        Ok(())
    }

    /// Append one rule, recompile, and flush the fast path
    pub fn add_acl(&self, acl: Acl) -> TapFlowResult<()> {
        let mut acls = self.raw_acls.lock().clone();
        acls.push(acl);
        self.update_acls(acls)?;
        self.flush_acls();
        Ok(())
    }

    /// Remove the rule at a 1-based position, recompile, and flush the
    /// fast path. Out-of-range positions are ignored.
    pub fn del_acl(&self, id: usize) -> TapFlowResult<()> {
        let mut acls = self.raw_acls.lock().clone();
        if id == 0 || id > acls.len() {
            return Ok(());
        }
        acls.remove(id - 1);
        self.update_acls(acls)?;
        self.flush_acls();
        Ok(())
    }

    /// Drop every fast-path entry by replacing each column with a fresh
    /// LRU of the same capacity. Counters are untouched.
    pub fn flush_acls(&self) {
        for column in &self.fast_tables {
            for table in column {
                *table.lock() = FastTable::new(self.map_size);
            }
        }
        debug!("fast path caches flushed");
    }

    /// Learn fast-path bucket masks from the platform inventory
    pub fn generate_ip_netmask_map(&self, platforms: &[PlatformData]) {
        let next = self.ip_netmask.load().merge_platforms(platforms);
        debug!("netmask map rebuilt from platforms, {} buckets", next.len());
        self.ip_netmask.store(Arc::new(next));
    }

    /// Learn fast-path bucket masks from IP group resources
    pub fn generate_ip_netmask_map_from_ip_resource(&self, groups: &[IpGroupData]) {
        let next = self.ip_netmask.load().merge_ip_groups(groups);
        debug!("netmask map rebuilt from ip groups, {} buckets", next.len());
        self.ip_netmask.store(Arc::new(next));
    }

    /// Current hit counters
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Mask both addresses with their learned bucket masks
    pub(crate) fn masked_ips(&self, key: &LookupKey) -> (u32, u32) {
        let netmask = self.ip_netmask.load();
        (
            key.src_ip & netmask.mask_for(key.src_ip),
            key.dst_ip & netmask.mask_for(key.dst_ip),
        )
    }
}
