//! Fast-tier cache: a subnet-pair LRU of per-EPC policy sub-LRUs.
//!
//! Each (queue, tap) column owns one [`FastTable`]. The outer LRU is
//! keyed by the masked (src, dst) address pair; every entry nests a
//! MAC-to-EPC map and two policy maps keyed by compact EPC-based
//! fingerprints. The slow tier seeds entries for both directions on
//! every resolution — hit or miss — so a fingerprint only ever pays the
//! slow-tier cost once per rule generation.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;

use tapflow_common::{
    DirectionType, EndpointData, EndpointInfo, LookupKey, PolicyData, INVALID_POLICY_DATA,
};

use crate::codec::{fast_port_key, fast_vlan_key, subnet_pair_key, ANY_GROUP};
use crate::engine::{PolicyEngine, POLICY_TIMEOUT};

/// Capacity of the nested vlan- and port-policy sub-LRUs
const POLICY_MAP_SIZE_LIMIT: usize = 1024;
/// Capacity of the nested MAC-to-EPC sub-LRU
const EPC_MAP_SIZE_LIMIT: usize = 128;
/// EPC standing in for internet endpoints (`l3_epc_id == -1`)
const EPC_INTERNET: u32 = 0xffff_ffff;

fn cap(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

fn is_expired(entry: Duration, now: Duration) -> bool {
    // out-of-order packets carry older clocks; they never evict
    entry < now && now - entry > POLICY_TIMEOUT
}

/// Cached (endpoint, policy) pair with the clock of its last use
#[derive(Debug, Clone)]
struct FastPathValue {
    endpoint: EndpointData,
    policy: PolicyData,
    timestamp: Duration,
}

/// Sub-LRUs nested under one subnet-pair bucket
struct VlanAndPortMap {
    mac_epc: LruCache<u64, u32>,
    vlan_policy: LruCache<u64, FastPathValue>,
    port_policy: LruCache<u64, FastPathValue>,
}

impl VlanAndPortMap {
    fn new() -> Self {
        Self {
            mac_epc: LruCache::new(cap(EPC_MAP_SIZE_LIMIT)),
            vlan_policy: LruCache::new(cap(POLICY_MAP_SIZE_LIMIT)),
            port_policy: LruCache::new(cap(POLICY_MAP_SIZE_LIMIT)),
        }
    }

    /// Derive the cache EPC for an endpoint and remember its MAC.
    /// L2 context wins over L3; an internet L3 context maps to the
    /// reserved marker; everything else is the wildcard.
    fn record_epc(&mut self, info: &EndpointInfo, mac: u64) -> u32 {
        let epc = if info.l2_epc_id > 0 {
            info.l2_epc_id as u32
        } else if info.l2_epc_id == 0 {
            if info.l3_epc_id > 0 {
                info.l3_epc_id as u32
            } else if info.l3_epc_id == -1 {
                EPC_INTERNET
            } else {
                ANY_GROUP
            }
        } else {
            ANY_GROUP
        };
        self.mac_epc.put(mac, epc);
        epc
    }

    fn lookup_port(
        &mut self,
        key: &LookupKey,
        direction: DirectionType,
        policy: &mut PolicyData,
        endpoint: &mut Option<EndpointData>,
    ) -> bool {
        let Some(&src_epc) = self.mac_epc.get(&key.src_mac) else {
            return false;
        };
        let Some(&dst_epc) = self.mac_epc.get(&key.dst_mac) else {
            return false;
        };
        let (first_epc, second_epc, port) = match direction {
            DirectionType::Forward => (src_epc, dst_epc, key.dst_port),
            DirectionType::Backward => (dst_epc, src_epc, key.src_port),
        };

        let map_key = fast_port_key(first_epc, second_epc, key.proto, port);
        let expired = match self.port_policy.get_mut(&map_key) {
            None => return false,
            Some(value) => {
                if is_expired(value.timestamp, key.timestamp) {
                    true
                } else {
                    value.timestamp = key.timestamp;
                    policy.merge_directed(
                        &value.policy.acl_actions,
                        value.policy.acl_id,
                        direction,
                    );
                    *endpoint = Some(match direction {
                        DirectionType::Forward => value.endpoint.clone(),
                        DirectionType::Backward => value.endpoint.reversed(),
                    });
                    false
                }
            }
        };
        if expired {
            self.port_policy.pop(&map_key);
            return false;
        }
        true
    }

    /// Forward-only: backward vlan entries were materialised under the
    /// swapped bucket at seed time.
    fn lookup_vlan(
        &mut self,
        key: &LookupKey,
        policy: &mut PolicyData,
        endpoint: &mut Option<EndpointData>,
    ) -> bool {
        let Some(&src_epc) = self.mac_epc.get(&key.src_mac) else {
            return false;
        };
        let Some(&dst_epc) = self.mac_epc.get(&key.dst_mac) else {
            return false;
        };

        let map_key = fast_vlan_key(src_epc, dst_epc, key.vlan);
        let expired = match self.vlan_policy.get_mut(&map_key) {
            None => return false,
            Some(value) => {
                if is_expired(value.timestamp, key.timestamp) {
                    true
                } else {
                    value.timestamp = key.timestamp;
                    // direction was baked in when the entry was seeded
                    policy.merge(&value.policy.acl_actions, value.policy.acl_id);
                    *endpoint = Some(value.endpoint.clone());
                    false
                }
            }
        };
        if expired {
            self.vlan_policy.pop(&map_key);
            return false;
        }
        true
    }
}

/// One (queue, tap) fast-path column
pub(crate) struct FastTable {
    maps: LruCache<u64, VlanAndPortMap>,
}

impl FastTable {
    pub(crate) fn new(map_size: usize) -> Self {
        Self {
            maps: LruCache::new(cap(map_size)),
        }
    }

    fn bucket_key(subnets: (u32, u32), direction: DirectionType) -> u64 {
        let (masked_src, masked_dst) = subnets;
        match direction {
            DirectionType::Forward => subnet_pair_key(masked_src, masked_dst),
            DirectionType::Backward => subnet_pair_key(masked_dst, masked_src),
        }
    }

    fn entry(&mut self, subnets: (u32, u32), direction: DirectionType) -> &mut VlanAndPortMap {
        self.maps
            .get_or_insert_mut(Self::bucket_key(subnets, direction), VlanAndPortMap::new)
    }

    /// Seed vlan entries for both directions under their respective
    /// buckets. The backward policy carries swapped direction tags and
    /// a swapped endpoint.
    pub(crate) fn seed_vlan_policy(
        &mut self,
        subnets: (u32, u32),
        key: &LookupKey,
        endpoints: &EndpointData,
        policy: &PolicyData,
    ) {
        let maps = self.entry(subnets, DirectionType::Forward);
        let src_epc = maps.record_epc(&endpoints.src_info, key.src_mac);
        let dst_epc = maps.record_epc(&endpoints.dst_info, key.dst_mac);
        let mut forward = PolicyData::default();
        forward.merge(&policy.acl_actions, policy.acl_id);
        maps.vlan_policy.put(
            fast_vlan_key(src_epc, dst_epc, key.vlan),
            FastPathValue {
                endpoint: endpoints.clone(),
                policy: forward,
                timestamp: key.timestamp,
            },
        );

        let maps = self.entry(subnets, DirectionType::Backward);
        let src_epc = maps.record_epc(&endpoints.src_info, key.src_mac);
        let dst_epc = maps.record_epc(&endpoints.dst_info, key.dst_mac);
        let mut backward = PolicyData::default();
        backward.merge_and_swap_direction(&policy.acl_actions, policy.acl_id);
        maps.vlan_policy.put(
            fast_vlan_key(dst_epc, src_epc, key.vlan),
            FastPathValue {
                endpoint: endpoints.reversed(),
                policy: backward,
                timestamp: key.timestamp,
            },
        );
    }

    /// Seed the port entry for one direction under its bucket
    pub(crate) fn seed_port_policy(
        &mut self,
        subnets: (u32, u32),
        key: &LookupKey,
        endpoints: &EndpointData,
        policy: &PolicyData,
        direction: DirectionType,
    ) {
        let maps = self.entry(subnets, direction);
        let src_epc = maps.record_epc(&endpoints.src_info, key.src_mac);
        let dst_epc = maps.record_epc(&endpoints.dst_info, key.dst_mac);
        let (first_epc, second_epc, port, endpoint) = match direction {
            DirectionType::Forward => (src_epc, dst_epc, key.dst_port, endpoints.clone()),
            DirectionType::Backward => (dst_epc, src_epc, key.src_port, endpoints.reversed()),
        };

        let mut merged = PolicyData::default();
        merged.merge(&policy.acl_actions, policy.acl_id);
        maps.port_policy.put(
            fast_port_key(first_epc, second_epc, key.proto, port),
            FastPathValue {
                endpoint,
                policy: merged,
                timestamp: key.timestamp,
            },
        );
    }

    pub(crate) fn lookup_port(
        &mut self,
        subnets: (u32, u32),
        key: &LookupKey,
        direction: DirectionType,
        policy: &mut PolicyData,
        endpoint: &mut Option<EndpointData>,
    ) -> bool {
        match self.maps.get_mut(&Self::bucket_key(subnets, direction)) {
            Some(maps) => maps.lookup_port(key, direction, policy, endpoint),
            None => false,
        }
    }

    pub(crate) fn lookup_vlan(
        &mut self,
        subnets: (u32, u32),
        key: &LookupKey,
        policy: &mut PolicyData,
        endpoint: &mut Option<EndpointData>,
    ) -> bool {
        match self
            .maps
            .get_mut(&Self::bucket_key(subnets, DirectionType::Forward))
        {
            Some(maps) => maps.lookup_vlan(key, policy, endpoint),
            None => false,
        }
    }
}

impl PolicyEngine {
    /// Resolve a packet against the fast tier alone.
    ///
    /// Returns the cached endpoint data and merged policy when every
    /// required sub-lookup hits, `(None, INVALID_POLICY_DATA)`
    /// otherwise. Mutates the key during normalisation.
    pub fn get_policy_by_fast_path(
        &self,
        key: &mut LookupKey,
    ) -> (Option<EndpointData>, PolicyData) {
        if self.fast_path_disable {
            return (None, INVALID_POLICY_DATA);
        }

        let compiled = self.compiled.load();
        compiled.interest.normalize_key(key);
        let subnets = self.masked_ips(key);

        let mut policy = PolicyData::default();
        let mut endpoint = None;
        let mut port_forward_found = false;
        let mut port_backward_found = false;
        let mut vlan_found = true;

        let mut table = self.fast_tables[key.fast_index][key.tap_type.index()].lock();
        for direction in [DirectionType::Forward, DirectionType::Backward] {
            if key.vlan > 0 && direction == DirectionType::Forward {
                vlan_found = table.lookup_vlan(subnets, key, &mut policy, &mut endpoint);
            }
            let found = table.lookup_port(subnets, key, direction, &mut policy, &mut endpoint);
            match direction {
                DirectionType::Forward => port_forward_found = found,
                DirectionType::Backward => port_backward_found = found,
            }
        }
        drop(table);

        if !(port_forward_found && port_backward_found && vlan_found) {
            return (None, INVALID_POLICY_DATA);
        }

        self.counters.fast_path_hit.inc();
        self.counters.fast_path_hit_tick.inc();
        self.counters.record_acl_hit(policy.acl_actions.len() as u64);
        (endpoint, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tapflow_common::{AclAction, Action};

    fn sample_key(timestamp_secs: u64) -> LookupKey {
        LookupKey {
            timestamp: Duration::from_secs(timestamp_secs),
            src_mac: 0xaa,
            dst_mac: 0xbb,
            dst_port: 80,
            proto: 6,
            ..Default::default()
        }
    }

    fn sample_endpoints() -> EndpointData {
        EndpointData {
            src_info: EndpointInfo {
                l2_epc_id: 1,
                ..Default::default()
            },
            dst_info: EndpointInfo {
                l2_epc_id: 2,
                ..Default::default()
            },
        }
    }

    fn sample_policy() -> PolicyData {
        let mut policy = PolicyData::default();
        policy.merge_directed(&[AclAction::new(1, Action::Allow)], 1, DirectionType::Forward);
        policy
    }

    const SUBNETS: (u32, u32) = (0x0a000000, 0x0a010000);

    #[test]
    fn test_seed_then_lookup_port() {
        let mut table = FastTable::new(16);
        let key = sample_key(0);
        table.seed_port_policy(
            SUBNETS,
            &key,
            &sample_endpoints(),
            &sample_policy(),
            DirectionType::Forward,
        );

        let mut policy = PolicyData::default();
        let mut endpoint = None;
        assert!(table.lookup_port(SUBNETS, &key, DirectionType::Forward, &mut policy, &mut endpoint));
        assert_eq!(policy.acl_id, 1);
        assert_eq!(endpoint, Some(sample_endpoints()));
    }

    #[test]
    fn test_unknown_mac_misses() {
        let mut table = FastTable::new(16);
        let key = sample_key(0);
        table.seed_port_policy(
            SUBNETS,
            &key,
            &sample_endpoints(),
            &sample_policy(),
            DirectionType::Forward,
        );

        let mut stranger = sample_key(0);
        stranger.src_mac = 0xcc;
        let mut policy = PolicyData::default();
        let mut endpoint = None;
        assert!(!table.lookup_port(
            SUBNETS,
            &stranger,
            DirectionType::Forward,
            &mut policy,
            &mut endpoint
        ));
    }

    #[test]
    fn test_stale_entry_is_evicted_and_fresh_refreshes() {
        let mut table = FastTable::new(16);
        table.seed_port_policy(
            SUBNETS,
            &sample_key(0),
            &sample_endpoints(),
            &sample_policy(),
            DirectionType::Forward,
        );

        // 30 s later: within the timeout, hits and refreshes the clock
        let mut policy = PolicyData::default();
        let mut endpoint = None;
        assert!(table.lookup_port(
            SUBNETS,
            &sample_key(30),
            DirectionType::Forward,
            &mut policy,
            &mut endpoint
        ));

        // 120 s: 90 s since the refresh, evicted
        let mut policy = PolicyData::default();
        assert!(!table.lookup_port(
            SUBNETS,
            &sample_key(120),
            DirectionType::Forward,
            &mut policy,
            &mut endpoint
        ));

        // and the entry is gone, not merely skipped
        let mut policy = PolicyData::default();
        assert!(!table.lookup_port(
            SUBNETS,
            &sample_key(30),
            DirectionType::Forward,
            &mut policy,
            &mut endpoint
        ));
    }

    #[test]
    fn test_backward_clock_does_not_evict() {
        let mut table = FastTable::new(16);
        table.seed_port_policy(
            SUBNETS,
            &sample_key(1000),
            &sample_endpoints(),
            &sample_policy(),
            DirectionType::Forward,
        );

        let mut policy = PolicyData::default();
        let mut endpoint = None;
        assert!(table.lookup_port(
            SUBNETS,
            &sample_key(0),
            DirectionType::Forward,
            &mut policy,
            &mut endpoint
        ));
    }

    #[test]
    fn test_vlan_seed_covers_both_directions() {
        let mut table = FastTable::new(16);
        let mut key = sample_key(0);
        key.vlan = 100;
        table.seed_vlan_policy(SUBNETS, &key, &sample_endpoints(), &sample_policy());

        let mut policy = PolicyData::default();
        let mut endpoint = None;
        assert!(table.lookup_vlan(SUBNETS, &key, &mut policy, &mut endpoint));
        assert!(policy.acl_actions[0].is_tagged(DirectionType::Forward));

        // the reply direction probes the swapped bucket with swapped
        // MACs and finds the backward-tagged entry
        let mut reply = key.reversed();
        reply.vlan = 100;
        let reply_subnets = (SUBNETS.1, SUBNETS.0);
        let mut policy = PolicyData::default();
        assert!(table.lookup_vlan(reply_subnets, &reply, &mut policy, &mut endpoint));
        assert!(policy.acl_actions[0].is_tagged(DirectionType::Backward));
        assert_eq!(endpoint, Some(sample_endpoints().reversed()));
    }

    #[test]
    fn test_internet_epc_marker() {
        let mut maps = VlanAndPortMap::new();
        let info = EndpointInfo {
            l2_epc_id: 0,
            l3_epc_id: -1,
            ..Default::default()
        };
        assert_eq!(maps.record_epc(&info, 0xaa), EPC_INTERNET);

        let info = EndpointInfo {
            l2_epc_id: 0,
            l3_epc_id: 7,
            ..Default::default()
        };
        assert_eq!(maps.record_epc(&info, 0xbb), 7);

        let info = EndpointInfo::default();
        assert_eq!(maps.record_epc(&info, 0xcc), ANY_GROUP);
    }
}
