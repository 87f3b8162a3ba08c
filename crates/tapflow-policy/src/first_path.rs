//! Slow-tier resolver over the compiled rule tables.
//!
//! FirstPath answers a lookup from the compiled maps alone, then seeds
//! the caller's fast-path column with everything it learned — including
//! misses — so the same fingerprint never pays the slow-tier cost twice
//! within a rule generation.

use tapflow_common::{
    DirectionType, EndpointData, LookupKey, PolicyData, INVALID_POLICY_DATA,
};

use crate::compiler::{generate_group_vlan_keys, generate_search_port_keys};
use crate::engine::PolicyEngine;

impl PolicyEngine {
    /// Resolve a packet against the full rule base and seed the fast
    /// path. Mutates the key during normalisation. Returns the merged
    /// policy, or `INVALID_POLICY_DATA` when no rule matched.
    pub fn get_policy_by_first_path(
        &self,
        endpoints: &EndpointData,
        key: &mut LookupKey,
    ) -> PolicyData {
        let compiled = self.compiled.load();
        compiled.interest.normalize_key(key);
        compiled.interest.fill_group_ids(key, endpoints);

        let tap = key.tap_type.index();
        let port_map = &compiled.group_port_policy[tap];
        let vlan_map = &compiled.group_vlan_policy[tap];

        let subnets = self.masked_ips(key);
        let mut column = self.fast_tables[key.fast_index][tap].lock();

        let mut merged = PolicyData::default();
        let mut vlan_found = false;
        let mut port_found = false;

        if key.vlan > 0 {
            for vlan_key in generate_group_vlan_keys(&key.src_group_ids, &key.dst_group_ids, key.vlan)
            {
                if let Some(policy) = vlan_map.get(&vlan_key) {
                    merged.merge(&policy.acl_actions, policy.acl_id);
                    vlan_found = true;
                }
            }
            // seed hit or miss, so the fast tier answers next time
            column.seed_vlan_policy(subnets, key, endpoints, &merged);
        }

        let mut forward = PolicyData::default();
        for port_key in
            generate_search_port_keys(&key.src_group_ids, &key.dst_group_ids, key.dst_port, key.proto)
        {
            if let Some(policy) = port_map.get(&port_key) {
                forward.merge_directed(&policy.acl_actions, policy.acl_id, DirectionType::Forward);
                port_found = true;
            }
        }
        if !forward.acl_actions.is_empty() {
            merged.merge_directed(&forward.acl_actions, forward.acl_id, DirectionType::Forward);
        }
        column.seed_port_policy(subnets, key, endpoints, &forward, DirectionType::Forward);

        let mut backward = PolicyData::default();
        for port_key in
            generate_search_port_keys(&key.dst_group_ids, &key.src_group_ids, key.src_port, key.proto)
        {
            if let Some(policy) = port_map.get(&port_key) {
                // the table stores forward-orientation keys only; the
                // swapped probe retags its hits here
                backward.merge_directed(&policy.acl_actions, policy.acl_id, DirectionType::Backward);
                port_found = true;
            }
        }
        if !backward.acl_actions.is_empty() {
            merged.merge_directed(&backward.acl_actions, backward.acl_id, DirectionType::Backward);
        }
        column.seed_port_policy(subnets, key, endpoints, &backward, DirectionType::Backward);
        drop(column);

        self.counters.first_path_hit.inc();
        self.counters.first_path_hit_tick.inc();

        if !port_found && !vlan_found {
            return INVALID_POLICY_DATA;
        }
        merged
    }
}
