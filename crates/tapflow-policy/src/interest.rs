//! Per-tap interest sets and query-key normalisation.
//!
//! Every proto, port, and group id that appears literally in at least
//! one rule is "interesting". Query fields outside the interest sets
//! cannot influence any rule, so they are collapsed to the wildcard
//! before either tier runs; this is what keeps the fast-path cache hit
//! rate high under high-cardinality traffic.

use std::collections::HashSet;

use tapflow_common::{Acl, EndpointData, LookupKey, TAP_MAX};

use crate::codec::{ANY_GROUP, ANY_PORT, ANY_PROTO};

/// Field values appearing literally in rules, per concrete tap
#[derive(Debug, Default)]
pub struct InterestTables {
    protos: [HashSet<u8>; TAP_MAX],
    ports: [HashSet<u16>; TAP_MAX],
    groups: [HashSet<u32>; TAP_MAX],
}

impl InterestTables {
    /// Collect interest sets from an already tap-expanded rule list
    pub fn generate(acls: &[Acl]) -> Self {
        let mut tables = Self::default();
        for acl in acls {
            if !acl.tap_type.is_concrete() {
                continue;
            }
            let tap = acl.tap_type.index();
            tables.protos[tap].insert(acl.proto);
            // a 64K-wide port list is a wildcard, not 64K literals
            if acl.dst_ports.len() < usize::from(u16::MAX) {
                tables.ports[tap].extend(acl.dst_ports.iter().copied());
            }
            tables.groups[tap].extend(acl.src_groups.iter().copied());
            tables.groups[tap].extend(acl.dst_groups.iter().copied());
        }
        tables
    }

    /// Collapse ports and protocol no rule filters on to the wildcard.
    /// Mutates the caller's key.
    pub fn normalize_key(&self, key: &mut LookupKey) {
        let tap = key.tap_type.index();
        if !self.ports[tap].contains(&key.src_port) {
            key.src_port = ANY_PORT;
        }
        if !self.ports[tap].contains(&key.dst_port) {
            key.dst_port = ANY_PORT;
        }
        if !self.protos[tap].contains(&key.proto) {
            key.proto = ANY_PROTO;
        }
    }

    /// Project endpoint group ids through the tap's interest set into
    /// the key. The wildcard group is always appended so wildcard rules
    /// still match.
    pub fn fill_group_ids(&self, key: &mut LookupKey, endpoints: &EndpointData) {
        let groups = &self.groups[key.tap_type.index()];
        fill_side(&mut key.src_group_ids, &endpoints.src_info.group_ids, groups);
        fill_side(&mut key.dst_group_ids, &endpoints.dst_info.group_ids, groups);
    }
}

fn fill_side(out: &mut Vec<u32>, ids: &[u32], interesting: &HashSet<u32>) {
    out.clear();
    let mut has_any = false;
    for &id in ids {
        if interesting.contains(&id) {
            out.push(id);
            has_any |= id == ANY_GROUP;
        }
    }
    if !has_any {
        out.push(ANY_GROUP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapflow_common::{EndpointInfo, TapType};

    fn sample_acl() -> Acl {
        Acl {
            id: 1,
            tap_type: TapType::Tor,
            src_groups: vec![10],
            dst_groups: vec![20],
            dst_ports: vec![80, 443],
            proto: 6,
            ..Default::default()
        }
    }

    fn tor_key() -> LookupKey {
        LookupKey {
            tap_type: TapType::Tor,
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_collapses_uninteresting_fields() {
        let tables = InterestTables::generate(&[sample_acl()]);

        let mut key = tor_key();
        key.src_port = 54321;
        key.dst_port = 80;
        key.proto = 6;
        tables.normalize_key(&mut key);
        assert_eq!(key.src_port, ANY_PORT);
        assert_eq!(key.dst_port, 80);
        assert_eq!(key.proto, 6);

        let mut key = tor_key();
        key.dst_port = 53;
        key.proto = 17;
        tables.normalize_key(&mut key);
        assert_eq!(key.dst_port, ANY_PORT);
        assert_eq!(key.proto, ANY_PROTO);
    }

    #[test]
    fn test_normalize_is_per_tap() {
        let tables = InterestTables::generate(&[sample_acl()]);

        // same port on a tap with no rules collapses
        let mut key = tor_key();
        key.tap_type = TapType::Isp;
        key.dst_port = 80;
        tables.normalize_key(&mut key);
        assert_eq!(key.dst_port, ANY_PORT);
    }

    #[test]
    fn test_fill_groups_retains_interesting_and_appends_wildcard() {
        let tables = InterestTables::generate(&[sample_acl()]);

        let endpoints = EndpointData {
            src_info: EndpointInfo::with_groups(vec![10, 99]),
            dst_info: EndpointInfo::with_groups(vec![20]),
        };
        let mut key = tor_key();
        tables.fill_group_ids(&mut key, &endpoints);

        // 99 appears in no rule and is dropped; 0 is appended
        assert_eq!(key.src_group_ids, vec![10, ANY_GROUP]);
        assert_eq!(key.dst_group_ids, vec![20, ANY_GROUP]);
    }

    #[test]
    fn test_fill_groups_does_not_duplicate_wildcard() {
        let mut acl = sample_acl();
        acl.src_groups = vec![0];
        let tables = InterestTables::generate(&[acl]);

        let endpoints = EndpointData {
            src_info: EndpointInfo::with_groups(vec![0]),
            dst_info: EndpointInfo::with_groups(vec![]),
        };
        let mut key = tor_key();
        tables.fill_group_ids(&mut key, &endpoints);

        assert_eq!(key.src_group_ids, vec![ANY_GROUP]);
        assert_eq!(key.dst_group_ids, vec![ANY_GROUP]);
    }
}
