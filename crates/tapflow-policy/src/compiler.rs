//! ACL compiler: projects rules into dense integer-keyed lookup tables.
//!
//! Compilation is total over the rule base: every valid rule lands in
//! exactly one family — the port table when `vlan == 0`, the vlan table
//! when `vlan > 0`. Colliding emissions merge by action-union, so a
//! single table probe returns the combined policy of every rule that
//! compiled to that key.

use std::collections::HashMap;

use tapflow_common::{Acl, DirectionType, PolicyData, TapType, TAP_MAX};

use crate::codec::{self, ANY_GROUP, ANY_PORT, ANY_PROTO};
use crate::interest::InterestTables;

/// One immutable build of every rule-derived table. The engine
/// publishes a whole `Compiled` at once so readers never observe a
/// half-rebuilt view.
#[derive(Debug, Default)]
pub struct Compiled {
    /// Interest sets feeding query normalisation
    pub interest: InterestTables,
    /// Port-family policies, keyed by [`codec::port_key`], per tap
    pub group_port_policy: [HashMap<u64, PolicyData>; TAP_MAX],
    /// Vlan-family policies, keyed by [`codec::vlan_key`], per tap
    pub group_vlan_policy: [HashMap<u64, PolicyData>; TAP_MAX],
}

impl Compiled {
    /// Compile a rule base. `Any`-tap rules are expanded to one clone
    /// per concrete tap first so lookups probe a single row.
    pub fn build(acls: &[Acl]) -> Self {
        let expanded = expand_any_tap(acls);
        let mut compiled = Compiled {
            interest: InterestTables::generate(&expanded),
            ..Default::default()
        };
        compiled.generate_group_port_maps(&expanded);
        compiled.generate_group_vlan_maps(&expanded);
        compiled
    }

    fn generate_group_port_maps(&mut self, acls: &[Acl]) {
        for acl in acls {
            if !acl.tap_type.is_concrete() || acl.vlan != 0 {
                continue;
            }
            let map = &mut self.group_port_policy[acl.tap_type.index()];
            for key in generate_group_ports_keys(acl, DirectionType::Forward) {
                map.entry(key).or_default().merge(&acl.actions, acl.id);
            }
        }
    }

    fn generate_group_vlan_maps(&mut self, acls: &[Acl]) {
        for acl in acls {
            if !acl.tap_type.is_concrete() || acl.vlan == 0 {
                continue;
            }
            let map = &mut self.group_vlan_policy[acl.tap_type.index()];
            let src = non_zero_groups(&acl.src_groups);
            let dst = non_zero_groups(&acl.dst_groups);
            let vlan = acl.vlan as u16;

            // both directions are materialised at compile time, with
            // the direction baked into the stored policy, so one vlan
            // probe per side answers bidirectionally
            for key in generate_group_vlan_keys(&src, &dst, vlan) {
                map.entry(key)
                    .or_default()
                    .merge_directed(&acl.actions, acl.id, DirectionType::Forward);
            }
            for key in generate_group_vlan_keys(&dst, &src, vlan) {
                map.entry(key)
                    .or_default()
                    .merge_directed(&acl.actions, acl.id, DirectionType::Backward);
            }
        }
    }
}

fn expand_any_tap(acls: &[Acl]) -> Vec<Acl> {
    let mut out = Vec::with_capacity(acls.len());
    for acl in acls {
        if acl.tap_type == TapType::Any {
            for tap in TapType::concrete() {
                let mut clone = acl.clone();
                clone.tap_type = tap;
                out.push(clone);
            }
        } else {
            out.push(acl.clone());
        }
    }
    out
}

/// Rules carry explicit zeros only as noise; the wildcard group enters
/// through empty-list substitution instead.
fn non_zero_groups(groups: &[u32]) -> Vec<u32> {
    groups.iter().copied().filter(|&g| g > ANY_GROUP).collect()
}

/// Cartesian product of the two group lists under one (port, proto).
/// Empty lists stand for the wildcard group, so this always returns at
/// least one key.
pub(crate) fn generate_group_port_keys(
    src_groups: &[u32],
    dst_groups: &[u32],
    port: u16,
    proto: u8,
) -> Vec<u64> {
    let src = if src_groups.is_empty() {
        &[ANY_GROUP][..]
    } else {
        src_groups
    };
    let dst = if dst_groups.is_empty() {
        &[ANY_GROUP][..]
    } else {
        dst_groups
    };

    let mut keys = Vec::with_capacity(src.len() * dst.len());
    for &s in src {
        for &d in dst {
            keys.push(codec::port_key(s, d, port, proto));
        }
    }
    keys
}

/// Lookup-side port keys: the exact tuple plus every wildcard variant a
/// rule could have been compiled under. Only variants that differ from
/// the base are emitted, so a fully wildcarded query yields one set.
pub(crate) fn generate_search_port_keys(
    src_groups: &[u32],
    dst_groups: &[u32],
    port: u16,
    proto: u8,
) -> Vec<u64> {
    let mut keys = generate_group_port_keys(src_groups, dst_groups, port, proto);
    if port != ANY_PORT {
        keys.extend(generate_group_port_keys(src_groups, dst_groups, ANY_PORT, proto));
    }
    if proto != ANY_PROTO {
        keys.extend(generate_group_port_keys(src_groups, dst_groups, ANY_PORT, ANY_PROTO));
    }
    if proto != ANY_PROTO && port != ANY_PORT {
        keys.extend(generate_group_port_keys(src_groups, dst_groups, port, ANY_PROTO));
    }
    keys
}

/// Compile-side port keys for one rule. An empty or 64K-wide port list
/// compiles to a single wildcard-port emission.
pub(crate) fn generate_group_ports_keys(acl: &Acl, direction: DirectionType) -> Vec<u64> {
    let mut src = non_zero_groups(&acl.src_groups);
    let mut dst = non_zero_groups(&acl.dst_groups);
    if direction == DirectionType::Backward {
        std::mem::swap(&mut src, &mut dst);
    }

    if acl.dst_ports.is_empty() || acl.dst_ports.len() >= usize::from(u16::MAX) {
        generate_group_port_keys(&src, &dst, ANY_PORT, acl.proto)
    } else {
        acl.dst_ports
            .iter()
            .flat_map(|&port| generate_group_port_keys(&src, &dst, port, acl.proto))
            .collect()
    }
}

/// Cartesian product of the two group lists under one vlan id
pub(crate) fn generate_group_vlan_keys(
    src_groups: &[u32],
    dst_groups: &[u32],
    vlan: u16,
) -> Vec<u64> {
    let src = if src_groups.is_empty() {
        &[ANY_GROUP][..]
    } else {
        src_groups
    };
    let dst = if dst_groups.is_empty() {
        &[ANY_GROUP][..]
    } else {
        dst_groups
    };

    let mut keys = Vec::with_capacity(src.len() * dst.len());
    for &s in src {
        for &d in dst {
            keys.push(codec::vlan_key(s, d, vlan));
        }
    }
    keys
}
