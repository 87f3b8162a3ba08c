//! Longest-prefix learner for fast-path subnet bucketing.
//!
//! The fast tier buckets cache entries by masked (src, dst) address
//! pairs. Masking everything to /16 would fold distinct networks into
//! one bucket, so this learner records, per /16 supernet, the longest
//! prefix actually configured anywhere in the platform inventory or
//! the IP group resources. Prefixes shorter than /16 are ignored.

use std::collections::HashMap;

use ipnetwork::Ipv4Network;
use tracing::warn;

use tapflow_common::{IpGroupData, PlatformData};

/// Supernet granularity; every bucket key is an address masked to /16
pub const STANDARD_NETMASK: u32 = 0xffff_0000;

/// Per-/16 longest observed netmask. Rebuilds merge with the previous
/// state, so learned masks only ever grow.
#[derive(Debug, Clone, Default)]
pub struct NetmaskMap {
    masks: HashMap<u32, u32>,
}

impl NetmaskMap {
    /// Longest mask learned for the address's /16 bucket, clamped to at
    /// least /16.
    #[inline]
    pub fn mask_for(&self, ip: u32) -> u32 {
        self.masks
            .get(&(ip & STANDARD_NETMASK))
            .copied()
            .unwrap_or(0)
            .max(STANDARD_NETMASK)
    }

    /// Number of learned buckets
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    /// Whether nothing has been learned yet
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    /// New map extended with every address configured on the platform
    /// interfaces.
    pub fn merge_platforms(&self, platforms: &[PlatformData]) -> Self {
        let entries: Vec<(u32, u32)> = platforms
            .iter()
            .flat_map(|platform| platform.ips.iter())
            .filter_map(|net| prefix_to_mask(net.netmask_len).map(|mask| (net.ip, mask)))
            .collect();

        let mut next = self.clone();
        next.learn(&entries);
        next
    }

    /// New map extended with the textual CIDRs of the IP group
    /// resources. Malformed entries are skipped.
    pub fn merge_ip_groups(&self, groups: &[IpGroupData]) -> Self {
        let entries: Vec<(u32, u32)> = groups
            .iter()
            .flat_map(|group| group.ips.iter())
            .filter_map(|raw| parse_cidr(raw))
            .collect();

        let mut next = self.clone();
        next.learn(&entries);
        next
    }

    /// Two passes: seed each /16 bucket with the longest mask seen,
    /// then propagate each bucket's mask down to the more-specific
    /// network keys it implies.
    fn learn(&mut self, entries: &[(u32, u32)]) {
        for &(ip, mask) in entries {
            if mask < STANDARD_NETMASK {
                continue;
            }
            let slot = self.masks.entry(ip & STANDARD_NETMASK).or_insert(0);
            if *slot < mask {
                *slot = mask;
            }
        }

        for &(ip, _) in entries {
            let Some(&mask) = self.masks.get(&(ip & STANDARD_NETMASK)) else {
                continue;
            };
            let net_ip = ip & mask;
            let slot = self.masks.entry(net_ip).or_insert(0);
            if *slot < mask {
                *slot = mask;
            }
        }
    }
}

fn prefix_to_mask(len: u32) -> Option<u32> {
    match len {
        0 => Some(0),
        1..=32 => Some(u32::MAX << (32 - len)),
        _ => None,
    }
}

fn parse_cidr(raw: &str) -> Option<(u32, u32)> {
    if !raw.contains('/') {
        warn!("skipping ip group entry without prefix: {}", raw);
        return None;
    }
    match raw.parse::<Ipv4Network>() {
        Ok(network) => Some((u32::from(network.ip()), u32::from(network.mask()))),
        Err(e) => {
            warn!("skipping unparsable ip group entry {}: {}", raw, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapflow_common::IpNet;

    fn group(ips: &[&str]) -> IpGroupData {
        IpGroupData {
            ips: ips.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_sibling_prefixes_stay_distinguishable() {
        let map = NetmaskMap::default().merge_ip_groups(&[group(&["10.0.0.0/24", "10.0.1.0/24"])]);

        assert_eq!(map.mask_for(0x0a000005), 0xffffff00);
        assert_eq!(0x0a000005 & map.mask_for(0x0a000005), 0x0a000000);
        assert_eq!(0x0a000105 & map.mask_for(0x0a000105), 0x0a000100);
    }

    #[test]
    fn test_unknown_bucket_defaults_to_slash_16() {
        let map = NetmaskMap::default();
        assert_eq!(map.mask_for(0xc0a80101), STANDARD_NETMASK);
    }

    #[test]
    fn test_short_prefixes_are_ignored() {
        let map = NetmaskMap::default().merge_ip_groups(&[group(&["10.0.0.0/8"])]);
        assert!(map.is_empty());
        assert_eq!(map.mask_for(0x0a000001), STANDARD_NETMASK);
    }

    #[test]
    fn test_longest_mask_wins_and_never_shrinks() {
        let map = NetmaskMap::default().merge_ip_groups(&[group(&["10.0.0.0/24"])]);
        assert_eq!(map.mask_for(0x0a000001), 0xffffff00);

        // a shorter prefix for the same bucket cannot regress the mask
        let map = map.merge_ip_groups(&[group(&["10.0.0.0/20"])]);
        assert_eq!(map.mask_for(0x0a000001), 0xffffff00);

        // a longer one upgrades it
        let map = map.merge_ip_groups(&[group(&["10.0.0.0/28"])]);
        assert_eq!(map.mask_for(0x0a000001), 0xfffffff0);
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let input = [group(&["10.0.0.0/24", "192.168.1.0/30"])];
        let once = NetmaskMap::default().merge_ip_groups(&input);
        let twice = once.merge_ip_groups(&input);
        assert_eq!(once.masks, twice.masks);
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let map = NetmaskMap::default().merge_ip_groups(&[group(&[
            "10.0.0.0",
            "10.0.0.0/not-a-number",
            "not-an-ip/24",
            "10.0.0.0/24/7",
            "10.1.0.0/24",
        ])]);

        assert_eq!(map.mask_for(0x0a000001), STANDARD_NETMASK);
        assert_eq!(map.mask_for(0x0a010001), 0xffffff00);
    }

    #[test]
    fn test_platform_input_matches_group_input() {
        let platform = PlatformData {
            ips: vec![
                IpNet {
                    ip: 0x0a000000,
                    netmask_len: 24,
                },
                IpNet {
                    ip: 0x0a000100,
                    netmask_len: 24,
                },
            ],
            ..Default::default()
        };
        let from_platform = NetmaskMap::default().merge_platforms(&[platform]);
        let from_groups =
            NetmaskMap::default().merge_ip_groups(&[group(&["10.0.0.0/24", "10.0.1.0/24"])]);
        assert_eq!(from_platform.masks, from_groups.masks);
    }

    #[test]
    fn test_platform_and_group_learning_merge() {
        let platform = PlatformData {
            ips: vec![IpNet {
                ip: 0x0a000000,
                netmask_len: 24,
            }],
            ..Default::default()
        };
        let map = NetmaskMap::default()
            .merge_platforms(&[platform])
            .merge_ip_groups(&[group(&["192.168.0.0/28"])]);

        assert_eq!(map.mask_for(0x0a000001), 0xffffff00);
        assert_eq!(map.mask_for(0xc0a80001), 0xfffffff0);
    }
}
