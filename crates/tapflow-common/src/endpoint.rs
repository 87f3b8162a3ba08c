//! Endpoint metadata and platform inventory inputs

use std::sync::Arc;

/// Resolved attributes for one side of a packet.
///
/// The group id list is shared behind an `Arc` so that cloning an
/// endpoint into fast-path cache values stays allocation-free.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointInfo {
    /// L2 endpoint context id, 0 when unknown
    pub l2_epc_id: i32,
    /// L3 endpoint context id; -1 marks internet endpoints
    pub l3_epc_id: i32,
    /// Groups this endpoint belongs to
    pub group_ids: Arc<Vec<u32>>,
}

impl EndpointInfo {
    /// Endpoint with the given groups and no EPC context
    pub fn with_groups(group_ids: Vec<u32>) -> Self {
        Self {
            group_ids: Arc::new(group_ids),
            ..Default::default()
        }
    }
}

/// Endpoint attributes for both sides of a packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointData {
    /// Source side
    pub src_info: EndpointInfo,
    /// Destination side
    pub dst_info: EndpointInfo,
}

impl EndpointData {
    /// Same data with source and destination swapped
    pub fn reversed(&self) -> Self {
        Self {
            src_info: self.dst_info.clone(),
            dst_info: self.src_info.clone(),
        }
    }
}

/// One address with its prefix length, as carried by the platform
/// inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNet {
    /// IPv4 address as a host-order integer
    pub ip: u32,
    /// Prefix length in bits, 0..=32
    pub netmask_len: u32,
}

/// Interface description from the platform inventory
#[derive(Debug, Clone, Default)]
pub struct PlatformData {
    /// Interface MAC address
    pub mac: u64,
    /// Addresses configured on the interface
    pub ips: Vec<IpNet>,
    /// Endpoint context the interface belongs to
    pub epc_id: i32,
    /// Interface type discriminator
    pub if_type: u8,
}

/// Named group of textual CIDRs (`a.b.c.d/len`)
#[derive(Debug, Clone, Default)]
pub struct IpGroupData {
    /// CIDR strings; malformed entries are skipped by consumers
    pub ips: Vec<String>,
}
