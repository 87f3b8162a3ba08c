//! Rule and policy types shared by both classifier tiers

use serde::{Deserialize, Serialize};

use crate::error::{TapFlowError, TapFlowResult};

/// Group and EPC ids are truncated to this many bits inside packed keys
pub const GROUP_ID_BITS: u32 = 20;

/// Policy action verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Action {
    /// Allow traffic
    Allow = 0,
    /// Deny traffic
    Deny = 1,
    /// Send to content inspection
    Inspect = 2,
    /// Log only
    Log = 3,
    /// Rate limit
    RateLimit = 4,
    /// Redirect to proxy
    Redirect = 5,
}

impl Default for Action {
    fn default() -> Self {
        Self::Allow
    }
}

/// Direction of a match relative to the rule that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DirectionType {
    /// Query tuple matched the rule as written
    Forward = 1,
    /// Query tuple matched the rule with endpoints swapped
    Backward = 2,
}

impl DirectionType {
    /// The opposite direction
    pub const fn reversed(self) -> Self {
        match self {
            Self::Forward => Self::Backward,
            Self::Backward => Self::Forward,
        }
    }

    const fn bit(self) -> u8 {
        self as u8
    }
}

/// A single action emitted by a matching rule, tagged with the
/// direction(s) it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AclAction {
    /// Rule that emitted this action
    pub acl_id: u32,
    /// Action verb
    pub action: Action,
    directions: u8,
}

impl AclAction {
    /// New forward-tagged action for a rule
    pub const fn new(acl_id: u32, action: Action) -> Self {
        Self {
            acl_id,
            action,
            directions: DirectionType::Forward.bit(),
        }
    }

    /// Same action retagged with exactly `direction`
    pub const fn tagged(self, direction: DirectionType) -> Self {
        Self {
            acl_id: self.acl_id,
            action: self.action,
            directions: direction.bit(),
        }
    }

    /// Same action with forward and backward tags swapped
    pub const fn reversed(self) -> Self {
        let forward = self.directions & DirectionType::Forward.bit();
        let backward = self.directions & DirectionType::Backward.bit();
        Self {
            acl_id: self.acl_id,
            action: self.action,
            directions: (forward << 1) | (backward >> 1),
        }
    }

    /// Whether this action carries the given direction tag
    pub const fn is_tagged(self, direction: DirectionType) -> bool {
        self.directions & direction.bit() != 0
    }
}

/// Merged result of every rule matching one lookup.
///
/// `acl_id` records the first rule merged in; the action list is the
/// union (with duplicates) of all matched rules' actions, each tagged
/// with the direction it matched under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyData {
    /// First matched rule id, 0 when nothing matched yet
    pub acl_id: u32,
    /// Direction-tagged union of matched actions
    pub acl_actions: Vec<AclAction>,
}

/// Sentinel for "no rule matched". The fast path caches this too, so
/// repeated misses for the same fingerprint never re-enter the slow tier.
pub const INVALID_POLICY_DATA: PolicyData = PolicyData {
    acl_id: 0,
    acl_actions: Vec::new(),
};

impl PolicyData {
    /// Union `actions` in, preserving their existing direction tags
    pub fn merge(&mut self, actions: &[AclAction], acl_id: u32) {
        if self.acl_id == 0 {
            self.acl_id = acl_id;
        }
        self.acl_actions.extend_from_slice(actions);
    }

    /// Union `actions` in, retagging every one with `direction`
    pub fn merge_directed(&mut self, actions: &[AclAction], acl_id: u32, direction: DirectionType) {
        if self.acl_id == 0 {
            self.acl_id = acl_id;
        }
        self.acl_actions
            .extend(actions.iter().map(|a| a.tagged(direction)));
    }

    /// Union `actions` in with every direction tag flipped. Used to
    /// derive the backward cache entry from a forward policy.
    pub fn merge_and_swap_direction(&mut self, actions: &[AclAction], acl_id: u32) {
        if self.acl_id == 0 {
            self.acl_id = acl_id;
        }
        self.acl_actions.extend(actions.iter().map(|a| a.reversed()));
    }

    /// False for the no-match sentinel and for cached misses
    pub fn is_valid(&self) -> bool {
        !self.acl_actions.is_empty()
    }
}

/// Capture-point classification. `Any` is only meaningful on rules and
/// expands to every concrete tap at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TapType {
    /// Matches every capture point (rules only)
    Any = 0,
    /// ISP border capture
    Isp = 1,
    /// Spine switch capture
    Spine = 2,
    /// Top-of-rack capture
    Tor = 3,
}

/// First concrete tap index
pub const TAP_MIN: usize = TapType::Isp as usize;
/// One past the last concrete tap index; sizes every per-tap table
pub const TAP_MAX: usize = TapType::Tor as usize + 1;

impl TapType {
    /// Whether this is a concrete capture point (not `Any`)
    pub const fn is_concrete(self) -> bool {
        !matches!(self, Self::Any)
    }

    /// Index into per-tap tables
    pub const fn index(self) -> usize {
        self as usize
    }

    /// All concrete tap types, in index order
    pub fn concrete() -> impl Iterator<Item = TapType> {
        [Self::Isp, Self::Spine, Self::Tor].into_iter()
    }
}

impl Default for TapType {
    fn default() -> Self {
        Self::Any
    }
}

impl TryFrom<u8> for TapType {
    type Error = TapFlowError;

    fn try_from(value: u8) -> TapFlowResult<Self> {
        match value {
            0 => Ok(Self::Any),
            1 => Ok(Self::Isp),
            2 => Ok(Self::Spine),
            3 => Ok(Self::Tor),
            other => Err(TapFlowError::InvalidTapType(other)),
        }
    }
}

/// Access control rule.
///
/// Empty group lists and an empty (or 64K-wide) port list mean
/// wildcard; `proto == 0` and `vlan == 0` are wildcards too.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    /// Rule id as assigned by the rule source
    pub id: u32,
    /// Capture points the rule applies to
    pub tap_type: TapType,
    /// Source endpoint groups, empty for any
    pub src_groups: Vec<u32>,
    /// Destination endpoint groups, empty for any
    pub dst_groups: Vec<u32>,
    /// Destination ports, empty for any
    pub dst_ports: Vec<u16>,
    /// L4 protocol, 0 for any
    pub proto: u8,
    /// VLAN id, 0 for any
    pub vlan: u32,
    /// Actions applied on match
    pub actions: Vec<AclAction>,
}

impl Acl {
    /// Reject rules whose group ids would silently collide once
    /// truncated to the 20-bit packed-key field.
    pub fn validate(&self) -> TapFlowResult<()> {
        for &group in self.src_groups.iter().chain(self.dst_groups.iter()) {
            if group >= 1 << GROUP_ID_BITS {
                return Err(TapFlowError::GroupIdOverflow(group));
            }
        }
        Ok(())
    }
}
