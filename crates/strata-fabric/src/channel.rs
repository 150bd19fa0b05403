//! Fabric channels: independent traffic-class multiplexing domains.
//!
//! Every channel owns its own receive workers and sockets, so a bulk
//! migration burst cannot head-of-line-block latency-sensitive replica
//! writes. Channel resources are bounded per channel, not per peer, keeping
//! total usage O(channels) at full cluster size.

use std::fmt;

/// Upper bound on receive workers servicing one channel.
pub const MAX_CHANNEL_RECV_WORKERS: usize = 128;

/// Upper bound on sockets (inbound + outbound) open on one channel.
pub const MAX_CHANNEL_SOCKETS: usize = 128;

/// The four fabric traffic classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FabricChannel {
    /// Duplicate resolution and replica writes (latency sensitive).
    Rw = 0,
    /// Clustering, migration control, and transact coordination.
    Ctrl = 1,
    /// Bulk record migration.
    Bulk = 2,
    /// System metadata distribution.
    Meta = 3,
}

impl FabricChannel {
    /// Number of fabric channels.
    pub const COUNT: usize = 4;

    /// All channels, in wire-tag order.
    pub const ALL: [FabricChannel; Self::COUNT] = [
        FabricChannel::Rw,
        FabricChannel::Ctrl,
        FabricChannel::Bulk,
        FabricChannel::Meta,
    ];

    /// Index of this channel into per-channel arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Wire tag carried in frame headers and connection preambles.
    pub fn wire_tag(self) -> u8 {
        self as u8
    }

    /// Decodes a wire tag; returns `None` for tags outside the channel set.
    pub fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(FabricChannel::Rw),
            1 => Some(FabricChannel::Ctrl),
            2 => Some(FabricChannel::Bulk),
            3 => Some(FabricChannel::Meta),
            _ => None,
        }
    }
}

impl fmt::Display for FabricChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FabricChannel::Rw => "rw",
            FabricChannel::Ctrl => "ctrl",
            FabricChannel::Bulk => "bulk",
            FabricChannel::Meta => "meta",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_tag_roundtrip() {
        for channel in FabricChannel::ALL {
            assert_eq!(FabricChannel::from_wire_tag(channel.wire_tag()), Some(channel));
        }
    }

    #[test]
    fn test_unknown_wire_tag_rejected() {
        assert_eq!(FabricChannel::from_wire_tag(4), None);
        assert_eq!(FabricChannel::from_wire_tag(255), None);
    }

    #[test]
    fn test_indexes_are_dense() {
        for (i, channel) in FabricChannel::ALL.iter().enumerate() {
            assert_eq!(channel.index(), i);
        }
    }

    #[test]
    fn test_display_names() {
        assert_eq!(FabricChannel::Rw.to_string(), "rw");
        assert_eq!(FabricChannel::Ctrl.to_string(), "ctrl");
        assert_eq!(FabricChannel::Bulk.to_string(), "bulk");
        assert_eq!(FabricChannel::Meta.to_string(), "meta");
    }
}
