//! Compile-time protocol configuration.
//!
//! The `NodeConfig` trait fixes memory bounds, wire attribute widths and
//! protocol timing for a node type. Use `DefaultConfig` for radio-scale
//! deployments, `SmallConfig` for constrained MCUs, or implement the trait for
//! custom tuning.
//!
//! # Memory Footprint
//!
//! Approximate RAM usage of the bounded collections:
//! - `MAX_NEIGHBORS * 24` bytes (neighbor entries)
//! - `MAX_CHILDREN * 12` bytes (child freshness)
//! - `SEND_QUEUE_SIZE * 40` bytes (queued records)
//! - `MAX_RECENT_PACKETS * 8` bytes (duplicate suppression)
//!
//! # Disabling Timers
//!
//! Any interval may be set to `Duration::MAX`. The corresponding timer then
//! never fires; only failure detection latency degrades.
//!
//! # Example
//!
//! ```ignore
//! use aggtree::{Duration, NodeConfig};
//!
//! struct FieldConfig;
//! impl NodeConfig for FieldConfig {
//!     const MAX_NEIGHBORS: usize = 16;
//!     const PROBE_INTERVAL: Duration = Duration::MAX; // no proactive probing
//!     // ... other constants
//! }
//!
//! let node = Node::<_, _, _, _, FieldConfig>::open(addr, 130, Role::Router, transport, random, clock, handler)?;
//! ```

use core::marker::PhantomData;

use crate::time::Duration;
use crate::types::LINK_ESTIMATE_UNIT;

/// Configuration trait for memory bounds, wire widths and timing.
///
/// All capacities must be non-zero. Attribute widths must lie in `1..=8`.
pub trait NodeConfig {
    /// Maximum tracked neighbors (parent candidates).
    const MAX_NEIGHBORS: usize;

    /// Maximum tracked children for merge-window decisions.
    const MAX_CHILDREN: usize;

    /// Capacity of the send queue toward the parent.
    const SEND_QUEUE_SIZE: usize;

    /// Remembered (sender, packet id, tree epoch) keys for duplicate suppression.
    const MAX_RECENT_PACKETS: usize;

    /// Bits of the packet id and epacket id attributes.
    const PACKET_ID_BITS: u8 = 8;

    /// Bits of the time-to-live attribute.
    const TTL_BITS: u8 = 4;

    /// Bits of the hop count attribute.
    const HOPS_BITS: u8 = 4;

    /// Bits of the retransmission budget attribute.
    const MAX_REXMIT_BITS: u8 = 5;

    /// Maximum transmission attempts per packet before it is dropped.
    const MAX_REXMITS: u8;

    /// Maximum rtmetric (hop-weighted depth) of a joined node.
    const MAX_DEPTH: u16;

    /// Worst acceptable link estimate (ETX in `LINK_ESTIMATE_UNIT`s) for a parent.
    const MAX_LINK_ESTIMATE: u16;

    /// Merge-window slots: a node at depth `d` waits `max(1, DEPTH_SLOTS - d)` windows.
    const DEPTH_SLOTS: u16;

    /// Extra flood transmissions issued by the sink after a function change.
    const FLOOD_RESENDS: u8;

    /// Period of cost advertisements (jittered by ±25%).
    const ANNOUNCE_INTERVAL: Duration;

    /// Base delay for coalescing proactive announcements and flood relays.
    const PROACTIVE_DELAY: Duration;

    /// Period of soliciting probes.
    const PROBE_INTERVAL: Duration;

    /// Idle period after which a keepalive is sent to the parent.
    const KEEPALIVE_INTERVAL: Duration;

    /// Age after which a silent neighbor (including the parent) is forgotten.
    const NEIGHBOR_TIMEOUT: Duration;

    /// Initial retransmission interval, doubled per attempt.
    const REXMIT_INTERVAL: Duration;

    /// Upper bound for the retransmission backoff.
    const MAX_BACKOFF: Duration;

    /// Stability period before a better parent is committed.
    const HOLD_DOWN: Duration;

    /// Length of one merge-window slot.
    const MERGE_WINDOW: Duration;

    /// Spacing of the sink's flood resends.
    const FLOOD_RESEND_INTERVAL: Duration;
}

/// Default configuration for radio-scale deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConfig;

impl NodeConfig for DefaultConfig {
    const MAX_NEIGHBORS: usize = 32;
    const MAX_CHILDREN: usize = 16;
    const SEND_QUEUE_SIZE: usize = 8;
    const MAX_RECENT_PACKETS: usize = 64;
    const MAX_REXMITS: u8 = 15;
    const MAX_DEPTH: u16 = 15;
    const MAX_LINK_ESTIMATE: u16 = 6 * LINK_ESTIMATE_UNIT;
    const DEPTH_SLOTS: u16 = 8;
    const FLOOD_RESENDS: u8 = 2;
    const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(16);
    const PROACTIVE_DELAY: Duration = Duration::from_millis(500);
    const PROBE_INTERVAL: Duration = Duration::from_secs(60);
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
    const NEIGHBOR_TIMEOUT: Duration = Duration::from_secs(90);
    const REXMIT_INTERVAL: Duration = Duration::from_secs(1);
    const MAX_BACKOFF: Duration = Duration::from_secs(8);
    const HOLD_DOWN: Duration = Duration::from_secs(4);
    const MERGE_WINDOW: Duration = Duration::from_millis(500);
    const FLOOD_RESEND_INTERVAL: Duration = Duration::from_secs(4);
}

/// Small configuration for constrained MCUs.
///
/// Same timing as `DefaultConfig`, tighter collections and narrower
/// packet ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmallConfig;

impl NodeConfig for SmallConfig {
    const MAX_NEIGHBORS: usize = 8;
    const MAX_CHILDREN: usize = 4;
    const SEND_QUEUE_SIZE: usize = 2;
    const MAX_RECENT_PACKETS: usize = 16;
    const PACKET_ID_BITS: u8 = 6;
    const MAX_REXMIT_BITS: u8 = 4;
    const MAX_REXMITS: u8 = 8;
    const MAX_DEPTH: u16 = 15;
    const MAX_LINK_ESTIMATE: u16 = 6 * LINK_ESTIMATE_UNIT;
    const DEPTH_SLOTS: u16 = 8;
    const FLOOD_RESENDS: u8 = 1;
    const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(16);
    const PROACTIVE_DELAY: Duration = Duration::from_millis(500);
    const PROBE_INTERVAL: Duration = Duration::from_secs(60);
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
    const NEIGHBOR_TIMEOUT: Duration = Duration::from_secs(90);
    const REXMIT_INTERVAL: Duration = Duration::from_secs(1);
    const MAX_BACKOFF: Duration = Duration::from_secs(8);
    const HOLD_DOWN: Duration = Duration::from_secs(4);
    const MERGE_WINDOW: Duration = Duration::from_millis(500);
    const FLOOD_RESEND_INTERVAL: Duration = Duration::from_secs(4);
}

/// Post-monomorphization consistency checks for a configuration.
///
/// Referencing `ConfigCheck::<Cfg>::VALID` turns an inconsistent
/// configuration into a compile error.
pub(crate) struct ConfigCheck<Cfg>(PhantomData<Cfg>);

impl<Cfg: NodeConfig> ConfigCheck<Cfg> {
    pub(crate) const VALID: () = {
        assert!(Cfg::MAX_NEIGHBORS > 0, "MAX_NEIGHBORS must be non-zero");
        assert!(Cfg::MAX_CHILDREN > 0, "MAX_CHILDREN must be non-zero");
        assert!(Cfg::SEND_QUEUE_SIZE > 0, "SEND_QUEUE_SIZE must be non-zero");
        assert!(Cfg::MAX_RECENT_PACKETS > 0, "MAX_RECENT_PACKETS must be non-zero");
        assert!(
            Cfg::PACKET_ID_BITS >= 1 && Cfg::PACKET_ID_BITS <= 8,
            "PACKET_ID_BITS must be within 1..=8"
        );
        assert!(Cfg::TTL_BITS >= 1 && Cfg::TTL_BITS <= 8, "TTL_BITS must be within 1..=8");
        assert!(Cfg::HOPS_BITS >= 1 && Cfg::HOPS_BITS <= 8, "HOPS_BITS must be within 1..=8");
        assert!(
            Cfg::MAX_REXMIT_BITS >= 1 && Cfg::MAX_REXMIT_BITS <= 8,
            "MAX_REXMIT_BITS must be within 1..=8"
        );
        assert!(
            Cfg::MAX_REXMITS >= 1 && (Cfg::MAX_REXMITS as u16) < (1u16 << Cfg::MAX_REXMIT_BITS),
            "MAX_REXMITS must fit the retransmission budget attribute"
        );
        assert!(
            Cfg::MAX_DEPTH >= 1 && Cfg::MAX_DEPTH < (1u16 << Cfg::TTL_BITS),
            "MAX_DEPTH must fit the time-to-live attribute"
        );
    };
}

/// Largest value representable in a field of `bits` bits (`bits` in `1..=8`).
#[inline]
pub const fn field_max(bits: u8) -> u8 {
    if bits >= 8 {
        u8::MAX
    } else {
        (1u8 << bits) - 1
    }
}

#[cfg(test)]
pub(crate) use tests::TestConfig;
