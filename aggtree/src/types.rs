//! Core types and constants for the aggregation protocol.

use alloc::vec::Vec;
use core::fmt;
use core::str::FromStr;

use thiserror::Error;

/// Link-layer address of a node.
pub type Addr = u16;

/// Routing metric of the sink.
pub const RTMETRIC_SINK: u16 = 0;

/// Routing metric of a node with no route to the sink.
pub const RTMETRIC_INFINITE: u16 = u16::MAX;

/// Fixed-point unit of link estimates: one expected transmission.
pub const LINK_ESTIMATE_UNIT: u16 = 8;

/// Data tag marking a keepalive (no contribution).
pub(crate) const KEEPALIVE_TAG: u8 = 0xFF;

/// Role requested when opening a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Joins the tree and forwards toward the sink.
    Router,
    /// Root of the tree; receives aggregate results.
    Sink,
    /// Passive participant. Not supported by this implementation.
    NoRouter,
}

/// Aggregation function applied along the tree.
///
/// Wire ids are stable: sum=0, count=1, avg=2, min=3, max=4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum AggregateFunction {
    #[default]
    Sum = 0,
    Count = 1,
    Avg = 2,
    Min = 3,
    Max = 4,
}

impl AggregateFunction {
    pub const ALL: [AggregateFunction; 5] = [
        AggregateFunction::Sum,
        AggregateFunction::Count,
        AggregateFunction::Avg,
        AggregateFunction::Min,
        AggregateFunction::Max,
    ];

    #[inline]
    pub const fn id(self) -> u8 {
        self as u8
    }

    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(AggregateFunction::Sum),
            1 => Some(AggregateFunction::Count),
            2 => Some(AggregateFunction::Avg),
            3 => Some(AggregateFunction::Min),
            4 => Some(AggregateFunction::Max),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            AggregateFunction::Sum => "sum",
            AggregateFunction::Count => "count",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AggregateFunction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or(Error::UnknownFunction)
    }
}

/// Message received from the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub data: Vec<u8>,
    /// Signal strength in dBm, if the transport reports it.
    pub rssi: Option<i16>,
}

impl Incoming {
    pub fn new(data: Vec<u8>, rssi: Option<i16>) -> Self {
        Self { data, rssi }
    }
}

/// Requests accepted by `Node::run` through the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Submit a local value for the current round.
    Send(i32),
    /// Promote or demote this node as sink.
    SetSink(bool),
    /// Change the aggregate function (sink only).
    SetAggregate(AggregateFunction),
    /// Close the connection and return from `run`.
    Close,
}

/// Events emitted by the node for application handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Committed parent changed.
    ParentChanged { old: Option<Addr>, new: Addr },
    /// Parent lost with no viable replacement.
    Disconnected { old_parent: Addr },
    /// A contribution or packet was dropped.
    Dropped { packet_id: Option<u8>, reason: Error },
    /// A new aggregate function epoch was adopted.
    AggregateChanged { function: AggregateFunction, epoch: u8 },
    /// A command delivered through the command channel failed.
    CommandFailed { error: Error },
}

/// Error type for node operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("not joined to a tree")]
    NotJoined,
    #[error("send queue full")]
    QueueFull,
    #[error("operation requires the sink role")]
    NotSink,
    #[error("retransmissions exhausted after {attempts} attempts")]
    RetransmissionExhausted { attempts: u8 },
    #[error("disconnected from parent")]
    Disconnected,
    #[error("unknown aggregate function")]
    UnknownFunction,
    #[error("unsupported role")]
    UnsupportedRole,
    #[error("connection closed")]
    Closed,
    #[error("message exceeds transport mtu")]
    MessageTooLarge,
}

/// Counters describing protocol activity of one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolMetrics {
    pub frames_sent: u64,
    pub transport_dropped: u64,
    pub decode_failures: u64,
    pub announcements_sent: u64,
    pub probes_sent: u64,
    pub data_sent: u64,
    pub retransmissions: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub stray_acks: u64,
    pub duplicates: u64,
    pub stale_discarded: u64,
    pub ttl_expired: u64,
    pub keepalives_sent: u64,
    pub keepalives_received: u64,
    pub drops_exhausted: u64,
    pub drops_queue_full: u64,
    pub drops_not_joined: u64,
    pub drops_disconnected: u64,
    pub floods_sent: u64,
    pub floods_received: u64,
    pub values_submitted: u64,
    pub results_delivered: u64,
    pub results_suppressed: u64,
}

/// Serial-number comparison (RFC 1982) on 8-bit sequence numbers.
///
/// Returns true if `a` is newer than `b`.
#[inline]
pub fn seq_newer(a: u8, b: u8) -> bool {
    a != b && a.wrapping_sub(b) < 128
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_ids_are_stable() {
        assert_eq!(AggregateFunction::Sum.id(), 0);
        assert_eq!(AggregateFunction::Count.id(), 1);
        assert_eq!(AggregateFunction::Avg.id(), 2);
        assert_eq!(AggregateFunction::Min.id(), 3);
        assert_eq!(AggregateFunction::Max.id(), 4);
        for f in AggregateFunction::ALL {
            assert_eq!(AggregateFunction::from_id(f.id()), Some(f));
        }
        assert_eq!(AggregateFunction::from_id(5), None);
        assert_eq!(AggregateFunction::default(), AggregateFunction::Sum);
    }

    #[test]
    fn test_function_parse() {
        assert_eq!("avg".parse::<AggregateFunction>(), Ok(AggregateFunction::Avg));
        assert_eq!("max".parse::<AggregateFunction>(), Ok(AggregateFunction::Max));
        assert_eq!("median".parse::<AggregateFunction>(), Err(Error::UnknownFunction));
        assert_eq!("SUM".parse::<AggregateFunction>(), Err(Error::UnknownFunction));
    }

    #[test]
    fn test_seq_newer_wraps() {
        assert!(seq_newer(1, 0));
        assert!(!seq_newer(0, 1));
        assert!(!seq_newer(7, 7));
        assert!(seq_newer(0, 255));
        assert!(seq_newer(10, 250));
        assert!(!seq_newer(250, 10));
    }
}
