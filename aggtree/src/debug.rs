//! Debug events for protocol tracing.
//!
//! Every event is logged through `tracing` at trace level. With the `debug`
//! feature the node also queues them on a bounded channel that simulators
//! drain after each step; a full channel drops new events.

use embassy_sync::channel::Channel;

use crate::traits::ChannelMutex;
use crate::types::{Addr, AggregateFunction};

/// Queue size for the debug channel.
pub(crate) const DEBUG_QUEUE_SIZE: usize = 64;

/// Debug event channel.
pub type DebugChannel = Channel<ChannelMutex, DebugEvent, DEBUG_QUEUE_SIZE>;

/// Debug events emitted by the node for protocol tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugEvent {
    AnnounceSent {
        rtmetric: u16,
        solicit: bool,
    },
    AnnounceReceived {
        from: Addr,
        rtmetric: u16,
    },
    /// A better parent entered hold-down.
    ParentCandidate {
        candidate: Addr,
        rtmetric: u16,
    },
    ParentCommitted {
        parent: Addr,
        rtmetric: u16,
    },
    Disconnected {
        old_parent: Addr,
        eseqno: u8,
    },
    NeighborExpired {
        addr: Addr,
    },
    DataSent {
        to: Addr,
        packet_id: u8,
        transmission: u8,
    },
    AckReceived {
        from: Addr,
        packet_id: u8,
    },
    DuplicateDiscarded {
        from: Addr,
        packet_id: u8,
    },
    StaleDiscarded {
        from: Addr,
        epoch: u8,
        current: u8,
    },
    PacketDropped {
        packet_id: u8,
        transmissions: u8,
    },
    KeepaliveQueued {
        packet_id: u8,
    },
    RoundStarted {
        epoch: u8,
        window_ms: u64,
    },
    RoundForwarded {
        epoch: u8,
        packet_id: u8,
        ttl: u8,
        hops: u8,
    },
    ResultDelivered {
        function: AggregateFunction,
        value: i32,
    },
    ControlAdopted {
        seqno: u8,
        function: AggregateFunction,
    },
    FloodSent {
        seqno: u8,
        hops: u8,
    },
    MessageDecodeFailed {
        data_len: usize,
    },
}
