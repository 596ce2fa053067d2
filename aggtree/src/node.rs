//! Node implementation - the protocol state machine of one connection.
//!
//! The Node struct holds all protocol state and provides an async `run()`
//! method that drives the protocol. It is fully event-driven:
//! - Incoming transport frames trigger tree, forwarding and control handling
//! - Application commands trigger local submissions and sink operations
//! - Internal timers trigger announcements, retransmissions and round flushes
//!
//! The synchronous handlers (`handle_transport_rx`, `handle_command`,
//! `handle_timer`) take an explicit `now` so simulators can drive a node
//! without an executor.
//!
//! # Usage
//!
//! ```ignore
//! let mut node = Node::<_, _, _, _, DefaultConfig>::open(
//!     addr, 130, Role::Router, transport, random, clock, handler,
//! )?;
//!
//! // Submit a reading from another task
//! node.commands().send(Command::Send(reading)).await;
//!
//! // Drive the protocol until closed
//! node.run().await;
//! ```

use core::marker::PhantomData;

use embassy_sync::channel::Channel;
use tracing::{debug, info, trace};

use crate::aggregate::Aggregator;
use crate::config::{ConfigCheck, DefaultConfig, NodeConfig};
use crate::control::ControlState;
use crate::debug::DebugEvent;
use crate::forward::ForwardState;
use crate::time::{Duration, TimerKind, Timers, Timestamp};
use crate::traits::{Clock, CommandChannel, EventChannel, Random, ResultHandler, Transport};
use crate::tree::TreeState;
use crate::types::{Addr, Command, Error, Event, ProtocolMetrics, Role};
use crate::wire::{AttrWidths, Frame, Message};

#[cfg(feature = "debug")]
use crate::debug::DebugChannel;

/// Wake interval of `run()` when no timer is armed.
const IDLE_WAKE: Duration = Duration::from_secs(60);

/// One aggregation connection: tree membership, forwarding, aggregation and
/// control state on a single channel.
///
/// Generic over:
/// - `T`: Transport
/// - `R`: Random
/// - `Clk`: Clock
/// - `H`: ResultHandler receiving sink results
/// - `Cfg`: NodeConfig (defaults to `DefaultConfig`)
pub struct Node<T, R, Clk, H, Cfg = DefaultConfig> {
    pub(crate) transport: T,
    pub(crate) random: R,
    pub(crate) clock: Clk,
    pub(crate) handler: H,
    pub(crate) commands: CommandChannel,
    pub(crate) events: EventChannel,
    #[cfg(feature = "debug")]
    pub(crate) debug: DebugChannel,

    pub(crate) addr: Addr,
    pub(crate) channel: u16,
    pub(crate) is_sink: bool,
    pub(crate) open: bool,

    pub(crate) timers: Timers,
    pub(crate) tree: TreeState,
    pub(crate) forward: ForwardState,
    pub(crate) aggregator: Aggregator,
    pub(crate) control: ControlState,
    pub(crate) metrics: ProtocolMetrics,

    _config: PhantomData<Cfg>,
}

impl<T, R, Clk, H, Cfg> Node<T, R, Clk, H, Cfg>
where
    T: Transport,
    R: Random,
    Clk: Clock,
    H: ResultHandler,
    Cfg: NodeConfig,
{
    /// Open a connection on `channel`.
    ///
    /// Broadcasts the first announcement immediately and arms the periodic
    /// timers. A sink starts at rtmetric 0; a router starts disconnected.
    pub fn open(
        addr: Addr,
        channel: u16,
        role: Role,
        transport: T,
        random: R,
        clock: Clk,
        handler: H,
    ) -> Result<Self, Error> {
        let () = ConfigCheck::<Cfg>::VALID;

        let is_sink = match role {
            Role::Router => false,
            Role::Sink => true,
            Role::NoRouter => return Err(Error::UnsupportedRole),
        };

        let now = clock.now();
        let mut node = Self {
            transport,
            random,
            clock,
            handler,
            commands: Channel::new(),
            events: Channel::new(),
            #[cfg(feature = "debug")]
            debug: Channel::new(),
            addr,
            channel,
            is_sink,
            open: true,
            timers: Timers::new(),
            tree: TreeState::new(Cfg::MAX_NEIGHBORS, Cfg::MAX_CHILDREN),
            forward: ForwardState::new(Cfg::SEND_QUEUE_SIZE, Cfg::MAX_RECENT_PACKETS),
            aggregator: Aggregator::new(),
            control: ControlState::new(is_sink),
            metrics: ProtocolMetrics::default(),
            _config: PhantomData,
        };
        node.start(now);
        Ok(node)
    }

    fn start(&mut self, now: Timestamp) {
        self.refresh_rtmetric(now);
        self.send_announce(false);
        self.schedule_announce(now);
        let probe = self.jittered(Cfg::PROBE_INTERVAL);
        self.timers.arm_after(TimerKind::Probe, now, probe);
        self.timers
            .arm_after(TimerKind::Keepalive, now, Cfg::KEEPALIVE_INTERVAL);
        info!(
            node = self.addr,
            channel = self.channel,
            sink = self.is_sink,
            "connection opened"
        );
    }

    /// Close the connection.
    ///
    /// Cancels every timer and discards queued packets and round state.
    /// Afterwards every operation returns `Error::Closed` and incoming frames
    /// are ignored.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.timers.cancel_all();
        self.forward.queue.clear();
        self.forward.recent.clear();
        self.tree.clear();
        let (function, epoch) = (self.aggregator.function(), self.aggregator.epoch());
        self.aggregator.reset(function, epoch);
        self.control.pending_flood = None;
        info!(node = self.addr, channel = self.channel, "connection closed");
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    pub fn is_sink(&self) -> bool {
        self.is_sink
    }

    pub fn commands(&self) -> &CommandChannel {
        &self.commands
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    #[cfg(feature = "debug")]
    pub fn debug_channel(&self) -> &DebugChannel {
        &self.debug
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn clock(&self) -> &Clk {
        &self.clock
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn metrics(&self) -> &ProtocolMetrics {
        &self.metrics
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    /// Earliest time at which `handle_timer` has work to do.
    pub fn next_wakeup(&self) -> Option<Timestamp> {
        if !self.open {
            return None;
        }
        let neighbor_expiry = self.tree.neighbors.next_expiry(Cfg::NEIGHBOR_TIMEOUT);
        match (self.timers.next_deadline(), neighbor_expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run the node's main loop until the connection is closed.
    ///
    /// Handles incoming frames, commands from `commands()` and timers.
    /// Call this from an async task/executor.
    pub async fn run(&mut self) {
        use embassy_futures::select::{select3, Either3};

        while self.open {
            let wake = self
                .next_wakeup()
                .unwrap_or_else(|| self.clock.now().saturating_add(IDLE_WAKE));

            let result = select3(
                self.transport.incoming().receive(),
                self.commands.receive(),
                self.clock.sleep_until(wake),
            )
            .await;

            match result {
                Either3::First(msg) => {
                    let now = self.clock.now();
                    self.handle_transport_rx(&msg.data, msg.rssi, now);
                }
                Either3::Second(command) => {
                    let now = self.clock.now();
                    self.handle_command(command, now);
                }
                Either3::Third(()) => {
                    let now = self.clock.now();
                    self.handle_timer(now);
                }
            }
        }
    }

    /// Handle a received frame.
    pub fn handle_transport_rx(&mut self, data: &[u8], rssi: Option<i16>, now: Timestamp) {
        if !self.open {
            return;
        }
        let frame = match Frame::decode(data, &AttrWidths::of::<Cfg>()) {
            Ok(frame) => frame,
            Err(err) => {
                self.metrics.decode_failures += 1;
                debug!(node = self.addr, error = %err, len = data.len(), "undecodable frame");
                self.debug_event(DebugEvent::MessageDecodeFailed {
                    data_len: data.len(),
                });
                return;
            }
        };
        if frame.channel != self.channel {
            return;
        }
        match frame.message {
            Message::Announce(announce) => self.handle_announce(announce, rssi, now),
            Message::Unicast(unicast) => self.handle_unicast(unicast, now),
            Message::Flood(flood) => self.handle_flood(flood, now),
        }
    }

    /// Handle a command. Failures are reported as `Event::CommandFailed`.
    pub fn handle_command(&mut self, command: Command, now: Timestamp) {
        let result = match command {
            Command::Send(value) => self.submit(value, now),
            Command::SetSink(sink) => self.set_sink_at(sink, now),
            Command::SetAggregate(function) => self.set_aggregate_function_at(function, now),
            Command::Close => {
                self.close();
                Ok(())
            }
        };
        if let Err(error) = result {
            debug!(node = self.addr, ?command, error = %error, "command failed");
            self.push_event(Event::CommandFailed { error });
        }
    }

    /// Handle every timer due at `now`.
    pub fn handle_timer(&mut self, now: Timestamp) {
        if !self.open {
            return;
        }
        self.expire_neighbors(now);

        let expired = self.timers.take_expired(now);
        for kind in expired.iter() {
            // A handler earlier in this pass may have re-armed the timer
            if self.timers.is_armed(kind) || !self.open {
                continue;
            }
            match kind {
                TimerKind::Announce => self.handle_announce_timer(now),
                TimerKind::Probe => self.handle_probe_timer(now),
                TimerKind::Keepalive => self.handle_keepalive_timer(now),
                TimerKind::Retransmit => self.handle_retransmit_timer(now),
                TimerKind::HoldDown => self.handle_hold_down_timer(now),
                TimerKind::MergeWindow => self.flush_round(now),
                TimerKind::Flood => self.handle_flood_timer(now),
            }
        }
    }

    pub(crate) fn push_event(&mut self, event: Event) {
        let _ = self.events.try_send(event);
    }

    pub(crate) fn debug_event(&self, event: DebugEvent) {
        trace!(node = self.addr, ?event, "protocol event");
        #[cfg(feature = "debug")]
        let _ = self.debug.try_send(event);
    }

    /// Encode and queue a frame on the transport.
    pub(crate) fn transmit(&mut self, message: Message) -> Result<(), Error> {
        let frame = Frame {
            channel: self.channel,
            message,
        };
        let bytes = frame.encode(&AttrWidths::of::<Cfg>());
        if bytes.len() > self.transport.mtu() {
            self.metrics.transport_dropped += 1;
            return Err(Error::MessageTooLarge);
        }
        match self.transport.outgoing().try_send(bytes) {
            Ok(()) => {
                self.metrics.frames_sent += 1;
                Ok(())
            }
            Err(_) => {
                self.metrics.transport_dropped += 1;
                debug!(node = self.addr, "transport queue full, frame dropped");
                Err(Error::QueueFull)
            }
        }
    }

    /// `interval` jittered uniformly by ±25%. `Duration::MAX` stays disabled.
    pub(crate) fn jittered(&mut self, interval: Duration) -> Duration {
        if interval == Duration::MAX {
            return interval;
        }
        let ms = interval.as_millis();
        let quarter = ms / 4;
        let offset = self.random.gen_range(0, 2 * quarter + 1);
        Duration::from_millis(ms - quarter + offset)
    }

    /// Random delay in `[base, 2 * base)`.
    pub(crate) fn coalescing_delay(&mut self, base: Duration) -> Duration {
        let ms = base.as_millis();
        let extra = self.random.gen_range(0, ms.max(1));
        base.saturating_add(Duration::from_millis(extra))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use alloc::vec::Vec;

    use super::*;
    use crate::aggregate::Partial;
    use crate::config::TestConfig;
    use crate::traits::test_impls::{MockClock, MockRandom, MockTransport, ResultLog};
    use crate::types::AggregateFunction;
    use crate::wire::{Announce, Attributes, DataBody, Unicast, UnicastBody};

    pub(crate) const CHANNEL: u16 = 130;

    pub(crate) type TestNode = Node<MockTransport, MockRandom, MockClock, ResultLog, TestConfig>;

    pub(crate) fn open_node(addr: Addr, role: Role) -> TestNode {
        Node::open(
            addr,
            CHANNEL,
            role,
            MockTransport::new(),
            MockRandom::with_seed(u64::from(addr)),
            MockClock::new(),
            ResultLog::new(),
        )
        .unwrap()
    }

    pub(crate) fn widths() -> AttrWidths {
        AttrWidths::of::<TestConfig>()
    }

    pub(crate) fn announce(sender: Addr, rtmetric: u16, parent: Option<Addr>) -> Vec<u8> {
        Frame {
            channel: CHANNEL,
            message: Message::Announce(Announce {
                sender,
                rtmetric,
                parent,
                solicit: false,
                control_seqno: 0,
                function: AggregateFunction::Sum,
            }),
        }
        .encode(&widths())
    }

    pub(crate) fn data(
        sender: Addr,
        receiver: Addr,
        packet_id: u8,
        aggregate_epoch: u8,
        contribution: Option<Partial>,
    ) -> Vec<u8> {
        Frame {
            channel: CHANNEL,
            message: Message::Unicast(Unicast {
                sender,
                receiver,
                attrs: Attributes {
                    esender: sender,
                    epacket_id: 1,
                    packet_id,
                    ttl: 15,
                    hops: 0,
                    max_rexmit: 3,
                },
                body: UnicastBody::Data(DataBody {
                    tree_epoch: 0,
                    aggregate_epoch,
                    contribution,
                }),
            }),
        }
        .encode(&widths())
    }

    /// Advance the clock to `at` and process timers.
    pub(crate) fn advance_to(node: &mut TestNode, at: Timestamp) {
        node.clock.set(at);
        node.handle_timer(at);
    }

    /// Step through every wakeup up to and including `until`.
    pub(crate) fn run_until(node: &mut TestNode, until: Timestamp) {
        while let Some(wake) = node.next_wakeup() {
            if wake > until {
                break;
            }
            advance_to(node, wake);
        }
        node.clock.set(until);
    }

    /// Drain and decode every frame the node queued.
    pub(crate) fn sent(node: &TestNode) -> Vec<Message> {
        node.transport
            .take_sent()
            .iter()
            .filter_map(|bytes| Frame::decode(bytes, &widths()).ok())
            .map(|frame| frame.message)
            .collect()
    }

    pub(crate) fn events(node: &TestNode) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = node.events.try_receive() {
            events.push(event);
        }
        events
    }

    /// Join `node` under `parent` (advertising `rtmetric`) once hold-down passes.
    pub(crate) fn join(node: &mut TestNode, parent: Addr, rtmetric: u16) {
        let now = node.clock.now();
        node.handle_transport_rx(&announce(parent, rtmetric, None), None, now);
        advance_to(node, now.saturating_add(TestConfig::HOLD_DOWN));
        assert_eq!(node.parent(), Some(parent));
        sent(node);
        events(node);
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::config::TestConfig;
    use crate::traits::test_impls::{MockClock, MockRandom, MockTransport, ResultLog};
    use crate::types::{AggregateFunction, RTMETRIC_INFINITE};

    #[test]
    fn test_open_announces_immediately() {
        let node = open_node(1, Role::Sink);
        assert!(node.is_open());
        assert!(node.is_sink());
        assert_eq!(node.rtmetric(), 0);

        let frames = sent(&node);
        assert_eq!(frames.len(), 1);
        let Message::Announce(a) = frames[0] else {
            panic!("expected announce");
        };
        assert_eq!(a.sender, 1);
        assert_eq!(a.rtmetric, 0);
        assert_eq!(a.parent, None);
        assert!(node.timers().is_armed(TimerKind::Announce));
        assert!(node.timers().is_armed(TimerKind::Probe));
    }

    #[test]
    fn test_router_starts_disconnected() {
        let mut node = open_node(2, Role::Router);
        assert_eq!(node.parent(), None);
        assert_eq!(node.rtmetric(), RTMETRIC_INFINITE);
        assert_eq!(node.send(5), Err(Error::NotJoined));
    }

    #[test]
    fn test_no_router_role_rejected() {
        let result = Node::<_, _, _, _, TestConfig>::open(
            3,
            CHANNEL,
            Role::NoRouter,
            MockTransport::new(),
            MockRandom::new(),
            MockClock::new(),
            ResultLog::new(),
        );
        assert!(matches!(result, Err(Error::UnsupportedRole)));
    }

    #[test]
    fn test_close_cancels_everything() {
        let mut node = open_node(2, Role::Router);
        join(&mut node, 1, 0);
        node.send(7).unwrap();
        assert_eq!(node.queue_len(), 1);

        node.close();
        assert!(!node.is_open());
        assert_eq!(node.next_wakeup(), None);
        assert_eq!(node.queue_len(), 0);
        assert_eq!(node.parent(), None);
        assert_eq!(node.send(1), Err(Error::Closed));
        assert_eq!(
            node.set_aggregate_function(AggregateFunction::Max),
            Err(Error::Closed)
        );

        // Frames after close are ignored
        sent(&node);
        node.handle_transport_rx(&announce(1, 0, None), None, Timestamp::from_secs(9));
        node.handle_timer(Timestamp::from_secs(60));
        assert!(sent(&node).is_empty());
    }

    #[test]
    fn test_other_channel_ignored() {
        let mut node = open_node(2, Role::Router);
        let mut frame = announce(1, 0, None);
        frame[1] = frame[1].wrapping_add(1);
        node.handle_transport_rx(&frame, None, Timestamp::ZERO);
        assert!(node.neighbors().is_empty());
    }

    #[test]
    fn test_undecodable_frame_counted() {
        let mut node = open_node(2, Role::Router);
        node.handle_transport_rx(&[0, 130, 0x7F], None, Timestamp::ZERO);
        assert_eq!(node.metrics().decode_failures, 1);
    }

    #[test]
    fn test_commands_report_failures() {
        let mut node = open_node(2, Role::Router);
        node.handle_command(Command::Send(3), Timestamp::ZERO);
        node.handle_command(Command::SetAggregate(AggregateFunction::Max), Timestamp::ZERO);
        assert_eq!(
            events(&node),
            [
                Event::CommandFailed {
                    error: Error::NotJoined
                },
                Event::CommandFailed {
                    error: Error::NotSink
                },
            ]
        );

        node.handle_command(Command::Close, Timestamp::ZERO);
        assert!(!node.is_open());
    }

    #[test]
    fn test_run_returns_after_close_command() {
        let mut node = open_node(1, Role::Sink);
        node.commands().try_send(Command::Close).unwrap();
        embassy_futures::block_on(node.run());
        assert!(!node.is_open());
    }

    #[test]
    fn test_jitter_bounds() {
        let mut node = open_node(1, Role::Sink);
        for _ in 0..50 {
            let d = node.jittered(Duration::from_millis(1000));
            assert!(d >= Duration::from_millis(750) && d <= Duration::from_millis(1250));
            let c = node.coalescing_delay(Duration::from_millis(20));
            assert!(c >= Duration::from_millis(20) && c < Duration::from_millis(40));
        }
        assert_eq!(node.jittered(Duration::MAX), Duration::MAX);
    }
}
