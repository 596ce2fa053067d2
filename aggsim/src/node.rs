//! SimNode wrapper for simulated aggtree nodes.

use std::cell::Cell;
use std::future::{ready, Ready};

use aggtree::debug::DebugEvent;
use aggtree::traits::test_impls::ResultLog;
use aggtree::traits::{TransportInChannel, TransportOutChannel};
use aggtree::{
    Addr, AggregateFunction, Clock, Command, Duration, Error, Event, Node, NodeConfig, Random,
    Role, Timestamp, Transport, LINK_ESTIMATE_UNIT,
};
use embassy_sync::channel::Channel;

/// Channel every simulated node opens.
pub const SIM_CHANNEL: u16 = 130;

/// Protocol timings scaled down so scenarios settle within seconds of
/// simulated time.
pub struct SimConfig;

impl NodeConfig for SimConfig {
    const MAX_NEIGHBORS: usize = 8;
    const MAX_CHILDREN: usize = 8;
    const SEND_QUEUE_SIZE: usize = 4;
    const MAX_RECENT_PACKETS: usize = 16;
    const MAX_REXMITS: u8 = 4;
    const MAX_DEPTH: u16 = 15;
    const MAX_LINK_ESTIMATE: u16 = 4 * LINK_ESTIMATE_UNIT;
    const DEPTH_SLOTS: u16 = 4;
    const FLOOD_RESENDS: u8 = 1;
    const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);
    const PROACTIVE_DELAY: Duration = Duration::from_millis(20);
    const PROBE_INTERVAL: Duration = Duration::from_secs(5);
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);
    const NEIGHBOR_TIMEOUT: Duration = Duration::from_millis(3500);
    const REXMIT_INTERVAL: Duration = Duration::from_millis(100);
    const MAX_BACKOFF: Duration = Duration::from_millis(800);
    const HOLD_DOWN: Duration = Duration::from_millis(300);
    const MERGE_WINDOW: Duration = Duration::from_millis(150);
    const FLOOD_RESEND_INTERVAL: Duration = Duration::from_millis(200);
}

/// Transport whose frames are moved by the simulator.
pub struct SimTransport {
    mtu: usize,
    min_rssi: Option<i16>,
    outgoing: TransportOutChannel,
    incoming: TransportInChannel,
}

impl SimTransport {
    pub fn new() -> Self {
        Self {
            mtu: 127,
            min_rssi: None,
            outgoing: Channel::new(),
            incoming: Channel::new(),
        }
    }

    /// Refuse parents heard below `min_rssi` dBm.
    pub fn with_min_rssi(mut self, min_rssi: i16) -> Self {
        self.min_rssi = Some(min_rssi);
        self
    }

    /// Take every frame the node queued for transmission.
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outgoing.try_receive() {
            frames.push(frame);
        }
        frames
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimTransport {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn outgoing(&self) -> &TransportOutChannel {
        &self.outgoing
    }

    fn incoming(&self) -> &TransportInChannel {
        &self.incoming
    }

    fn is_acceptable_rssi(&self, rssi: Option<i16>) -> bool {
        match (self.min_rssi, rssi) {
            (Some(min), Some(rssi)) => rssi >= min,
            _ => true,
        }
    }
}

/// Clock driven by the simulator.
pub struct SimClock {
    current: Cell<Timestamp>,
}

impl SimClock {
    pub fn at(time: Timestamp) -> Self {
        Self {
            current: Cell::new(time),
        }
    }

    pub fn set(&self, time: Timestamp) {
        self.current.set(time);
    }
}

impl Clock for SimClock {
    type SleepFuture<'a> = Ready<()>;

    fn now(&self) -> Timestamp {
        self.current.get()
    }

    fn sleep_until(&self, _time: Timestamp) -> Self::SleepFuture<'_> {
        ready(())
    }
}

/// Deterministic LCG randomness.
pub struct SimRandom {
    state: u64,
}

impl SimRandom {
    pub fn with_seed(seed: u64) -> Self {
        Self { state: seed }
    }
}

impl Random for SimRandom {
    fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let range = max.saturating_sub(min);
        if range == 0 {
            return min;
        }
        min + (self.state >> 33) % range
    }
}

pub type SimNodeInner = Node<SimTransport, SimRandom, SimClock, ResultLog, SimConfig>;

/// A node in the simulation.
///
/// Every entry point first moves the node's clock to the simulated time so
/// code reading `clock.now()` agrees with the `now` passed to handlers.
pub struct SimNode {
    inner: SimNodeInner,
    pub created_at: Timestamp,
}

impl SimNode {
    pub fn new(addr: Addr, role: Role, seed: u64, created_at: Timestamp) -> Result<Self, Error> {
        Self::with_transport(addr, role, seed, created_at, SimTransport::new())
    }

    pub fn with_transport(
        addr: Addr,
        role: Role,
        seed: u64,
        created_at: Timestamp,
        transport: SimTransport,
    ) -> Result<Self, Error> {
        let inner = Node::open(
            addr,
            SIM_CHANNEL,
            role,
            transport,
            SimRandom::with_seed(seed),
            SimClock::at(created_at),
            ResultLog::new(),
        )?;
        Ok(Self { inner, created_at })
    }

    pub fn addr(&self) -> Addr {
        self.inner.addr()
    }

    pub fn inner(&self) -> &SimNodeInner {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut SimNodeInner {
        &mut self.inner
    }

    pub fn is_sink(&self) -> bool {
        self.inner.is_sink()
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub fn parent(&self) -> Option<Addr> {
        self.inner.parent()
    }

    pub fn rtmetric(&self) -> u16 {
        self.inner.rtmetric()
    }

    pub fn children_count(&self) -> usize {
        self.inner.children_count()
    }

    pub fn aggregate_function(&self) -> AggregateFunction {
        self.inner.aggregate_function()
    }

    pub fn next_wakeup(&self) -> Option<Timestamp> {
        self.inner.next_wakeup()
    }

    pub fn handle_transport_rx(&mut self, data: &[u8], rssi: Option<i16>, now: Timestamp) {
        self.inner.clock().set(now);
        self.inner.handle_transport_rx(data, rssi, now);
    }

    pub fn handle_timer(&mut self, now: Timestamp) {
        self.inner.clock().set(now);
        self.inner.handle_timer(now);
    }

    pub fn handle_command(&mut self, command: Command, now: Timestamp) {
        self.inner.clock().set(now);
        self.inner.handle_command(command, now);
    }

    /// Submit a value, reporting the outcome directly.
    pub fn send(&mut self, value: i32, now: Timestamp) -> Result<(), Error> {
        self.inner.clock().set(now);
        self.inner.send(value)
    }

    pub fn set_aggregate_function(
        &mut self,
        function: AggregateFunction,
        now: Timestamp,
    ) -> Result<(), Error> {
        self.inner.clock().set(now);
        self.inner.set_aggregate_function(function)
    }

    pub fn set_sink(&mut self, sink: bool, now: Timestamp) -> Result<(), Error> {
        self.inner.clock().set(now);
        self.inner.set_sink(sink)
    }

    pub fn close(&mut self) {
        self.inner.close();
    }

    pub fn take_outgoing(&self) -> Vec<Vec<u8>> {
        self.inner.transport().take_sent()
    }

    /// Results delivered since the last call.
    pub fn take_results(&mut self) -> Vec<(AggregateFunction, i32)> {
        std::mem::take(&mut self.inner.handler_mut().results)
    }

    /// Protocol events emitted since the last call.
    pub fn take_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.inner.events().try_receive() {
            events.push(event);
        }
        events
    }

    pub fn take_debug_events(&self) -> Vec<DebugEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.inner.debug_channel().try_receive() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use aggtree::{Frame, Message, RTMETRIC_INFINITE};

    use super::*;

    #[test]
    fn test_open_sends_first_announce() {
        let node = SimNode::new(2, Role::Router, 7, Timestamp::ZERO).unwrap();
        assert_eq!(node.rtmetric(), RTMETRIC_INFINITE);
        assert_eq!(node.parent(), None);

        let frames = node.take_outgoing();
        assert_eq!(frames.len(), 1);
        assert!(node.next_wakeup().is_some());
    }

    #[test]
    fn test_no_router_role_is_refused() {
        assert!(matches!(
            SimNode::new(3, Role::NoRouter, 1, Timestamp::ZERO),
            Err(Error::UnsupportedRole)
        ));
    }

    #[test]
    fn test_sink_submission_delivers_locally() {
        let mut sink = SimNode::new(1, Role::Sink, 1, Timestamp::ZERO).unwrap();
        assert_eq!(sink.rtmetric(), 0);

        sink.send(12, Timestamp::from_millis(10)).unwrap();
        assert_eq!(sink.take_results(), [(AggregateFunction::Sum, 12)]);
        assert!(sink.take_results().is_empty());
        let _ = sink.take_debug_events();
    }

    #[test]
    fn test_rssi_floor() {
        let transport = SimTransport::new().with_min_rssi(-80);
        assert!(transport.is_acceptable_rssi(Some(-70)));
        assert!(!transport.is_acceptable_rssi(Some(-85)));
        assert!(transport.is_acceptable_rssi(None));
    }

    #[test]
    fn test_random_stays_in_range() {
        let mut random = SimRandom::with_seed(3);
        for _ in 0..100 {
            let v = random.gen_range(10, 20);
            assert!((10..20).contains(&v));
        }
        assert_eq!(random.gen_range(5, 5), 5);
    }

    #[test]
    fn test_outgoing_frames_decode() {
        use aggtree::wire::AttrWidths;

        let node = SimNode::new(4, Role::Sink, 1, Timestamp::ZERO).unwrap();
        let frames = node.take_outgoing();
        let frame = Frame::decode(&frames[0], &AttrWidths::of::<SimConfig>()).unwrap();
        assert_eq!(frame.channel, SIM_CHANNEL);
        assert!(matches!(frame.message, Message::Announce(a) if a.sender == 4 && a.rtmetric == 0));
    }
}
