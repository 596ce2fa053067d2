//! Discrete event simulator for aggtree networks.

use std::collections::BinaryHeap;

use aggtree::{Addr, Command, Duration, Error, Role, Timestamp};
use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::event::{Event, ScenarioAction, ScheduledEvent, SequenceNumber};
use crate::metrics::{DeliveredResult, SimMetrics, SimulationResult, TreeSnapshot};
use crate::node::SimNode;
use crate::topology::Topology;

/// Discrete event simulator for aggtree networks.
pub struct Simulator {
    nodes: HashMap<Addr, SimNode>,
    topology: Topology,
    current_time: Timestamp,
    event_queue: BinaryHeap<ScheduledEvent>,
    /// Wakeup currently scheduled for each node.
    wakeups: HashMap<Addr, Timestamp>,
    metrics: SimMetrics,
    next_seq: u64,
    /// RNG state for frame loss.
    rng_state: u64,
    snapshot_interval: Option<Duration>,
    next_snapshot: Option<Timestamp>,
}

impl Simulator {
    pub fn new(seed: u64) -> Self {
        Self {
            nodes: HashMap::new(),
            topology: Topology::new(),
            current_time: Timestamp::ZERO,
            event_queue: BinaryHeap::new(),
            wakeups: HashMap::new(),
            metrics: SimMetrics::new(),
            next_seq: 0,
            rng_state: seed,
            snapshot_interval: None,
            next_snapshot: None,
        }
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Record a tree snapshot every `interval`.
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self.next_snapshot = Some(self.current_time + interval);
        self
    }

    /// Open a node at the current time.
    ///
    /// Its first announcement is routed immediately; nodes added at the same
    /// instant still hear it because delivery takes the link delay.
    pub fn add_node(&mut self, addr: Addr, role: Role, seed: u64) -> Result<(), Error> {
        let node = SimNode::new(addr, role, seed, self.current_time)?;
        self.insert_node(node);
        Ok(())
    }

    /// Register an already opened node.
    pub fn insert_node(&mut self, node: SimNode) {
        let addr = node.addr();
        debug!(node = addr, sink = node.is_sink(), "node added");
        self.nodes.insert(addr, node);
        self.after_step(addr);
    }

    pub fn node(&self, addr: Addr) -> Option<&SimNode> {
        self.nodes.get(&addr)
    }

    pub fn node_mut(&mut self, addr: Addr) -> Option<&mut SimNode> {
        self.nodes.get_mut(&addr)
    }

    /// Addresses of all nodes, ascending.
    pub fn addrs(&self) -> Vec<Addr> {
        let mut addrs: Vec<Addr> = self.nodes.keys().copied().collect();
        addrs.sort_unstable();
        addrs
    }

    pub fn current_time(&self) -> Timestamp {
        self.current_time
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topology
    }

    pub fn metrics(&self) -> &SimMetrics {
        &self.metrics
    }

    pub fn schedule(&mut self, time: Timestamp, event: Event) {
        let seq = SequenceNumber::new(self.next_seq);
        self.next_seq += 1;
        self.event_queue.push(ScheduledEvent::new(time, seq, event));
    }

    pub fn schedule_action(&mut self, time: Timestamp, action: ScenarioAction) {
        self.schedule(time, Event::ScenarioAction(action));
    }

    pub fn schedule_command(&mut self, time: Timestamp, node: Addr, command: Command) {
        self.schedule(time, Event::Command { node, command });
    }

    /// Submit a value at `node` now, returning the node's verdict.
    pub fn send(&mut self, node: Addr, value: i32) -> Option<Result<(), Error>> {
        let now = self.current_time;
        let result = self.nodes.get_mut(&node)?.send(value, now);
        self.after_step(node);
        Some(result)
    }

    /// Run until `end_time`, processing every event due at or before it.
    pub fn run_until(&mut self, end_time: Timestamp) -> SimulationResult {
        while let Some(event) = self.event_queue.peek() {
            if event.time > end_time {
                break;
            }
            let Some(event) = self.event_queue.pop() else {
                break;
            };
            self.advance_time(event.time);
            self.process_event(event.event);
            self.maybe_take_snapshot();
        }
        self.advance_time(end_time);
        self.take_snapshot();

        SimulationResult {
            end_time: self.current_time,
            metrics: self.metrics.clone(),
            queue_exhausted: self.event_queue.is_empty(),
        }
    }

    pub fn run_for(&mut self, duration: Duration) -> SimulationResult {
        self.run_until(self.current_time + duration)
    }

    fn advance_time(&mut self, time: Timestamp) {
        if time > self.current_time {
            self.current_time = time;
        }
    }

    fn process_event(&mut self, event: Event) {
        match event {
            Event::FrameDelivery { to, data, rssi, from } => {
                trace!(from, to, len = data.len(), "frame delivered");
                self.deliver_frame(to, &data, rssi);
            }
            Event::TimerFire { node, at } => self.fire_timer(node, at),
            Event::Command { node, command } => self.run_command(node, command),
            Event::ScenarioAction(action) => self.execute_action(action),
        }
    }

    fn deliver_frame(&mut self, to: Addr, data: &[u8], rssi: Option<i16>) {
        let now = self.current_time;
        let Some(node) = self.nodes.get_mut(&to) else {
            return;
        };
        node.handle_transport_rx(data, rssi, now);
        self.metrics.frames_delivered += 1;
        self.after_step(to);
    }

    fn fire_timer(&mut self, addr: Addr, at: Timestamp) {
        if self.wakeups.get(&addr) != Some(&at) {
            return;
        }
        self.wakeups.remove(&addr);
        let now = self.current_time;
        if let Some(node) = self.nodes.get_mut(&addr) {
            node.handle_timer(now);
        }
        self.after_step(addr);
    }

    fn run_command(&mut self, addr: Addr, command: Command) {
        let now = self.current_time;
        if let Some(node) = self.nodes.get_mut(&addr) {
            node.handle_command(command, now);
        }
        self.after_step(addr);
    }

    /// Route queued frames, record results and events, and reschedule the
    /// node's wakeup.
    fn after_step(&mut self, addr: Addr) {
        let now = self.current_time;
        let Some(node) = self.nodes.get_mut(&addr) else {
            return;
        };
        let frames = node.take_outgoing();
        for (function, value) in node.take_results() {
            self.metrics.results.push(DeliveredResult {
                time: now,
                sink: addr,
                function,
                value,
            });
        }
        for event in node.take_events() {
            self.metrics.events.push((now, addr, event));
        }
        for event in node.take_debug_events() {
            trace!(node = addr, ?event, "debug event");
        }
        let wakeup = node.next_wakeup();

        for frame in frames {
            self.route_frame(addr, frame);
        }

        match wakeup {
            Some(at) if self.wakeups.get(&addr) != Some(&at) => {
                self.wakeups.insert(addr, at);
                self.schedule(at.max(now), Event::TimerFire { node: addr, at });
            }
            Some(_) => {}
            None => {
                self.wakeups.remove(&addr);
            }
        }
    }

    /// Broadcast a frame from `sender` to every node reachable over an
    /// active link.
    fn route_frame(&mut self, sender: Addr, data: Vec<u8>) {
        self.metrics.frames_sent += 1;
        let now = self.current_time;

        let mut deliveries = Vec::new();
        for neighbor in self.topology.neighbors(sender) {
            let Some(link) = self.topology.get_link(sender, neighbor) else {
                continue;
            };
            let (loss_rate, delay, rssi) = (link.loss_rate, link.delay, link.rssi);
            if loss_rate > 0.0 && self.random_f64() < loss_rate {
                self.metrics.frames_dropped += 1;
                continue;
            }
            deliveries.push((neighbor, delay, rssi));
        }

        for (neighbor, delay, rssi) in deliveries {
            self.schedule(
                now + delay,
                Event::FrameDelivery {
                    to: neighbor,
                    data: data.clone(),
                    rssi: Some(rssi),
                    from: sender,
                },
            );
        }
    }

    fn execute_action(&mut self, action: ScenarioAction) {
        debug!(?action, time = self.current_time.as_millis(), "scenario action");
        match action {
            ScenarioAction::Partition { groups } => self.topology.partition(&groups),
            ScenarioAction::HealPartition => self.topology.heal(),
            ScenarioAction::DisableLink { a, b } => {
                if let Some(link) = self.topology.get_link_mut(a, b) {
                    link.active = false;
                }
            }
            ScenarioAction::EnableLink { a, b } => {
                if let Some(link) = self.topology.get_link_mut(a, b) {
                    link.active = true;
                }
            }
            ScenarioAction::SetLossRate { a, b, rate } => {
                if let Some(link) = self.topology.get_link_mut(a, b) {
                    link.loss_rate = rate.clamp(0.0, 1.0);
                }
            }
            ScenarioAction::TakeSnapshot => self.take_snapshot(),
        }
    }

    fn maybe_take_snapshot(&mut self) {
        let (Some(next), Some(interval)) = (self.next_snapshot, self.snapshot_interval) else {
            return;
        };
        if self.current_time >= next {
            self.take_snapshot();
            self.next_snapshot = Some(next + interval);
        }
    }

    /// Record every node's parent and rtmetric.
    pub fn take_snapshot(&mut self) {
        let mut snapshot = TreeSnapshot::new(self.current_time);
        for (&addr, node) in &self.nodes {
            snapshot.record_node(addr, node.parent(), node.rtmetric(), node.is_sink());
        }
        self.metrics.add_snapshot(snapshot);
    }

    /// Uniform value in [0, 1).
    fn random_f64(&mut self) -> f64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        (self.rng_state >> 11) as f64 / (1u64 << 53) as f64
    }
}
