//! Metrics collection for simulation analysis.

use aggtree::{Addr, AggregateFunction, Event as NodeEvent, Timestamp, RTMETRIC_INFINITE};
use hashbrown::HashMap;

/// Tree membership of every node at a point in time.
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    pub time: Timestamp,
    /// Committed parent of each node.
    pub parents: HashMap<Addr, Option<Addr>>,
    /// Advertised rtmetric of each node.
    pub rtmetrics: HashMap<Addr, u16>,
    /// Whether each node is a sink.
    pub is_sink: HashMap<Addr, bool>,
}

impl TreeSnapshot {
    pub fn new(time: Timestamp) -> Self {
        Self {
            time,
            parents: HashMap::new(),
            rtmetrics: HashMap::new(),
            is_sink: HashMap::new(),
        }
    }

    pub fn record_node(&mut self, addr: Addr, parent: Option<Addr>, rtmetric: u16, is_sink: bool) {
        self.parents.insert(addr, parent);
        self.rtmetrics.insert(addr, rtmetric);
        self.is_sink.insert(addr, is_sink);
    }

    /// Nodes acting as sink.
    pub fn sinks(&self) -> Vec<Addr> {
        let mut sinks: Vec<Addr> = self
            .is_sink
            .iter()
            .filter(|(_, &sink)| sink)
            .map(|(&addr, _)| addr)
            .collect();
        sinks.sort_unstable();
        sinks
    }

    /// Routers without a parent.
    pub fn detached(&self) -> Vec<Addr> {
        let mut detached: Vec<Addr> = self
            .parents
            .iter()
            .filter(|(addr, parent)| {
                parent.is_none() && !self.is_sink.get(*addr).copied().unwrap_or(false)
            })
            .map(|(&addr, _)| addr)
            .collect();
        detached.sort_unstable();
        detached
    }

    /// Whether every router has a parent and every parent chain ends at a sink.
    pub fn all_joined(&self) -> bool {
        self.parents.keys().all(|&addr| self.reaches_sink(addr))
    }

    /// Hops from `addr` to its sink, if its parent chain reaches one.
    pub fn depth(&self, addr: Addr) -> Option<usize> {
        let mut current = addr;
        for hops in 0..=self.parents.len() {
            if self.is_sink.get(&current).copied().unwrap_or(false) {
                return Some(hops);
            }
            current = (*self.parents.get(&current)?)?;
        }
        // Longer than the node count: a loop
        None
    }

    /// Largest depth over all nodes that reach a sink.
    pub fn max_depth(&self) -> usize {
        self.parents
            .keys()
            .filter_map(|&addr| self.depth(addr))
            .max()
            .unwrap_or(0)
    }

    fn reaches_sink(&self, addr: Addr) -> bool {
        self.depth(addr).is_some()
            && self
                .rtmetrics
                .get(&addr)
                .is_some_and(|&rtmetric| rtmetric != RTMETRIC_INFINITE)
    }
}

/// An aggregate result delivered at a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveredResult {
    pub time: Timestamp,
    pub sink: Addr,
    pub function: AggregateFunction,
    pub value: i32,
}

/// Simulation metrics collected over time.
#[derive(Debug, Clone, Default)]
pub struct SimMetrics {
    /// Frames put on the medium.
    pub frames_sent: u64,
    /// Per-receiver deliveries.
    pub frames_delivered: u64,
    /// Per-receiver losses on lossy links.
    pub frames_dropped: u64,
    /// Results delivered at sinks, in order.
    pub results: Vec<DeliveredResult>,
    /// Protocol events emitted by nodes, in order.
    pub events: Vec<(Timestamp, Addr, NodeEvent)>,
    pub snapshots: Vec<TreeSnapshot>,
}

impl SimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_snapshot(&mut self, snapshot: TreeSnapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn latest_snapshot(&self) -> Option<&TreeSnapshot> {
        self.snapshots.last()
    }

    /// First snapshot time at which every node was joined.
    pub fn convergence_time(&self) -> Option<Timestamp> {
        self.snapshots
            .iter()
            .find(|s| s.all_joined())
            .map(|s| s.time)
    }

    /// `(function, value)` of every result delivered at `sink`.
    pub fn results_at(&self, sink: Addr) -> Vec<(AggregateFunction, i32)> {
        self.results
            .iter()
            .filter(|r| r.sink == sink)
            .map(|r| (r.function, r.value))
            .collect()
    }

    /// Events emitted by `node`.
    pub fn events_of(&self, node: Addr) -> Vec<NodeEvent> {
        self.events
            .iter()
            .filter(|(_, addr, _)| *addr == node)
            .map(|(_, _, event)| *event)
            .collect()
    }
}

/// Result of running a simulation.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub end_time: Timestamp,
    pub metrics: SimMetrics,
    /// Whether the run ended because no events were left.
    pub queue_exhausted: bool,
}

impl SimulationResult {
    /// Whether every node was joined at the end of the run.
    pub fn converged(&self) -> bool {
        self.metrics
            .latest_snapshot()
            .is_some_and(|s| s.all_joined())
    }

    pub fn final_max_depth(&self) -> usize {
        self.metrics
            .latest_snapshot()
            .map_or(0, |s| s.max_depth())
    }
}
