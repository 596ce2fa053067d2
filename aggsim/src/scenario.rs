//! Scenario builder for setting up and running simulations.
//!
//! Nodes are referred to by index; node `i` gets address `i + 1`. Node 0 is
//! the sink unless `with_sinks` says otherwise.

use aggtree::{Addr, AggregateFunction, Command, Duration, Role, Timestamp};
use tracing::warn;

use crate::event::ScenarioAction;
use crate::metrics::SimulationResult;
use crate::sim::Simulator;
use crate::topology::Topology;

#[derive(Debug, Clone)]
enum TopologyType {
    FullyConnected,
    Chain,
    /// First node is the hub.
    Star,
    /// Links between node indices.
    Edges(Vec<(usize, usize)>),
}

/// Builder for simulation scenarios.
pub struct ScenarioBuilder {
    num_nodes: usize,
    seed: u64,
    topology_type: TopologyType,
    sinks: Vec<usize>,
    loss_rate: f64,
    delay: Duration,
    actions: Vec<(Timestamp, ScenarioAction)>,
    commands: Vec<(Timestamp, usize, Command)>,
    snapshot_interval: Option<Duration>,
}

impl ScenarioBuilder {
    /// A fully connected network of `num_nodes` nodes with node 0 as sink.
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            seed: 42,
            topology_type: TopologyType::FullyConnected,
            sinks: vec![0],
            loss_rate: 0.0,
            delay: Duration::from_millis(1),
            actions: Vec::new(),
            commands: Vec::new(),
            snapshot_interval: None,
        }
    }

    /// Address of the node at `index`.
    pub fn addr(index: usize) -> Addr {
        Addr::try_from(index + 1).unwrap_or(Addr::MAX)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn fully_connected(mut self) -> Self {
        self.topology_type = TopologyType::FullyConnected;
        self
    }

    pub fn chain_topology(mut self) -> Self {
        self.topology_type = TopologyType::Chain;
        self
    }

    pub fn star_topology(mut self) -> Self {
        self.topology_type = TopologyType::Star;
        self
    }

    /// Connect exactly the given pairs of node indices.
    pub fn edges(mut self, edges: &[(usize, usize)]) -> Self {
        self.topology_type = TopologyType::Edges(edges.to_vec());
        self
    }

    pub fn with_sinks(mut self, sinks: &[usize]) -> Self {
        self.sinks = sinks.to_vec();
        self
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self
    }

    /// Submit `value` at node `index` at `time`.
    pub fn submit_at(mut self, time: Timestamp, index: usize, value: i32) -> Self {
        self.commands.push((time, index, Command::Send(value)));
        self
    }

    /// Submit one value per listed node at `time`.
    pub fn submit_all_at(self, time: Timestamp, values: &[(usize, i32)]) -> Self {
        values
            .iter()
            .fold(self, |builder, &(index, value)| builder.submit_at(time, index, value))
    }

    /// Change the aggregate function at sink `index` at `time`.
    pub fn set_aggregate_at(
        mut self,
        time: Timestamp,
        index: usize,
        function: AggregateFunction,
    ) -> Self {
        self.commands
            .push((time, index, Command::SetAggregate(function)));
        self
    }

    /// Close node `index` at `time`.
    pub fn close_at(mut self, time: Timestamp, index: usize) -> Self {
        self.commands.push((time, index, Command::Close));
        self
    }

    pub fn disable_link_at(mut self, time: Timestamp, a: usize, b: usize) -> Self {
        let (a, b) = (Self::addr(a), Self::addr(b));
        self.actions.push((time, ScenarioAction::DisableLink { a, b }));
        self
    }

    pub fn enable_link_at(mut self, time: Timestamp, a: usize, b: usize) -> Self {
        let (a, b) = (Self::addr(a), Self::addr(b));
        self.actions.push((time, ScenarioAction::EnableLink { a, b }));
        self
    }

    pub fn loss_rate_at(mut self, time: Timestamp, a: usize, b: usize, rate: f64) -> Self {
        let (a, b) = (Self::addr(a), Self::addr(b));
        self.actions
            .push((time, ScenarioAction::SetLossRate { a, b, rate }));
        self
    }

    /// Partition the network into groups of node indices at `time`.
    pub fn partition_at(mut self, time: Timestamp, groups: Vec<Vec<usize>>) -> Self {
        let groups = groups
            .into_iter()
            .map(|group| group.into_iter().map(Self::addr).collect())
            .collect();
        self.actions
            .push((time, ScenarioAction::Partition { groups }));
        self
    }

    pub fn heal_at(mut self, time: Timestamp) -> Self {
        self.actions.push((time, ScenarioAction::HealPartition));
        self
    }

    pub fn snapshot_at(mut self, time: Timestamp) -> Self {
        self.actions.push((time, ScenarioAction::TakeSnapshot));
        self
    }

    /// Build the simulator with all nodes opened at time zero.
    pub fn build(self) -> (Simulator, Vec<Addr>) {
        let addrs: Vec<Addr> = (0..self.num_nodes).map(Self::addr).collect();

        let mut topo = match self.topology_type {
            TopologyType::FullyConnected => Topology::fully_connected(&addrs),
            TopologyType::Chain => Topology::chain(&addrs),
            TopologyType::Star => Topology::star(&addrs),
            TopologyType::Edges(edges) => {
                let mut topo = Topology::new();
                for (a, b) in edges {
                    topo.add_link(Self::addr(a), Self::addr(b), Default::default());
                }
                topo
            }
        };
        if self.loss_rate > 0.0 {
            topo.set_global_loss_rate(self.loss_rate);
        }
        topo.set_global_delay(self.delay);

        let mut sim = Simulator::new(self.seed).with_topology(topo);
        if let Some(interval) = self.snapshot_interval {
            sim = sim.with_snapshot_interval(interval);
        }

        for (index, &addr) in addrs.iter().enumerate() {
            let role = if self.sinks.contains(&index) {
                Role::Sink
            } else {
                Role::Router
            };
            let node_seed = self.seed.wrapping_add(index as u64 * 1000);
            // Sink and Router are always accepted
            if let Err(err) = sim.add_node(addr, role, node_seed) {
                warn!(node = addr, error = %err, "node not added");
            }
        }

        for (time, action) in self.actions {
            sim.schedule_action(time, action);
        }
        for (time, index, command) in self.commands {
            sim.schedule_command(time, Self::addr(index), command);
        }

        (sim, addrs)
    }

    pub fn run_for(self, duration: Duration) -> SimulationResult {
        let (mut sim, _) = self.build();
        sim.run_for(duration)
    }

    pub fn run_until(self, time: Timestamp) -> SimulationResult {
        let (mut sim, _) = self.build();
        sim.run_until(time)
    }
}

/// A star around the sink: node 0 is both hub and sink.
pub fn star_scenario(num_nodes: usize) -> ScenarioBuilder {
    ScenarioBuilder::new(num_nodes).star_topology()
}
