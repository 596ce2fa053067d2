//! aggsim - Discrete event network simulator for aggtree protocol testing.
//!
//! Runs whole aggregation networks in one process on simulated time, so
//! multi-second protocol behavior (tree formation, retransmission backoff,
//! neighbor expiry) is exercised deterministically and instantly.
//!
//! # Features
//!
//! - **Discrete event simulation**: no real-time delays, deterministic ordering
//! - **Configurable topology**: fully connected, chain, star or explicit edges
//! - **Link properties**: RSSI, loss rate and delay per link
//! - **Scenario builder**: scheduled submissions, function changes, link failures
//! - **Metrics**: delivered results, protocol events, tree snapshots
//!
//! # Example
//!
//! ```
//! use aggsim::{star_scenario, AggregateFunction, Timestamp};
//!
//! let (mut sim, _) = star_scenario(4)
//!     .submit_all_at(Timestamp::from_secs(1), &[(1, 2), (2, 5), (3, 9)])
//!     .build();
//! sim.run_until(Timestamp::from_millis(2500));
//!
//! assert_eq!(sim.metrics().results_at(1), [(AggregateFunction::Sum, 16)]);
//! ```
//!
//! # Architecture
//!
//! The simulator keeps a priority queue of events ordered by
//! (time, sequence number). Each step pops one event, advances time and calls
//! the node's synchronous handler (`handle_transport_rx`, `handle_timer` or
//! `handle_command`) instead of the async `Node::run`. Afterwards the node's
//! queued frames are routed through the topology, its results and events are
//! recorded and its next wakeup is (re)scheduled.

pub mod event;
pub mod metrics;
pub mod node;
pub mod scenario;
pub mod sim;
pub mod topology;

pub use aggtree::{Addr, AggregateFunction, Duration, Role, Timestamp};
pub use event::{Event, ScenarioAction, ScheduledEvent};
pub use metrics::{DeliveredResult, SimMetrics, SimulationResult, TreeSnapshot};
pub use node::{SimConfig, SimNode};
pub use scenario::{star_scenario, ScenarioBuilder};
pub use sim::Simulator;
pub use topology::{Link, Topology};
