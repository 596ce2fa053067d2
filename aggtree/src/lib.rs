#![forbid(unsafe_code)]
//! aggtree - Reliable in-network data aggregation over a collection tree
//!
//! Nodes of a wireless mesh build a tree rooted at a sink by advertising
//! their hop distance (rtmetric). Every round each node combines its own
//! reading with its children's partial aggregates and forwards a single
//! record one hop toward the sink, with per-hop acknowledgements and bounded
//! retransmissions. The sink turns the merged record into a result and hands
//! it to the application.
//!
//! This crate is `no_std` but **requires the `alloc` crate**. Protocol tables
//! are heap-allocated with capacities fixed by [`NodeConfig`].
//!
//! # Key Properties
//!
//! - Parent selection by lowest rtmetric with hold-down against flapping
//! - Hop-by-hop acks, exponential backoff, duplicate suppression
//! - Sum, count, average, minimum and maximum, merged exactly in-network
//! - The sink changes the function at runtime; stale partials are rejected
//! - Keepalives and neighbor timeouts detect lost parents
//! - No clock synchronization required
//!
//! # Example (integration pattern)
//!
//! ```ignore
//! use aggtree::{AggregateFunction, Command, DefaultConfig, Node, Role};
//!
//! // Sink: print every aggregate result
//! let mut sink = Node::<_, _, _, _, DefaultConfig>::open(
//!     1, 130, Role::Sink, transport, random, clock,
//!     |function: AggregateFunction, value: i32| println!("{function}: {value}"),
//! )?;
//! sink.set_aggregate_function(AggregateFunction::Avg)?;
//!
//! // Router: submit readings from a sensor task
//! router.commands().send(Command::Send(reading)).await;
//!
//! // Either role is driven by its run loop
//! spawn(async move { sink.run().await });
//! ```
//!
//! # Module Structure
//!
//! - [`types`] - Addresses, roles, functions, commands, events, errors
//! - [`wire`] - Wire format serialization
//! - [`traits`] - Transport, Clock, Random, ResultHandler traits
//! - [`node`] - Main Node struct, dispatch and run loop
//! - [`tree`] - Tree formation and parent selection
//! - [`neighbor`] - Neighbor table and link estimation
//! - [`forward`] - Reliable hop-by-hop forwarding
//! - [`aggregate`] - Partial aggregates and rounds
//! - [`control`] - Aggregate function distribution
//! - [`liveness`] - Keepalives and probing
//! - [`collections`] - Bounded collections
//! - [`time`] - Timestamp, Duration and timers
//! - [`config`] - Compile-time configuration
//! - [`debug`] - Protocol trace events

#![no_std]

// Prevent test/debug features from being used in release builds.
#[cfg(all(feature = "test-support", not(test), not(debug_assertions)))]
compile_error!(
    "The `test-support` feature must not be enabled in release builds. \
     It includes mock transport, clock and random implementations."
);

#[cfg(all(feature = "debug", not(test), not(debug_assertions)))]
compile_error!(
    "The `debug` feature must not be enabled in release builds. \
     It adds protocol tracing overhead intended only for development and simulation."
);

extern crate alloc;

pub mod aggregate;
pub mod collections;
pub mod config;
pub mod control;
pub mod debug;
pub mod forward;
pub mod liveness;
pub mod neighbor;
pub mod node;
pub mod time;
pub mod traits;
pub mod tree;
pub mod types;
pub mod wire;

// Re-export main types at crate root
pub use aggregate::{Partial, Record, RoundState};
pub use config::{DefaultConfig, NodeConfig, SmallConfig};
pub use debug::DebugEvent;
pub use neighbor::{LinkEstimate, Neighbor, NeighborList};
pub use node::Node;
pub use time::{Duration, TimerKind, Timestamp};
pub use traits::{Clock, Random, ResultHandler, Transport};
pub use types::{Addr, AggregateFunction, Command, Error, Event, Incoming, ProtocolMetrics, Role};
pub use wire::{Decode, DecodeError, Encode, Frame, Message};

// Re-export constants
pub use types::{LINK_ESTIMATE_UNIT, RTMETRIC_INFINITE, RTMETRIC_SINK};

#[cfg(feature = "debug")]
pub use debug::DebugChannel;
