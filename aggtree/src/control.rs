//! Control plane: distributing the aggregate function.
//!
//! The sink owns a control sequence number. Changing the function bumps it
//! and floods `(seqno, function)` through the network; every node that adopts
//! a newer seqno relays the flood once. The same pair is piggybacked on
//! announcements and acks, so nodes that missed the flood catch up on the
//! next frame they hear.
//!
//! The seqno doubles as the aggregation epoch. Adopting a new one discards
//! the open round and purges queued records of the old epoch.

use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::debug::DebugEvent;
use crate::node::Node;
use crate::time::{TimerKind, Timestamp};
use crate::traits::{Clock, Random, ResultHandler, Transport};
use crate::types::{seq_newer, AggregateFunction, Error, Event};
use crate::wire::{Flood, Message};

#[derive(Debug, Clone)]
pub(crate) struct ControlState {
    pub(crate) seqno: u8,
    /// Whether any control state has been heard (always true at the sink).
    pub(crate) synced: bool,
    pub(crate) pending_flood: Option<Flood>,
    pub(crate) resends_left: u8,
}

impl ControlState {
    pub(crate) fn new(is_sink: bool) -> Self {
        Self {
            seqno: 0,
            synced: is_sink,
            pending_flood: None,
            resends_left: 0,
        }
    }
}

impl<T, R, Clk, H, Cfg> Node<T, R, Clk, H, Cfg>
where
    T: Transport,
    R: Random,
    Clk: Clock,
    H: ResultHandler,
    Cfg: NodeConfig,
{
    /// Change the aggregate function network-wide. Sink only.
    ///
    /// The open round is discarded; contributions of the previous function
    /// still in flight are rejected as stale.
    pub fn set_aggregate_function(&mut self, function: AggregateFunction) -> Result<(), Error> {
        let now = self.clock.now();
        self.set_aggregate_function_at(function, now)
    }

    /// Like `set_aggregate_function`, taking the function by name
    /// (`sum`, `count`, `avg`, `min` or `max`).
    pub fn set_aggregate(&mut self, name: &str) -> Result<(), Error> {
        let function = name.parse()?;
        self.set_aggregate_function(function)
    }

    /// Current control sequence number.
    pub fn control_seqno(&self) -> u8 {
        self.control.seqno
    }

    pub(crate) fn set_aggregate_function_at(
        &mut self,
        function: AggregateFunction,
        now: Timestamp,
    ) -> Result<(), Error> {
        if !self.open {
            return Err(Error::Closed);
        }
        if !self.is_sink {
            return Err(Error::NotSink);
        }
        let seqno = self.control.seqno.wrapping_add(1);
        self.adopt_control(seqno, function, now);

        self.control.pending_flood = Some(Flood {
            originator: self.addr,
            seqno,
            function,
            hops: 0,
        });
        self.control.resends_left = Cfg::FLOOD_RESENDS;
        self.send_pending_flood(now);
        self.schedule_proactive_announce(now);
        Ok(())
    }

    /// Consider control state heard from a neighbor. Returns true if adopted.
    ///
    /// Until the first observation any differing pair is accepted; after
    /// that only newer sequence numbers are. The sink is authoritative and
    /// ignores everything.
    pub(crate) fn observe_control(
        &mut self,
        seqno: u8,
        function: AggregateFunction,
        now: Timestamp,
    ) -> bool {
        if self.is_sink {
            return false;
        }
        let adopt = if self.control.synced {
            seq_newer(seqno, self.control.seqno)
        } else {
            (seqno, function) != (self.control.seqno, self.aggregator.function())
        };
        self.control.synced = true;
        if adopt {
            self.adopt_control(seqno, function, now);
        }
        adopt
    }

    fn adopt_control(&mut self, seqno: u8, function: AggregateFunction, now: Timestamp) {
        self.control.seqno = seqno;
        self.aggregator.reset(function, seqno);
        self.timers.cancel(TimerKind::MergeWindow);
        self.purge_stale_packets(now);

        info!(node = self.addr, seqno, function = %function, "aggregate function adopted");
        self.push_event(Event::AggregateChanged {
            function,
            epoch: seqno,
        });
        self.debug_event(DebugEvent::ControlAdopted { seqno, function });
    }

    pub(crate) fn handle_flood(&mut self, flood: Flood, now: Timestamp) {
        if flood.originator == self.addr {
            return;
        }
        self.metrics.floods_received += 1;
        if !self.observe_control(flood.seqno, flood.function, now) {
            return;
        }

        let hops = flood.hops.saturating_add(1);
        if u16::from(hops) >= Cfg::MAX_DEPTH {
            debug!(node = self.addr, seqno = flood.seqno, "flood reached depth limit");
            return;
        }
        self.control.pending_flood = Some(Flood { hops, ..flood });
        self.control.resends_left = 0;
        let delay = self.coalescing_delay(Cfg::PROACTIVE_DELAY);
        self.timers.arm_after(TimerKind::Flood, now, delay);
    }

    pub(crate) fn handle_flood_timer(&mut self, now: Timestamp) {
        self.send_pending_flood(now);
    }

    fn send_pending_flood(&mut self, now: Timestamp) {
        let Some(flood) = self.control.pending_flood else {
            return;
        };
        if self.transmit(Message::Flood(flood)).is_ok() {
            self.metrics.floods_sent += 1;
            self.debug_event(DebugEvent::FloodSent {
                seqno: flood.seqno,
                hops: flood.hops,
            });
        }
        if self.control.resends_left > 0 {
            self.control.resends_left -= 1;
            let delay = self.jittered(Cfg::FLOOD_RESEND_INTERVAL);
            self.timers.arm_after(TimerKind::Flood, now, delay);
        } else {
            self.control.pending_flood = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use crate::aggregate::{Partial, Record, RoundState};
    use crate::node::test_support::*;
    use crate::time::{TimerKind, Timestamp};
    use crate::traits::Clock;
    use crate::types::{AggregateFunction, Error, Event, Role};
    use crate::wire::{Announce, Flood, Frame, Message};

    fn flood(originator: u16, seqno: u8, function: AggregateFunction, hops: u8) -> Vec<u8> {
        Frame {
            channel: CHANNEL,
            message: Message::Flood(Flood {
                originator,
                seqno,
                function,
                hops,
            }),
        }
        .encode(&widths())
    }

    fn announce_with(sender: u16, seqno: u8, function: AggregateFunction) -> Vec<u8> {
        Frame {
            channel: CHANNEL,
            message: Message::Announce(Announce {
                sender,
                rtmetric: 3,
                parent: None,
                solicit: false,
                control_seqno: seqno,
                function,
            }),
        }
        .encode(&widths())
    }

    fn floods(messages: &[Message]) -> Vec<Flood> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::Flood(f) => Some(*f),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_router_cannot_set_function() {
        let mut node = open_node(2, Role::Router);
        assert_eq!(
            node.set_aggregate_function(AggregateFunction::Max),
            Err(Error::NotSink)
        );
        assert_eq!(node.aggregate_function(), AggregateFunction::Sum);
    }

    #[test]
    fn test_set_aggregate_by_name() {
        let mut sink = open_node(1, Role::Sink);
        sent(&sink);

        assert_eq!(sink.set_aggregate("median"), Err(Error::UnknownFunction));
        assert_eq!(sink.control_seqno(), 0);

        sink.set_aggregate("max").unwrap();
        assert_eq!(sink.aggregate_function(), AggregateFunction::Max);
        assert_eq!(sink.aggregate_epoch(), 1);
        assert_eq!(
            floods(&sent(&sink)),
            [Flood {
                originator: 1,
                seqno: 1,
                function: AggregateFunction::Max,
                hops: 0
            }]
        );
        assert_eq!(
            events(&sink),
            [Event::AggregateChanged {
                function: AggregateFunction::Max,
                epoch: 1
            }]
        );
    }

    #[test]
    fn test_sink_resends_flood() {
        let mut sink = open_node(1, Role::Sink);
        sink.set_aggregate_function(AggregateFunction::Min).unwrap();
        assert_eq!(floods(&sent(&sink)).len(), 1);

        run_until(&mut sink, Timestamp::from_millis(260));
        assert_eq!(floods(&sent(&sink)).len(), 1);
        run_until(&mut sink, Timestamp::from_secs(2));
        assert!(floods(&sent(&sink)).is_empty());
        assert!(!sink.timers().is_armed(TimerKind::Flood));
    }

    #[test]
    fn test_router_adopts_and_relays_once() {
        let mut node = open_node(2, Role::Router);
        sent(&node);

        node.handle_transport_rx(&flood(1, 1, AggregateFunction::Max, 0), None, Timestamp::ZERO);
        assert_eq!(node.aggregate_function(), AggregateFunction::Max);
        assert_eq!(node.aggregate_epoch(), 1);
        assert!(node.timers().is_armed(TimerKind::Flood));

        run_until(&mut node, Timestamp::from_millis(40));
        let relayed = floods(&sent(&node));
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].originator, 1);
        assert_eq!(relayed[0].hops, 1);

        // The same flood relayed back by a neighbor is not forwarded again
        node.handle_transport_rx(&flood(1, 1, AggregateFunction::Max, 2), None, Timestamp::from_millis(50));
        assert!(!node.timers().is_armed(TimerKind::Flood));
        assert_eq!(node.metrics().floods_received, 2);
    }

    #[test]
    fn test_new_epoch_discards_round_and_queue() {
        let mut node = open_node(3, Role::Router);
        join(&mut node, 1, 0);
        let now = node.clock.now();

        // A child's contribution opens a round; our own value is queued
        node.handle_transport_rx(&announce(4, 5, Some(3)), None, now);
        node.send(6).unwrap();
        assert_eq!(node.round_state(), RoundState::Accumulating);
        node.enqueue_packet(None, 0, now).unwrap();
        let record = Record {
            partial: Partial::Sum(1),
            ttl: 15,
            hops: 0,
        };
        node.enqueue_packet(Some(record), 1, now).unwrap();
        assert_eq!(node.queue_len(), 2);

        node.handle_transport_rx(&flood(1, 1, AggregateFunction::Max, 0), None, now);
        assert_eq!(node.round_state(), RoundState::Empty);
        assert!(!node.timers().is_armed(TimerKind::MergeWindow));
        // The keepalive survives, the record does not
        assert_eq!(node.queue_len(), 1);
        assert_eq!(node.metrics().stale_discarded, 1);
    }

    #[test]
    fn test_unsynced_router_adopts_any_state() {
        let mut node = open_node(2, Role::Router);
        node.handle_transport_rx(&announce_with(5, 200, AggregateFunction::Avg), None, Timestamp::ZERO);
        assert_eq!(node.aggregate_function(), AggregateFunction::Avg);
        assert_eq!(node.control_seqno(), 200);

        // Once synced, older sequence numbers are ignored
        node.handle_transport_rx(&announce_with(6, 150, AggregateFunction::Min), None, Timestamp::ZERO);
        assert_eq!(node.aggregate_function(), AggregateFunction::Avg);

        node.handle_transport_rx(&announce_with(6, 201, AggregateFunction::Min), None, Timestamp::ZERO);
        assert_eq!(node.aggregate_function(), AggregateFunction::Min);
        assert_eq!(node.aggregate_epoch(), 201);
    }

    #[test]
    fn test_sink_ignores_foreign_control() {
        let mut sink = open_node(1, Role::Sink);
        sink.handle_transport_rx(&flood(9, 5, AggregateFunction::Count, 0), None, Timestamp::ZERO);
        sink.handle_transport_rx(&announce_with(9, 5, AggregateFunction::Count), None, Timestamp::ZERO);
        assert_eq!(sink.aggregate_function(), AggregateFunction::Sum);
        assert_eq!(sink.control_seqno(), 0);
        assert!(!sink.timers().is_armed(TimerKind::Flood));
    }
}
