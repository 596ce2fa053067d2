//! Tree formation and maintenance.
//!
//! This module handles:
//! - Announcement creation and processing
//! - Parent selection with hold-down
//! - Child tracking
//! - Neighbor timeouts and disconnection
//!
//! Every node advertises its rtmetric (hop distance to the sink). A router
//! picks the eligible neighbor with the lowest rtmetric as parent. A better
//! candidate must stay best for `HOLD_DOWN` before the switch is committed,
//! which also applies to the very first join. Losing the parent always
//! disconnects the node, even when another candidate is already known.

use tracing::{debug, info, warn};

use crate::collections::BoundedMap;
use crate::config::NodeConfig;
use crate::debug::DebugEvent;
use crate::neighbor::{Neighbor, NeighborList};
use crate::node::Node;
use crate::time::{TimerKind, Timestamp};
use crate::traits::{Clock, Random, ResultHandler, Transport};
use crate::types::{Addr, Error, Event, RTMETRIC_INFINITE, RTMETRIC_SINK};
use crate::wire::{Announce, Message};

/// Tree membership state of one connection.
#[derive(Debug, Clone)]
pub(crate) struct TreeState {
    pub(crate) neighbors: NeighborList,
    /// Children and the last time each was heard choosing us.
    pub(crate) children: BoundedMap<Addr, Timestamp>,
    pub(crate) current_parent: Option<Addr>,
    /// Candidate waiting out the hold-down.
    pub(crate) pending_parent: Option<Addr>,
    pub(crate) rtmetric: u16,
    /// Incremented on every disconnect.
    pub(crate) eseqno: u8,
}

impl TreeState {
    pub(crate) fn new(max_neighbors: usize, max_children: usize) -> Self {
        Self {
            neighbors: NeighborList::new(max_neighbors),
            children: BoundedMap::with_capacity(max_children),
            current_parent: None,
            pending_parent: None,
            rtmetric: RTMETRIC_INFINITE,
            eseqno: 0,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.neighbors.clear();
        self.children.clear();
        self.current_parent = None;
        self.pending_parent = None;
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
    /// Committed parent, `None` while disconnected (and always at the sink).
    pub fn parent(&self) -> Option<Addr> {
        self.tree.current_parent
    }

    /// Candidate parent currently in hold-down.
    pub fn pending_parent(&self) -> Option<Addr> {
        self.tree.pending_parent
    }

    /// Whether values submitted here can reach the sink.
    pub fn is_joined(&self) -> bool {
        self.open && (self.is_sink || self.tree.current_parent.is_some())
    }

    pub fn rtmetric(&self) -> u16 {
        self.tree.rtmetric
    }

    /// Disconnect counter, carried in data packets as the tree epoch.
    pub fn eseqno(&self) -> u8 {
        self.tree.eseqno
    }

    pub fn neighbors(&self) -> &NeighborList {
        &self.tree.neighbors
    }

    pub fn children_count(&self) -> usize {
        self.tree.children.len()
    }

    /// Promote this node to sink or demote it back to router.
    pub fn set_sink(&mut self, sink: bool) -> Result<(), Error> {
        let now = self.clock.now();
        self.set_sink_at(sink, now)
    }

    pub(crate) fn set_sink_at(&mut self, sink: bool, now: Timestamp) -> Result<(), Error> {
        if !self.open {
            return Err(Error::Closed);
        }
        if sink == self.is_sink {
            return Ok(());
        }
        self.is_sink = sink;

        if sink {
            self.timers.cancel(TimerKind::HoldDown);
            self.tree.current_parent = None;
            self.tree.pending_parent = None;
            self.discard_send_queue();
            self.control.synced = true;
            info!(node = self.addr, "promoted to sink");
            self.refresh_rtmetric(now);
        } else {
            info!(node = self.addr, "demoted to router");
            self.refresh_rtmetric(now);
            self.update_parent(now);
        }
        Ok(())
    }

    /// Handle a received announcement.
    pub(crate) fn handle_announce(&mut self, announce: Announce, rssi: Option<i16>, now: Timestamp) {
        if announce.sender == self.addr {
            return;
        }
        self.debug_event(DebugEvent::AnnounceReceived {
            from: announce.sender,
            rtmetric: announce.rtmetric,
        });

        self.observe_control(announce.control_seqno, announce.function, now);

        let is_new = self.tree.neighbors.observe(
            announce.sender,
            announce.rtmetric,
            announce.parent,
            rssi,
            now,
            self.tree.current_parent,
        );

        if announce.parent == Some(self.addr) {
            self.note_child(announce.sender, now);
        } else {
            self.tree.children.remove(&announce.sender);
        }

        // New neighbors and probes get our state without waiting a full interval
        if announce.solicit || is_new {
            self.schedule_proactive_announce(now);
        }

        self.update_parent(now);
    }

    /// Remember `addr` as a child heard at `now`.
    pub(crate) fn note_child(&mut self, addr: Addr, now: Timestamp) {
        if let Err((addr, seen)) = self.tree.children.insert(addr, now) {
            self.tree
                .children
                .remove_min_by_key(|_, _| true, |seen| *seen);
            let _ = self.tree.children.insert(addr, seen);
        }
    }

    /// Whether any child was heard within the neighbor timeout.
    pub(crate) fn has_active_children(&self, now: Timestamp) -> bool {
        self.tree
            .children
            .values()
            .any(|seen| now.saturating_sub(*seen) < Cfg::NEIGHBOR_TIMEOUT)
    }

    fn is_candidate(&self, neighbor: &Neighbor) -> bool {
        neighbor.parent != Some(self.addr)
            && neighbor.rtmetric != RTMETRIC_INFINITE
            && neighbor.rtmetric < Cfg::MAX_DEPTH
            && neighbor.link.etx() <= Cfg::MAX_LINK_ESTIMATE
            && self.transport.is_acceptable_rssi(neighbor.rssi)
    }

    /// Re-evaluate the parent after neighbor state changed.
    pub(crate) fn update_parent(&mut self, now: Timestamp) {
        if self.is_sink || !self.open {
            return;
        }
        let current_valid = self
            .tree
            .current_parent
            .and_then(|p| self.tree.neighbors.get(p))
            .is_some_and(|n| self.is_candidate(n));
        if self.tree.current_parent.is_some() && !current_valid {
            // A replacement, if any, has to sit out the hold-down
            self.disconnect(now);
        }

        let current = self.tree.current_parent;
        let best = self
            .tree
            .neighbors
            .best_candidate(|n| self.is_candidate(n), current, self.tree.pending_parent)
            .map(|n| (n.addr, n.rtmetric));

        match best {
            None => {
                self.tree.pending_parent = None;
                self.timers.cancel(TimerKind::HoldDown);
            }
            Some((candidate, _)) if Some(candidate) == current => {
                if self.tree.pending_parent.take().is_some() {
                    self.timers.cancel(TimerKind::HoldDown);
                }
            }
            Some((candidate, rtmetric)) => {
                if self.tree.pending_parent != Some(candidate) {
                    self.tree.pending_parent = Some(candidate);
                    self.timers
                        .arm_after(TimerKind::HoldDown, now, Cfg::HOLD_DOWN);
                    debug!(node = self.addr, candidate, rtmetric, "parent candidate in hold-down");
                    self.debug_event(DebugEvent::ParentCandidate {
                        candidate,
                        rtmetric,
                    });
                }
            }
        }
        self.refresh_rtmetric(now);
    }

    pub(crate) fn handle_hold_down_timer(&mut self, now: Timestamp) {
        let Some(pending) = self.tree.pending_parent else {
            return;
        };
        let best = self
            .tree
            .neighbors
            .best_candidate(
                |n| self.is_candidate(n),
                self.tree.current_parent,
                Some(pending),
            )
            .map(|n| n.addr);

        if best == Some(pending) {
            self.commit_parent(pending, now);
        } else {
            self.tree.pending_parent = None;
            self.update_parent(now);
        }
    }

    fn commit_parent(&mut self, parent: Addr, now: Timestamp) {
        let old = self.tree.current_parent.replace(parent);
        self.tree.pending_parent = None;
        self.timers.cancel(TimerKind::HoldDown);
        self.tree.children.remove(&parent);

        let rtmetric = self
            .tree
            .neighbors
            .get(parent)
            .map_or(RTMETRIC_INFINITE, |n| n.rtmetric);
        info!(node = self.addr, ?old, parent, rtmetric, "parent committed");
        self.push_event(Event::ParentChanged { old, new: parent });
        self.debug_event(DebugEvent::ParentCommitted { parent, rtmetric });
        self.refresh_rtmetric(now);

        self.redirect_head(now);
    }

    fn disconnect(&mut self, now: Timestamp) {
        let Some(old_parent) = self.tree.current_parent.take() else {
            return;
        };
        self.tree.pending_parent = None;
        self.tree.eseqno = self.tree.eseqno.wrapping_add(1);
        self.timers.cancel(TimerKind::HoldDown);
        self.discard_send_queue();

        warn!(node = self.addr, old_parent, eseqno = self.tree.eseqno, "disconnected from tree");
        self.push_event(Event::Disconnected { old_parent });
        self.debug_event(DebugEvent::Disconnected {
            old_parent,
            eseqno: self.tree.eseqno,
        });
        self.refresh_rtmetric(now);
        // Tell children right away instead of after the coalescing delay
        self.send_announce(false);
        self.schedule_announce(now);
    }

    /// Drop neighbors and children that went silent.
    pub(crate) fn expire_neighbors(&mut self, now: Timestamp) {
        let timeout = Cfg::NEIGHBOR_TIMEOUT;
        self.tree
            .children
            .retain(|_, seen| now.saturating_sub(*seen) < timeout);

        let expired = self.tree.neighbors.expired(now, timeout);
        if expired.is_empty() {
            return;
        }
        for addr in expired {
            self.tree.neighbors.remove(addr);
            self.tree.children.remove(&addr);
            debug!(node = self.addr, neighbor = addr, "neighbor expired");
            self.debug_event(DebugEvent::NeighborExpired { addr });
        }
        self.update_parent(now);
    }

    /// Recompute our rtmetric from the parent's advertisement.
    pub(crate) fn refresh_rtmetric(&mut self, now: Timestamp) {
        let rtmetric = if self.is_sink {
            RTMETRIC_SINK
        } else {
            self.tree
                .current_parent
                .and_then(|p| self.tree.neighbors.get(p))
                .map_or(RTMETRIC_INFINITE, |n| n.rtmetric.saturating_add(1))
        };
        if rtmetric != self.tree.rtmetric {
            debug!(node = self.addr, old = self.tree.rtmetric, new = rtmetric, "rtmetric changed");
            self.tree.rtmetric = rtmetric;
            self.schedule_proactive_announce(now);
        }
    }

    /// Broadcast our current tree and control state.
    pub(crate) fn send_announce(&mut self, solicit: bool) {
        let announce = Announce {
            sender: self.addr,
            rtmetric: self.tree.rtmetric,
            parent: self.tree.current_parent,
            solicit,
            control_seqno: self.control.seqno,
            function: self.aggregator.function(),
        };
        if self.transmit(Message::Announce(announce)).is_ok() {
            self.metrics.announcements_sent += 1;
            self.debug_event(DebugEvent::AnnounceSent {
                rtmetric: announce.rtmetric,
                solicit,
            });
        }
    }

    /// Arm the next periodic announcement.
    pub(crate) fn schedule_announce(&mut self, now: Timestamp) {
        let delay = self.jittered(Cfg::ANNOUNCE_INTERVAL);
        self.timers.arm_after(TimerKind::Announce, now, delay);
    }

    /// Pull the next announcement forward, coalescing bursts of triggers.
    pub(crate) fn schedule_proactive_announce(&mut self, now: Timestamp) {
        let delay = self.coalescing_delay(Cfg::PROACTIVE_DELAY);
        self.timers
            .arm_earlier(TimerKind::Announce, now.saturating_add(delay));
    }

    pub(crate) fn handle_announce_timer(&mut self, now: Timestamp) {
        self.send_announce(false);
        self.schedule_announce(now);
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use crate::config::{NodeConfig, TestConfig};
    use crate::node::test_support::*;
    use crate::node::Node;
    use crate::time::{Duration, TimerKind, Timestamp};
    use crate::traits::test_impls::{MockClock, MockRandom, MockTransport, ResultLog};
    use crate::traits::Clock;
    use crate::types::{AggregateFunction, Error, Event, Role, RTMETRIC_INFINITE};
    use crate::wire::{Announce, Frame, Message};

    fn solicit(sender: u16, rtmetric: u16) -> Vec<u8> {
        Frame {
            channel: CHANNEL,
            message: Message::Announce(Announce {
                sender,
                rtmetric,
                parent: None,
                solicit: true,
                control_seqno: 0,
                function: AggregateFunction::Sum,
            }),
        }
        .encode(&widths())
    }

    #[test]
    fn test_first_join_waits_for_hold_down() {
        let mut node = open_node(2, Role::Router);
        node.handle_transport_rx(&announce(1, 1, None), None, Timestamp::ZERO);
        assert_eq!(node.parent(), None);
        assert_eq!(node.pending_parent(), Some(1));
        assert_eq!(node.send(3), Err(Error::NotJoined));

        advance_to(&mut node, Timestamp::ZERO + TestConfig::HOLD_DOWN);
        assert_eq!(node.parent(), Some(1));
        assert_eq!(node.rtmetric(), 2);
        assert!(events(&node).contains(&Event::ParentChanged { old: None, new: 1 }));

        // The cost change is announced proactively
        let deadline = node.timers().deadline(TimerKind::Announce).unwrap();
        assert!(deadline <= node.clock.now() + Duration::from_millis(40));
    }

    #[test]
    fn test_equal_cost_keeps_current_parent() {
        let mut node = open_node(4, Role::Router);
        join(&mut node, 5, 1);

        let now = node.clock.now();
        node.handle_transport_rx(&announce(3, 1, None), None, now);
        assert_eq!(node.pending_parent(), None);
        assert_eq!(node.parent(), Some(5));

        // Strictly better cost enters hold-down, then wins
        node.handle_transport_rx(&announce(7, 0, None), None, now);
        assert_eq!(node.pending_parent(), Some(7));
        advance_to(&mut node, now + TestConfig::HOLD_DOWN);
        assert_eq!(node.parent(), Some(7));
        assert_eq!(node.rtmetric(), 1);
        assert!(events(&node).contains(&Event::ParentChanged {
            old: Some(5),
            new: 7
        }));
    }

    #[test]
    fn test_candidate_that_loses_its_edge_is_not_committed() {
        let mut node = open_node(4, Role::Router);
        join(&mut node, 5, 1);

        let now = node.clock.now();
        node.handle_transport_rx(&announce(7, 0, None), None, now);
        assert_eq!(node.pending_parent(), Some(7));
        node.handle_transport_rx(&announce(7, 3, None), None, now);
        assert_eq!(node.pending_parent(), None);

        advance_to(&mut node, now + TestConfig::HOLD_DOWN);
        assert_eq!(node.parent(), Some(5));
    }

    #[test]
    fn test_neighbor_that_chose_us_is_a_child() {
        let mut node = open_node(2, Role::Router);
        join(&mut node, 1, 0);

        let now = node.clock.now();
        node.handle_transport_rx(&announce(3, 0, Some(2)), None, now);
        assert_eq!(node.children_count(), 1);
        assert!(node.has_active_children(now));
        assert_eq!(node.pending_parent(), None);

        // The child switched away
        node.handle_transport_rx(&announce(3, 2, Some(1)), None, now);
        assert_eq!(node.children_count(), 0);
    }

    #[test]
    fn test_parent_timeout_disconnects() {
        let mut node = open_node(2, Role::Router);
        join(&mut node, 1, 0);
        assert_eq!(node.eseqno(), 0);

        run_until(&mut node, Timestamp::from_secs(4));
        assert_eq!(node.parent(), None);
        assert_eq!(node.rtmetric(), RTMETRIC_INFINITE);
        assert_eq!(node.eseqno(), 1);
        assert!(node.neighbors().is_empty());
        assert!(events(&node).contains(&Event::Disconnected { old_parent: 1 }));
        assert!(sent(&node).iter().any(|m| matches!(
            m,
            Message::Announce(a) if a.rtmetric == RTMETRIC_INFINITE && a.parent.is_none()
        )));
        assert_eq!(node.send(4), Err(Error::NotJoined));
        assert_eq!(node.queue_len(), 0);
    }

    #[test]
    fn test_lost_parent_disconnects_before_replacement() {
        let mut node = open_node(2, Role::Router);
        join(&mut node, 1, 0);

        // A second route keeps announcing while the parent goes silent
        for step in 1..=12 {
            let t = Timestamp::from_millis(step * 500);
            run_until(&mut node, t);
            node.handle_transport_rx(&announce(3, 1, None), None, t);
            if step == 5 {
                node.send(4).unwrap();
                assert_eq!(node.queue_len(), 1);
            }
        }
        assert_eq!(node.parent(), Some(3));
        assert_eq!(node.rtmetric(), 2);
        assert_eq!(node.eseqno(), 1);
        assert_eq!(node.queue_len(), 0);
        assert_eq!(node.metrics().drops_disconnected, 1);

        let events = events(&node);
        let disconnected = events
            .iter()
            .position(|e| *e == Event::Disconnected { old_parent: 1 })
            .unwrap();
        let rejoined = events
            .iter()
            .position(|e| *e == Event::ParentChanged { old: None, new: 3 })
            .unwrap();
        assert!(disconnected < rejoined);
        assert!(!events.contains(&Event::ParentChanged {
            old: Some(1),
            new: 3
        }));
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Dropped {
                packet_id: Some(_),
                reason: Error::Disconnected
            }
        )));
    }

    #[test]
    fn test_weak_signal_is_not_a_candidate() {
        let mut node = Node::<_, _, _, _, TestConfig>::open(
            2,
            CHANNEL,
            Role::Router,
            MockTransport::with_min_rssi(-80),
            MockRandom::new(),
            MockClock::new(),
            ResultLog::new(),
        )
        .unwrap();

        node.handle_transport_rx(&announce(1, 0, None), Some(-92), Timestamp::ZERO);
        assert_eq!(node.neighbors().len(), 1);
        assert_eq!(node.pending_parent(), None);

        node.handle_transport_rx(&announce(1, 0, None), Some(-60), Timestamp::ZERO);
        assert_eq!(node.pending_parent(), Some(1));
    }

    #[test]
    fn test_solicit_triggers_proactive_announce() {
        let mut node = open_node(2, Role::Router);
        run_until(&mut node, Timestamp::from_millis(100));
        node.handle_transport_rx(&announce(1, 3, None), None, Timestamp::from_millis(100));
        run_until(&mut node, Timestamp::from_millis(200));
        sent(&node);

        let now = Timestamp::from_millis(200);
        node.handle_transport_rx(&solicit(1, 3), None, now);
        let deadline = node.timers().deadline(TimerKind::Announce).unwrap();
        assert!(deadline < now + Duration::from_millis(40));

        run_until(&mut node, now + Duration::from_millis(40));
        let announces = sent(&node)
            .into_iter()
            .filter(|m| matches!(m, Message::Announce(a) if a.sender == 2))
            .count();
        assert_eq!(announces, 1);
    }

    #[test]
    fn test_set_sink_round_trip() {
        let mut node = open_node(2, Role::Router);
        join(&mut node, 1, 0);

        node.set_sink(true).unwrap();
        assert!(node.is_sink());
        assert_eq!(node.parent(), None);
        assert_eq!(node.rtmetric(), 0);
        assert!(node.is_joined());

        node.set_sink(false).unwrap();
        assert_eq!(node.rtmetric(), RTMETRIC_INFINITE);
        assert_eq!(node.pending_parent(), Some(1));

        node.close();
        assert_eq!(node.set_sink(true), Err(Error::Closed));
    }
}
