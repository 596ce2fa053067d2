//! Reliable hop-by-hop forwarding.
//!
//! Records travel one hop at a time toward the sink. Each hop keeps a bounded
//! FIFO send queue and transmits only its head: the head is retransmitted
//! with exponential backoff until the parent acknowledges it or `MAX_REXMITS`
//! transmissions are spent, after which it is dropped and reported.
//!
//! Receivers acknowledge every data packet, including duplicates, and
//! remember `(sender, packet_id, tree_epoch)` so a retransmission whose ack
//! was lost is not merged twice. Acks carry the receiver's rtmetric and
//! control state, which keeps the sender's parent view and aggregate epoch
//! current between announcements.

use tracing::{debug, warn};

use crate::aggregate::Record;
use crate::collections::{BoundedQueue, RecentSet};
use crate::config::{field_max, NodeConfig};
use crate::debug::DebugEvent;
use crate::node::Node;
use crate::time::{backoff, Duration, TimerKind, Timestamp};
use crate::traits::{Clock, Random, ResultHandler, Transport};
use crate::types::{seq_newer, Addr, Error, Event};
use crate::wire::{AckBody, Attributes, DataBody, Message, Unicast, UnicastBody};

/// A packet waiting in the send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Outbound {
    pub(crate) packet_id: u8,
    pub(crate) epacket_id: u8,
    pub(crate) aggregate_epoch: u8,
    /// `None` for keepalives.
    pub(crate) contribution: Option<Record>,
    pub(crate) transmissions: u8,
    pub(crate) sent_to: Option<Addr>,
}

/// Duplicate-suppression key: (sender, packet_id, tree_epoch).
type PacketKey = (Addr, u8, u8);

#[derive(Debug, Clone)]
pub(crate) struct ForwardState {
    pub(crate) queue: BoundedQueue<Outbound>,
    pub(crate) seqno: u8,
    pub(crate) recent: RecentSet<PacketKey>,
    /// Last transmission to the parent, for keepalive suppression.
    pub(crate) last_parent_tx: Option<Timestamp>,
}

impl ForwardState {
    pub(crate) fn new(queue_size: usize, recent_size: usize) -> Self {
        Self {
            queue: BoundedQueue::with_capacity(queue_size),
            seqno: 0,
            recent: RecentSet::with_capacity(recent_size),
            last_parent_tx: None,
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
    /// Packets waiting for acknowledgement, head included.
    pub fn queue_len(&self) -> usize {
        self.forward.queue.len()
    }

    /// Queue a packet for the parent. Returns its packet id.
    pub(crate) fn enqueue_packet(
        &mut self,
        contribution: Option<Record>,
        epacket_id: u8,
        now: Timestamp,
    ) -> Result<u8, Error> {
        if self.is_sink || self.tree.current_parent.is_none() {
            self.metrics.drops_not_joined += 1;
            return Err(Error::NotJoined);
        }
        if self.forward.queue.is_full() {
            self.metrics.drops_queue_full += 1;
            return Err(Error::QueueFull);
        }
        let packet_id = self.next_packet_id();
        let packet = Outbound {
            packet_id,
            epacket_id,
            aggregate_epoch: self.aggregator.epoch(),
            contribution,
            transmissions: 0,
            sent_to: None,
        };
        if self.forward.queue.try_push(packet).is_err() {
            self.metrics.drops_queue_full += 1;
            return Err(Error::QueueFull);
        }
        self.kick_queue(now);
        Ok(packet_id)
    }

    fn next_packet_id(&mut self) -> u8 {
        let mask = field_max(Cfg::PACKET_ID_BITS);
        self.forward.seqno = self.forward.seqno.wrapping_add(1) & mask;
        self.forward.seqno
    }

    /// Start transmitting the head unless it is already in flight.
    pub(crate) fn kick_queue(&mut self, now: Timestamp) {
        if self.timers.is_armed(TimerKind::Retransmit) || self.forward.queue.is_empty() {
            return;
        }
        self.transmit_head(now);
    }

    fn transmit_head(&mut self, now: Timestamp) {
        let Some(parent) = self.tree.current_parent else {
            return;
        };
        let tree_epoch = self.tree.eseqno;
        let Some(head) = self.forward.queue.front_mut() else {
            return;
        };
        head.transmissions = head.transmissions.saturating_add(1);
        head.sent_to = Some(parent);
        let packet = *head;

        let (ttl, hops, contribution) = match packet.contribution {
            Some(record) => (record.ttl, record.hops, Some(record.partial)),
            None => (field_max(Cfg::TTL_BITS), 0, None),
        };
        let unicast = Unicast {
            sender: self.addr,
            receiver: parent,
            attrs: Attributes {
                esender: self.addr,
                epacket_id: packet.epacket_id,
                packet_id: packet.packet_id,
                ttl,
                hops,
                max_rexmit: Cfg::MAX_REXMITS.saturating_sub(packet.transmissions),
            },
            body: UnicastBody::Data(DataBody {
                tree_epoch,
                aggregate_epoch: packet.aggregate_epoch,
                contribution,
            }),
        };

        if packet.transmissions > 1 {
            self.metrics.retransmissions += 1;
        } else {
            self.metrics.data_sent += 1;
        }
        if let Err(err) = self.transmit(Message::Unicast(unicast)) {
            debug!(node = self.addr, packet_id = packet.packet_id, error = %err, "data frame not sent");
        }
        self.forward.last_parent_tx = Some(now);
        self.debug_event(DebugEvent::DataSent {
            to: parent,
            packet_id: packet.packet_id,
            transmission: packet.transmissions,
        });

        let base = backoff(
            Cfg::REXMIT_INTERVAL,
            packet.transmissions - 1,
            Cfg::MAX_BACKOFF,
        );
        let spread = Cfg::REXMIT_INTERVAL.as_millis() / 4;
        let jitter = Duration::from_millis(self.random.gen_range(0, spread + 1));
        self.timers
            .arm_after(TimerKind::Retransmit, now, base.saturating_add(jitter));
    }

    /// The head went unacknowledged: retransmit or give up.
    pub(crate) fn handle_retransmit_timer(&mut self, now: Timestamp) {
        let Some(head) = self.forward.queue.front() else {
            return;
        };
        if head.transmissions < Cfg::MAX_REXMITS {
            debug!(
                node = self.addr,
                packet_id = head.packet_id,
                transmissions = head.transmissions,
                "retransmitting"
            );
            self.transmit_head(now);
        } else {
            self.drop_exhausted_head(now);
        }
    }

    /// Send the head to a newly committed parent.
    ///
    /// Attempts already spent on the old parent count against the budget.
    pub(crate) fn redirect_head(&mut self, now: Timestamp) {
        self.timers.cancel(TimerKind::Retransmit);
        let Some(head) = self.forward.queue.front_mut() else {
            return;
        };
        head.sent_to = None;
        if head.transmissions < Cfg::MAX_REXMITS {
            self.transmit_head(now);
        } else {
            self.drop_exhausted_head(now);
        }
    }

    fn drop_exhausted_head(&mut self, now: Timestamp) {
        let Some(packet) = self.forward.queue.pop_front() else {
            return;
        };
        if let Some(neighbor) = packet.sent_to.and_then(|p| self.tree.neighbors.get_mut(p)) {
            neighbor.link.record_failure(Cfg::MAX_REXMITS);
        }
        self.debug_event(DebugEvent::PacketDropped {
            packet_id: packet.packet_id,
            transmissions: packet.transmissions,
        });
        if packet.contribution.is_some() {
            self.metrics.drops_exhausted += 1;
            warn!(
                node = self.addr,
                packet_id = packet.packet_id,
                attempts = packet.transmissions,
                "retransmissions exhausted, packet dropped"
            );
            self.push_event(Event::Dropped {
                packet_id: Some(packet.packet_id),
                reason: Error::RetransmissionExhausted {
                    attempts: packet.transmissions,
                },
            });
        } else {
            debug!(node = self.addr, packet_id = packet.packet_id, "keepalive unacknowledged");
        }

        self.update_parent(now);
        self.kick_queue(now);
    }

    /// Handle a unicast frame addressed to this node.
    pub(crate) fn handle_unicast(&mut self, unicast: Unicast, now: Timestamp) {
        if unicast.receiver != self.addr || unicast.sender == self.addr {
            return;
        }
        match unicast.body {
            UnicastBody::Ack(ack) => self.handle_ack(unicast.sender, unicast.attrs, ack, now),
            UnicastBody::Data(data) => self.handle_data(unicast.sender, unicast.attrs, data, now),
        }
    }

    fn handle_ack(&mut self, sender: Addr, attrs: Attributes, ack: AckBody, now: Timestamp) {
        if let Some(neighbor) = self.tree.neighbors.get_mut(sender) {
            neighbor.rtmetric = ack.rtmetric;
            neighbor.last_advertised = now;
        }

        let matches_head = self
            .forward
            .queue
            .front()
            .is_some_and(|head| head.packet_id == attrs.packet_id && head.sent_to == Some(sender));

        if matches_head {
            if let Some(packet) = self.forward.queue.pop_front() {
                self.timers.cancel(TimerKind::Retransmit);
                if let Some(neighbor) = self.tree.neighbors.get_mut(sender) {
                    neighbor.link.record_success(packet.transmissions);
                }
                self.metrics.acks_received += 1;
                self.debug_event(DebugEvent::AckReceived {
                    from: sender,
                    packet_id: packet.packet_id,
                });
                if ack.stale {
                    debug!(node = self.addr, packet_id = packet.packet_id, "parent reported record stale");
                }
            }
        } else {
            self.metrics.stray_acks += 1;
            debug!(node = self.addr, from = sender, packet_id = attrs.packet_id, "stray ack");
        }

        self.observe_control(ack.control_seqno, ack.function, now);
        self.update_parent(now);
        self.kick_queue(now);
    }

    fn handle_data(&mut self, sender: Addr, attrs: Attributes, data: DataBody, now: Timestamp) {
        let fresh = self
            .forward
            .recent
            .insert((sender, attrs.packet_id, data.tree_epoch));
        self.note_child(sender, now);

        // A child may learn of a new function before we do
        if let Some(partial) = data.contribution {
            if seq_newer(data.aggregate_epoch, self.aggregator.epoch()) {
                self.observe_control(data.aggregate_epoch, partial.function(), now);
            }
        }

        let current = self.aggregator.epoch();
        let stale = data.contribution.is_some() && data.aggregate_epoch != current;
        self.send_ack(sender, attrs.packet_id, stale);

        if !fresh {
            self.metrics.duplicates += 1;
            self.debug_event(DebugEvent::DuplicateDiscarded {
                from: sender,
                packet_id: attrs.packet_id,
            });
            return;
        }

        match data.contribution {
            None => self.metrics.keepalives_received += 1,
            Some(_) if stale => {
                self.metrics.stale_discarded += 1;
                debug!(
                    node = self.addr,
                    from = sender,
                    epoch = data.aggregate_epoch,
                    current,
                    "stale record discarded"
                );
                self.debug_event(DebugEvent::StaleDiscarded {
                    from: sender,
                    epoch: data.aggregate_epoch,
                    current,
                });
            }
            Some(_) if attrs.ttl == 0 => {
                self.metrics.ttl_expired += 1;
                debug!(node = self.addr, from = sender, "record ttl expired");
            }
            Some(partial) => self.merge_child(
                Record {
                    partial,
                    ttl: attrs.ttl,
                    hops: attrs.hops,
                },
                now,
            ),
        }
    }

    fn send_ack(&mut self, to: Addr, packet_id: u8, stale: bool) {
        let ack = Unicast {
            sender: self.addr,
            receiver: to,
            attrs: Attributes {
                esender: self.addr,
                packet_id,
                ..Attributes::default()
            },
            body: UnicastBody::Ack(AckBody {
                rtmetric: self.tree.rtmetric,
                control_seqno: self.control.seqno,
                function: self.aggregator.function(),
                stale,
            }),
        };
        if self.transmit(Message::Unicast(ack)).is_ok() {
            self.metrics.acks_sent += 1;
        }
    }

    /// Drop every queued packet; contributions are reported as lost.
    pub(crate) fn discard_send_queue(&mut self) {
        self.timers.cancel(TimerKind::Retransmit);
        while let Some(packet) = self.forward.queue.pop_front() {
            if packet.contribution.is_none() {
                continue;
            }
            self.metrics.drops_disconnected += 1;
            self.push_event(Event::Dropped {
                packet_id: Some(packet.packet_id),
                reason: Error::Disconnected,
            });
        }
    }

    /// Remove queued records of an outdated aggregate epoch.
    pub(crate) fn purge_stale_packets(&mut self, now: Timestamp) {
        let epoch = self.aggregator.epoch();
        let head_before = self.forward.queue.front().map(|p| p.packet_id);
        let removed = self
            .forward
            .queue
            .retain(|p| p.contribution.is_none() || p.aggregate_epoch == epoch);
        if removed == 0 {
            return;
        }
        self.metrics.stale_discarded += removed as u64;
        debug!(node = self.addr, removed, "purged stale records from send queue");

        if self.forward.queue.front().map(|p| p.packet_id) != head_before {
            self.timers.cancel(TimerKind::Retransmit);
            self.kick_queue(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use crate::aggregate::Partial;
    use crate::config::{NodeConfig, TestConfig};
    use crate::node::test_support::*;
    use crate::time::{TimerKind, Timestamp};
    use crate::traits::Clock;
    use crate::types::{AggregateFunction, Error, Event, Role};
    use crate::wire::{AckBody, Attributes, Frame, Message, Unicast, UnicastBody};

    fn ack(sender: u16, receiver: u16, packet_id: u8) -> Vec<u8> {
        Frame {
            channel: CHANNEL,
            message: Message::Unicast(Unicast {
                sender,
                receiver,
                attrs: Attributes {
                    esender: sender,
                    packet_id,
                    ..Attributes::default()
                },
                body: UnicastBody::Ack(AckBody {
                    rtmetric: 0,
                    control_seqno: 0,
                    function: AggregateFunction::Sum,
                    stale: false,
                }),
            }),
        }
        .encode(&widths())
    }

    fn acks(messages: &[Message]) -> Vec<(u16, u8, bool)> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::Unicast(Unicast {
                    receiver,
                    attrs,
                    body: UnicastBody::Ack(ack),
                    ..
                }) => Some((*receiver, attrs.packet_id, ack.stale)),
                _ => None,
            })
            .collect()
    }

    fn data_frames(messages: &[Message]) -> Vec<Unicast> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::Unicast(u) if matches!(u.body, UnicastBody::Data(_)) => Some(*u),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_data_is_acked_and_merged() {
        let mut sink = open_node(1, Role::Sink);
        sent(&sink);

        let now = Timestamp::from_millis(10);
        sink.clock.set(now);
        sink.handle_transport_rx(&data(2, 1, 7, 0, Some(Partial::Sum(5))), None, now);
        assert_eq!(acks(&sent(&sink)), [(2, 7, false)]);
        assert_eq!(sink.children_count(), 1);
        assert!(sink.timers().is_armed(TimerKind::MergeWindow));

        let window = sink.merge_window();
        run_until(&mut sink, now + window);
        assert_eq!(sink.handler().results, [(AggregateFunction::Sum, 5)]);
    }

    #[test]
    fn test_duplicate_is_reacked_not_merged() {
        let mut sink = open_node(1, Role::Sink);
        sent(&sink);

        let frame = data(2, 1, 7, 0, Some(Partial::Sum(5)));
        sink.handle_transport_rx(&frame, None, Timestamp::ZERO);
        sink.handle_transport_rx(&frame, None, Timestamp::from_millis(5));
        assert_eq!(acks(&sent(&sink)), [(2, 7, false), (2, 7, false)]);
        assert_eq!(sink.metrics().duplicates, 1);

        run_until(&mut sink, Timestamp::from_secs(1));
        assert_eq!(sink.handler().results, [(AggregateFunction::Sum, 5)]);
    }

    #[test]
    fn test_stale_record_acked_with_flag() {
        let mut sink = open_node(1, Role::Sink);
        sink.set_aggregate_function(AggregateFunction::Max).unwrap();
        sent(&sink);

        sink.handle_transport_rx(&data(2, 1, 3, 0, Some(Partial::Sum(5))), None, Timestamp::ZERO);
        assert_eq!(acks(&sent(&sink)), [(2, 3, true)]);
        assert_eq!(sink.metrics().stale_discarded, 1);
        assert!(!sink.timers().is_armed(TimerKind::MergeWindow));
    }

    #[test]
    fn test_frames_for_other_receivers_ignored() {
        let mut sink = open_node(1, Role::Sink);
        sent(&sink);
        sink.handle_transport_rx(&data(2, 9, 3, 0, Some(Partial::Sum(5))), None, Timestamp::ZERO);
        assert!(sent(&sink).is_empty());
        assert_eq!(sink.children_count(), 0);
    }

    #[test]
    fn test_retransmits_until_exhausted() {
        let mut node = open_node(2, Role::Router);
        join(&mut node, 1, 0);
        node.send(7).unwrap();

        run_until(&mut node, Timestamp::from_millis(2500));
        let frames = data_frames(&sent(&node));
        assert_eq!(frames.len(), usize::from(TestConfig::MAX_REXMITS));
        let budgets: Vec<u8> = frames.iter().map(|u| u.attrs.max_rexmit).collect();
        assert_eq!(budgets, [3, 2, 1, 0]);
        assert!(frames.iter().all(|u| u.receiver == 1));

        let packet_id = frames[0].attrs.packet_id;
        assert!(events(&node).contains(&Event::Dropped {
            packet_id: Some(packet_id),
            reason: Error::RetransmissionExhausted { attempts: 4 },
        }));
        assert_eq!(node.queue_len(), 0);
        assert_eq!(node.metrics().drops_exhausted, 1);
        assert_eq!(node.metrics().retransmissions, 3);
        assert!(node.neighbors().get(1).unwrap().link.etx() > 16);
    }

    #[test]
    fn test_parent_switch_keeps_retry_budget() {
        let mut node = open_node(2, Role::Router);
        join(&mut node, 1, 1);
        node.send(7).unwrap();

        // A better parent shows up while the head is being retried
        let now = Timestamp::from_millis(450);
        run_until(&mut node, now);
        node.handle_transport_rx(&announce(3, 0, None), None, now);
        assert_eq!(node.pending_parent(), Some(3));

        run_until(&mut node, Timestamp::from_millis(2500));
        assert_eq!(node.parent(), Some(3));

        let frames = data_frames(&sent(&node));
        assert_eq!(frames.len(), usize::from(TestConfig::MAX_REXMITS));
        assert_eq!(frames[0].receiver, 1);
        assert_eq!(frames[frames.len() - 1].receiver, 3);
        let budgets: Vec<u8> = frames.iter().map(|u| u.attrs.max_rexmit).collect();
        assert_eq!(budgets, [3, 2, 1, 0]);

        assert!(events(&node).contains(&Event::Dropped {
            packet_id: Some(frames[0].attrs.packet_id),
            reason: Error::RetransmissionExhausted { attempts: 4 },
        }));
        assert_eq!(node.queue_len(), 0);
    }

    #[test]
    fn test_ack_completes_head() {
        let mut node = open_node(2, Role::Router);
        join(&mut node, 1, 0);
        node.send(7).unwrap();
        let frames = data_frames(&sent(&node));
        assert_eq!(frames.len(), 1);
        let packet_id = frames[0].attrs.packet_id;

        let now = node.clock.now();
        // Wrong sender does not complete the packet
        node.handle_transport_rx(&ack(9, 2, packet_id), None, now);
        assert_eq!(node.queue_len(), 1);
        assert_eq!(node.metrics().stray_acks, 1);

        node.handle_transport_rx(&ack(1, 2, packet_id), None, now);
        assert_eq!(node.queue_len(), 0);
        assert!(!node.timers().is_armed(TimerKind::Retransmit));
        assert_eq!(node.metrics().acks_received, 1);
        assert_eq!(node.neighbors().get(1).unwrap().link.etx(), 14);
    }

    #[test]
    fn test_queue_full_rejects_submission() {
        let mut node = open_node(2, Role::Router);
        join(&mut node, 1, 0);
        let now = node.clock.now();
        for id in 0..TestConfig::SEND_QUEUE_SIZE as u8 {
            node.enqueue_packet(None, id, now).unwrap();
        }
        assert_eq!(node.enqueue_packet(None, 9, now), Err(Error::QueueFull));
        assert_eq!(node.send(1), Err(Error::QueueFull));
        assert_eq!(node.metrics().drops_queue_full, 2);
    }

    #[test]
    fn test_packet_ids_wrap_within_field() {
        let mut node = open_node(2, Role::Router);
        for _ in 0..300 {
            node.next_packet_id();
        }
        assert_eq!(node.forward.seqno, (300 % 256) as u8);
    }
}
