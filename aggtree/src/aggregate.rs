//! In-network aggregation.
//!
//! Each node combines its own value with its children's partial records for
//! the current round and forwards a single record toward the sink. Partials
//! are mergeable summaries: average travels as (sum, count) so the final
//! division happens once, at the sink.
//!
//! A round opens on the first contribution (local or from a child). A node
//! with children waits out a merge window scaled by its depth, so deeper
//! nodes flush first and their records reach shallower nodes before those
//! close. A node without children flushes immediately.

use tracing::{debug, info, warn};

use crate::config::{field_max, NodeConfig};
use crate::debug::DebugEvent;
use crate::node::Node;
use crate::time::{Duration, TimerKind, Timestamp};
use crate::traits::{Clock, Random, ResultHandler, Transport};
use crate::types::{AggregateFunction, Error, Event};

/// Mergeable partial aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partial {
    /// Wrapping 32-bit sum.
    Sum(i32),
    /// Number of contributing nodes.
    Count(u32),
    /// Exact sum and count; the quotient is taken at the sink.
    Avg { sum: i64, count: u32 },
    Min(i32),
    Max(i32),
}

impl Partial {
    /// Partial for a single local value.
    pub fn from_value(function: AggregateFunction, value: i32) -> Self {
        match function {
            AggregateFunction::Sum => Partial::Sum(value),
            AggregateFunction::Count => Partial::Count(1),
            AggregateFunction::Avg => Partial::Avg {
                sum: i64::from(value),
                count: 1,
            },
            AggregateFunction::Min => Partial::Min(value),
            AggregateFunction::Max => Partial::Max(value),
        }
    }

    pub fn function(&self) -> AggregateFunction {
        match self {
            Partial::Sum(_) => AggregateFunction::Sum,
            Partial::Count(_) => AggregateFunction::Count,
            Partial::Avg { .. } => AggregateFunction::Avg,
            Partial::Min(_) => AggregateFunction::Min,
            Partial::Max(_) => AggregateFunction::Max,
        }
    }

    /// Merge `other` into `self`. Returns false if the functions differ.
    pub fn merge(&mut self, other: &Partial) -> bool {
        match (self, other) {
            (Partial::Sum(a), Partial::Sum(b)) => *a = a.wrapping_add(*b),
            (Partial::Count(a), Partial::Count(b)) => *a = a.saturating_add(*b),
            (Partial::Avg { sum, count }, Partial::Avg { sum: s, count: c }) => {
                *sum = sum.saturating_add(*s);
                *count = count.saturating_add(*c);
            }
            (Partial::Min(a), Partial::Min(b)) => *a = (*a).min(*b),
            (Partial::Max(a), Partial::Max(b)) => *a = (*a).max(*b),
            _ => return false,
        }
        true
    }

    /// Final value as delivered to the application.
    ///
    /// Average truncates toward zero; an empty average yields 0.
    pub fn result(&self) -> i32 {
        match *self {
            Partial::Sum(v) | Partial::Min(v) | Partial::Max(v) => v,
            Partial::Count(n) => i32::try_from(n).unwrap_or(i32::MAX),
            Partial::Avg { count: 0, .. } => 0,
            Partial::Avg { sum, count } => {
                let avg = sum / i64::from(count);
                avg.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
            }
        }
    }
}

/// A partial with its hop attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub partial: Partial,
    /// Remaining merge hops.
    pub ttl: u8,
    /// Hops traversed so far.
    pub hops: u8,
}

/// Progress of the current round at this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoundState {
    #[default]
    Empty,
    /// Contributions are being merged.
    Accumulating,
    /// The merged record was handed to the forwarding engine.
    Forwarded,
    /// The sink computed a result for the round.
    ResultReady,
}

/// Per-node aggregation state.
#[derive(Debug, Clone)]
pub struct Aggregator {
    function: AggregateFunction,
    epoch: u8,
    local: Option<i32>,
    combined: Option<Record>,
    state: RoundState,
    round: u8,
    last_delivered: Option<(AggregateFunction, i32)>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            function: AggregateFunction::default(),
            epoch: 0,
            local: None,
            combined: None,
            state: RoundState::Empty,
            round: 0,
            last_delivered: None,
        }
    }

    pub fn function(&self) -> AggregateFunction {
        self.function
    }

    pub fn epoch(&self) -> u8 {
        self.epoch
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    /// Local value submitted for the open round.
    pub fn local(&self) -> Option<i32> {
        self.local
    }

    /// Merged children's partial for the open round.
    pub fn combined(&self) -> Option<&Partial> {
        self.combined.as_ref().map(|r| &r.partial)
    }

    /// Switch to a new function epoch, discarding the open round.
    pub fn reset(&mut self, function: AggregateFunction, epoch: u8) {
        self.function = function;
        self.epoch = epoch;
        self.local = None;
        self.combined = None;
        self.state = RoundState::Empty;
    }

    /// Record the local value. A later value in the same round replaces it.
    ///
    /// Returns true if this opened a round.
    pub fn submit(&mut self, value: i32) -> bool {
        self.local = Some(value);
        self.open_round()
    }

    /// Merge a child's record. Returns `None` if its function does not match,
    /// otherwise whether this opened a round.
    pub fn merge(&mut self, record: Record) -> Option<bool> {
        if record.partial.function() != self.function {
            return None;
        }
        match &mut self.combined {
            Some(combined) => {
                combined.partial.merge(&record.partial);
                combined.ttl = combined.ttl.min(record.ttl);
                combined.hops = combined.hops.max(record.hops);
            }
            None => self.combined = Some(record),
        }
        Some(self.open_round())
    }

    fn open_round(&mut self) -> bool {
        if self.state == RoundState::Accumulating {
            return false;
        }
        self.state = RoundState::Accumulating;
        true
    }

    /// Close the open round and produce the record to forward.
    ///
    /// The returned id counts rounds at this node (the epacket id).
    pub fn take_round(&mut self, max_ttl: u8, max_hops: u8) -> Option<(Record, u8)> {
        if self.state != RoundState::Accumulating {
            return None;
        }
        let local = self
            .local
            .take()
            .map(|v| Partial::from_value(self.function, v));
        let record = match (self.combined.take(), local) {
            (Some(mut combined), local) => {
                if let Some(local) = local {
                    combined.partial.merge(&local);
                }
                Record {
                    partial: combined.partial,
                    ttl: combined.ttl.saturating_sub(1),
                    hops: combined.hops.saturating_add(1).min(max_hops),
                }
            }
            (None, Some(local)) => Record {
                partial: local,
                ttl: max_ttl,
                hops: 0,
            },
            (None, None) => {
                self.state = RoundState::Empty;
                return None;
            }
        };
        self.state = RoundState::Forwarded;
        self.round = self.round.wrapping_add(1);
        Some((record, self.round))
    }

    /// Sink side: mark the round complete. Returns the value if it differs
    /// from the last delivered (function, value).
    pub fn deliver(&mut self, partial: &Partial) -> Option<i32> {
        self.state = RoundState::ResultReady;
        let outcome = (partial.function(), partial.result());
        if self.last_delivered == Some(outcome) {
            return None;
        }
        self.last_delivered = Some(outcome);
        Some(outcome.1)
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
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
    /// Submit a local value for the current round.
    ///
    /// A later value in the same round replaces the earlier one.
    pub fn send(&mut self, value: i32) -> Result<(), Error> {
        let now = self.clock.now();
        self.submit(value, now)
    }

    pub fn aggregate_function(&self) -> AggregateFunction {
        self.aggregator.function()
    }

    pub fn aggregate_epoch(&self) -> u8 {
        self.aggregator.epoch()
    }

    pub fn round_state(&self) -> RoundState {
        self.aggregator.state()
    }

    pub(crate) fn submit(&mut self, value: i32, now: Timestamp) -> Result<(), Error> {
        if !self.open {
            return Err(Error::Closed);
        }
        if !self.is_joined() {
            return Err(Error::NotJoined);
        }
        if !self.is_sink && self.forward.queue.is_full() {
            self.metrics.drops_queue_full += 1;
            return Err(Error::QueueFull);
        }
        self.metrics.values_submitted += 1;
        debug!(node = self.addr, value, function = %self.aggregator.function(), "value submitted");
        if self.aggregator.submit(value) {
            self.start_round(now);
        }
        Ok(())
    }

    /// Merge a record received from a child.
    pub(crate) fn merge_child(&mut self, record: Record, now: Timestamp) {
        match self.aggregator.merge(record) {
            Some(true) => self.start_round(now),
            Some(false) => {}
            None => {
                self.metrics.stale_discarded += 1;
                debug!(
                    node = self.addr,
                    function = %record.partial.function(),
                    current = %self.aggregator.function(),
                    "dropping record for another function"
                );
            }
        }
    }

    /// Merge window for this node's depth.
    pub(crate) fn merge_window(&self) -> Duration {
        let slots = Cfg::DEPTH_SLOTS.saturating_sub(self.tree.rtmetric).max(1);
        Cfg::MERGE_WINDOW.saturating_mul(u64::from(slots))
    }

    fn start_round(&mut self, now: Timestamp) {
        if self.has_active_children(now) {
            let window = self.merge_window();
            self.timers.arm_after(TimerKind::MergeWindow, now, window);
            self.debug_event(DebugEvent::RoundStarted {
                epoch: self.aggregator.epoch(),
                window_ms: window.as_millis(),
            });
        } else {
            self.flush_round(now);
        }
    }

    /// Close the round: deliver at the sink, forward elsewhere.
    pub(crate) fn flush_round(&mut self, now: Timestamp) {
        self.timers.cancel(TimerKind::MergeWindow);
        let max_ttl = field_max(Cfg::TTL_BITS);
        let max_hops = field_max(Cfg::HOPS_BITS);
        let Some((record, round)) = self.aggregator.take_round(max_ttl, max_hops) else {
            return;
        };
        let function = record.partial.function();

        if self.is_sink {
            match self.aggregator.deliver(&record.partial) {
                Some(value) => {
                    self.metrics.results_delivered += 1;
                    info!(node = self.addr, function = %function, value, "aggregate result");
                    self.debug_event(DebugEvent::ResultDelivered { function, value });
                    self.handler.on_result(function, value);
                }
                None => {
                    self.metrics.results_suppressed += 1;
                    debug!(node = self.addr, function = %function, "result unchanged, suppressed");
                }
            }
            return;
        }

        if !self.is_joined() {
            self.metrics.drops_not_joined += 1;
            warn!(node = self.addr, "round closed while not joined, dropping record");
            self.push_event(Event::Dropped {
                packet_id: None,
                reason: Error::NotJoined,
            });
            return;
        }

        match self.enqueue_packet(Some(record), round, now) {
            Ok(packet_id) => self.debug_event(DebugEvent::RoundForwarded {
                epoch: self.aggregator.epoch(),
                packet_id,
                ttl: record.ttl,
                hops: record.hops,
            }),
            Err(reason) => {
                warn!(node = self.addr, error = %reason, "cannot queue round record");
                self.push_event(Event::Dropped {
                    packet_id: None,
                    reason,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_merge_semantics() {
        let mut sum = Partial::Sum(i32::MAX);
        assert!(sum.merge(&Partial::Sum(1)));
        assert_eq!(sum, Partial::Sum(i32::MIN));

        let mut min = Partial::Min(5);
        min.merge(&Partial::Min(-2));
        assert_eq!(min.result(), -2);

        let mut max = Partial::Max(5);
        max.merge(&Partial::Max(-2));
        assert_eq!(max.result(), 5);

        let mut count = Partial::Count(2);
        count.merge(&Partial::Count(3));
        assert_eq!(count.result(), 5);

        assert!(!Partial::Sum(1).merge(&Partial::Max(1)));
    }

    #[test]
    fn test_average_is_exact_across_subtrees() {
        // Subtree {1, 2, 2} and a single leaf {10}: mean 15/4 = 3
        let mut subtree = Partial::from_value(AggregateFunction::Avg, 1);
        subtree.merge(&Partial::from_value(AggregateFunction::Avg, 2));
        subtree.merge(&Partial::from_value(AggregateFunction::Avg, 2));
        let mut total = Partial::from_value(AggregateFunction::Avg, 10);
        total.merge(&subtree);
        assert_eq!(total, Partial::Avg { sum: 15, count: 4 });
        assert_eq!(total.result(), 3);

        assert_eq!(Partial::Avg { sum: -7, count: 2 }.result(), -3);
        assert_eq!(Partial::Avg { sum: 0, count: 0 }.result(), 0);
    }

    #[test]
    fn test_local_value_overwrites() {
        let mut agg = Aggregator::new();
        assert!(agg.submit(4));
        assert!(!agg.submit(6));
        let (record, round) = agg.take_round(15, 15).unwrap();
        assert_eq!(record.partial, Partial::Sum(6));
        assert_eq!((record.ttl, record.hops), (15, 0));
        assert_eq!(round, 1);
        assert_eq!(agg.state(), RoundState::Forwarded);
        assert_eq!(agg.take_round(15, 15), None);
    }

    #[test]
    fn test_merge_tracks_ttl_and_hops() {
        let mut agg = Aggregator::new();
        agg.merge(Record {
            partial: Partial::Sum(2),
            ttl: 15,
            hops: 0,
        });
        agg.merge(Record {
            partial: Partial::Sum(3),
            ttl: 12,
            hops: 3,
        });
        agg.submit(1);
        let (record, _) = agg.take_round(15, 15).unwrap();
        assert_eq!(record.partial, Partial::Sum(6));
        assert_eq!(record.ttl, 11);
        assert_eq!(record.hops, 4);
    }

    #[test]
    fn test_reset_discards_round() {
        let mut agg = Aggregator::new();
        agg.submit(9);
        agg.reset(AggregateFunction::Max, 1);
        assert_eq!(agg.state(), RoundState::Empty);
        assert_eq!(agg.local(), None);
        assert_eq!(agg.take_round(15, 15), None);

        // Records of the previous function no longer merge
        let stale = Record {
            partial: Partial::Sum(2),
            ttl: 15,
            hops: 0,
        };
        assert_eq!(agg.merge(stale), None);
    }

    #[test]
    fn test_deliver_suppresses_repeats() {
        let mut agg = Aggregator::new();
        assert_eq!(agg.deliver(&Partial::Sum(16)), Some(16));
        assert_eq!(agg.state(), RoundState::ResultReady);
        assert_eq!(agg.deliver(&Partial::Sum(16)), None);
        assert_eq!(agg.deliver(&Partial::Max(16)), Some(16));
        assert_eq!(agg.deliver(&Partial::Max(9)), Some(9));
    }
}
