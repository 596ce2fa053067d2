//! Parent liveness and neighbor probing.
//!
//! A joined router that has sent nothing to its parent for a whole
//! `KEEPALIVE_INTERVAL` queues an empty data packet. It is delivered like any
//! other packet, so an unreachable parent shows up as exhausted
//! retransmissions and a degraded link estimate. Probes are announcements
//! with the solicit flag; neighbors answer with a proactive announcement,
//! which refreshes the neighbor table faster than waiting for their
//! periodic ones.

use tracing::debug;

use crate::config::NodeConfig;
use crate::debug::DebugEvent;
use crate::node::Node;
use crate::time::{TimerKind, Timestamp};
use crate::traits::{Clock, Random, ResultHandler, Transport};

impl<T, R, Clk, H, Cfg> Node<T, R, Clk, H, Cfg>
where
    T: Transport,
    R: Random,
    Clk: Clock,
    H: ResultHandler,
    Cfg: NodeConfig,
{
    pub(crate) fn handle_probe_timer(&mut self, now: Timestamp) {
        self.send_announce(true);
        self.metrics.probes_sent += 1;
        let delay = self.jittered(Cfg::PROBE_INTERVAL);
        self.timers.arm_after(TimerKind::Probe, now, delay);
    }

    pub(crate) fn handle_keepalive_timer(&mut self, now: Timestamp) {
        self.timers
            .arm_after(TimerKind::Keepalive, now, Cfg::KEEPALIVE_INTERVAL);

        if self.is_sink || !self.is_joined() || !self.forward.queue.is_empty() {
            return;
        }
        let idle = self
            .forward
            .last_parent_tx
            .map_or(true, |at| now.saturating_sub(at) >= Cfg::KEEPALIVE_INTERVAL);
        if !idle {
            return;
        }

        match self.enqueue_packet(None, 0, now) {
            Ok(packet_id) => {
                self.metrics.keepalives_sent += 1;
                self.debug_event(DebugEvent::KeepaliveQueued { packet_id });
            }
            Err(err) => debug!(node = self.addr, error = %err, "keepalive not queued"),
        }
    }
}
