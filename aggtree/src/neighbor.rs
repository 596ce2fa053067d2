//! Neighbor table and link estimation.
//!
//! Each neighbor heard through announcements is a potential parent. The table
//! keeps its advertised cost, its own committed parent (to avoid two-node
//! loops), signal strength and an ETX-style link estimate fed by the
//! forwarding engine.

use alloc::vec::Vec;

use crate::collections::BoundedMap;
use crate::time::{Duration, Timestamp};
use crate::types::{Addr, LINK_ESTIMATE_UNIT};

/// Expected-transmissions estimate in `LINK_ESTIMATE_UNIT`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkEstimate {
    etx: u16,
}

impl LinkEstimate {
    /// Estimate of a link we know nothing about.
    pub const INITIAL: u16 = 2 * LINK_ESTIMATE_UNIT;

    pub const fn new() -> Self {
        Self { etx: Self::INITIAL }
    }

    pub const fn etx(&self) -> u16 {
        self.etx
    }

    /// Fold in a packet acknowledged after `transmissions` attempts.
    pub fn record_success(&mut self, transmissions: u8) {
        self.fold(u16::from(transmissions.max(1)).saturating_mul(LINK_ESTIMATE_UNIT));
    }

    /// Fold in a packet that exhausted `max_rexmits` attempts.
    pub fn record_failure(&mut self, max_rexmits: u8) {
        self.fold(u16::from(max_rexmits).saturating_mul(2 * LINK_ESTIMATE_UNIT));
    }

    fn fold(&mut self, sample: u16) {
        let etx = (u32::from(self.etx) * 3 + u32::from(sample)) / 4;
        self.etx = etx.min(u32::from(u16::MAX)) as u16;
    }
}

impl Default for LinkEstimate {
    fn default() -> Self {
        Self::new()
    }
}

/// A neighbor as seen through its announcements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub addr: Addr,
    pub rtmetric: u16,
    /// The neighbor's committed parent.
    pub parent: Option<Addr>,
    pub last_advertised: Timestamp,
    pub rssi: Option<i16>,
    pub link: LinkEstimate,
}

/// Bounded table of neighbors keyed by address.
#[derive(Debug, Clone)]
pub struct NeighborList {
    entries: BoundedMap<Addr, Neighbor>,
}

impl NeighborList {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BoundedMap::with_capacity(capacity),
        }
    }

    /// Record an announcement. Returns true if the neighbor is new.
    ///
    /// When the table is full the stalest entry other than `protect`
    /// (the current parent) is evicted. If only `protect` remains the
    /// announcement is ignored.
    pub fn observe(
        &mut self,
        addr: Addr,
        rtmetric: u16,
        parent: Option<Addr>,
        rssi: Option<i16>,
        now: Timestamp,
        protect: Option<Addr>,
    ) -> bool {
        if let Some(entry) = self.entries.get_mut(&addr) {
            entry.rtmetric = rtmetric;
            entry.parent = parent;
            entry.last_advertised = now;
            if rssi.is_some() {
                entry.rssi = rssi;
            }
            return false;
        }

        if self.entries.is_full()
            && self
                .entries
                .remove_min_by_key(|k, _| Some(*k) != protect, |n| n.last_advertised)
                .is_none()
        {
            return false;
        }

        let neighbor = Neighbor {
            addr,
            rtmetric,
            parent,
            last_advertised: now,
            rssi,
            link: LinkEstimate::new(),
        };
        self.entries.insert(addr, neighbor).is_ok()
    }

    pub fn get(&self, addr: Addr) -> Option<&Neighbor> {
        self.entries.get(&addr)
    }

    pub fn get_mut(&mut self, addr: Addr) -> Option<&mut Neighbor> {
        self.entries.get_mut(&addr)
    }

    pub fn remove(&mut self, addr: Addr) -> Option<Neighbor> {
        self.entries.remove(&addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbor> {
        self.entries.values()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Neighbors silent for at least `timeout`.
    pub fn expired(&self, now: Timestamp, timeout: Duration) -> Vec<Addr> {
        self.entries
            .values()
            .filter(|n| now.saturating_sub(n.last_advertised) >= timeout)
            .map(|n| n.addr)
            .collect()
    }

    /// Earliest time at which some neighbor expires.
    pub fn next_expiry(&self, timeout: Duration) -> Option<Timestamp> {
        if timeout == Duration::MAX {
            return None;
        }
        self.entries
            .values()
            .map(|n| n.last_advertised.saturating_add(timeout))
            .min()
    }

    /// Best parent among neighbors accepted by `eligible`.
    ///
    /// Lowest rtmetric wins. Ties prefer the committed parent, then the
    /// pending candidate, then the lowest address.
    pub fn best_candidate<F>(
        &self,
        eligible: F,
        current: Option<Addr>,
        pending: Option<Addr>,
    ) -> Option<&Neighbor>
    where
        F: Fn(&Neighbor) -> bool,
    {
        self.entries
            .values()
            .filter(|n| eligible(n))
            .min_by_key(|n| {
                (
                    n.rtmetric,
                    Some(n.addr) != current,
                    Some(n.addr) != pending,
                    n.addr,
                )
            })
    }
}
