//! Time types and the per-connection timer set.
//!
//! All time values are passed explicitly so the protocol can be driven by a
//! deterministic simulator. Timers are plain deadlines owned by the node; the
//! node's event loop sleeps until the earliest one.

use core::ops::{Add, Sub};

/// Protocol timestamp in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Zero timestamp (epoch).
    pub const ZERO: Timestamp = Timestamp(0);

    /// Maximum timestamp. A deadline at `MAX` never fires.
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(1000))
    }

    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Saturating addition of a duration.
    #[inline]
    pub const fn saturating_add(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.0))
    }

    /// Saturating subtraction of another timestamp, returning a duration.
    #[inline]
    pub const fn saturating_sub(self, other: Timestamp) -> Duration {
        Duration(self.0.saturating_sub(other.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn add(self, rhs: Duration) -> Timestamp {
        self.saturating_add(rhs)
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Timestamp) -> Duration {
        self.saturating_sub(rhs)
    }
}

/// Duration in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(u64);

impl Duration {
    pub const ZERO: Duration = Duration(0);

    /// Maximum duration, used to disable an interval.
    pub const MAX: Duration = Duration(u64::MAX);

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Duration(ms)
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Duration(secs.saturating_mul(1000))
    }

    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn saturating_add(self, other: Duration) -> Self {
        Duration(self.0.saturating_add(other.0))
    }

    #[inline]
    pub const fn saturating_mul(self, n: u64) -> Self {
        Duration(self.0.saturating_mul(n))
    }
}

impl Add for Duration {
    type Output = Duration;

    #[inline]
    fn add(self, rhs: Duration) -> Duration {
        self.saturating_add(rhs)
    }
}

/// Exponential backoff: `base * 2^retry`, capped at `max`.
pub fn backoff(base: Duration, retry: u8, max: Duration) -> Duration {
    let factor = 1u64.checked_shl(u32::from(retry)).unwrap_or(u64::MAX);
    base.saturating_mul(factor).min(max)
}

/// Timers owned by one aggregation connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Periodic cost advertisement (also armed early for proactive sends).
    Announce,
    /// Periodic soliciting probe.
    Probe,
    /// Parent-liveness keepalive.
    Keepalive,
    /// Retransmission of the head-of-queue packet.
    Retransmit,
    /// Hold-down before committing a parent switch.
    HoldDown,
    /// Merge window of the current round.
    MergeWindow,
    /// Control flood relay or resend.
    Flood,
}

impl TimerKind {
    pub const COUNT: usize = 7;

    pub const ALL: [TimerKind; Self::COUNT] = [
        TimerKind::Announce,
        TimerKind::Probe,
        TimerKind::Keepalive,
        TimerKind::Retransmit,
        TimerKind::HoldDown,
        TimerKind::MergeWindow,
        TimerKind::Flood,
    ];

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }
}

/// Set of timers that expired in one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Expired(u8);

impl Expired {
    #[inline]
    pub fn contains(self, kind: TimerKind) -> bool {
        self.0 & (1 << kind.index()) != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Expired timers in declaration order.
    pub fn iter(self) -> impl Iterator<Item = TimerKind> {
        TimerKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

/// Deadline per timer kind. Unarmed timers hold `None`.
#[derive(Debug, Clone, Default)]
pub struct Timers {
    deadlines: [Option<Timestamp>; TimerKind::COUNT],
}

impl Timers {
    pub const fn new() -> Self {
        Self {
            deadlines: [None; TimerKind::COUNT],
        }
    }

    /// Arm `kind` at `at`, replacing any previous deadline.
    ///
    /// A deadline of `Timestamp::MAX` disarms the timer.
    pub fn arm(&mut self, kind: TimerKind, at: Timestamp) {
        self.deadlines[kind.index()] = (at != Timestamp::MAX).then_some(at);
    }

    pub fn arm_after(&mut self, kind: TimerKind, now: Timestamp, delay: Duration) {
        self.arm(kind, now.saturating_add(delay));
    }

    /// Arm `kind` at `at` only if that is sooner than its current deadline.
    pub fn arm_earlier(&mut self, kind: TimerKind, at: Timestamp) -> bool {
        match self.deadlines[kind.index()] {
            Some(current) if current <= at => false,
            _ => {
                self.arm(kind, at);
                true
            }
        }
    }

    /// Disarm `kind`. Returns whether it was armed.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.deadlines[kind.index()].take().is_some()
    }

    pub fn cancel_all(&mut self) {
        self.deadlines = [None; TimerKind::COUNT];
    }

    #[inline]
    pub fn deadline(&self, kind: TimerKind) -> Option<Timestamp> {
        self.deadlines[kind.index()]
    }

    #[inline]
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines[kind.index()].is_some()
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// Disarm and return every timer whose deadline is at or before `now`.
    pub fn take_expired(&mut self, now: Timestamp) -> Expired {
        let mut expired = Expired::default();
        for kind in TimerKind::ALL {
            let slot = &mut self.deadlines[kind.index()];
            if slot.is_some_and(|at| at <= now) {
                *slot = None;
                expired.0 |= 1 << kind.index();
            }
        }
        expired
    }
}
