//! Core traits for transport, time, randomness and result delivery.
//!
//! These traits allow the protocol to be used with different:
//! - Transport layers (802.15.4 radio, LoRa, UDP multicast, simulation)
//! - Time sources (hardware timers, simulated time)
//! - Random number generators

use alloc::vec::Vec;
use core::future::Future;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;

use crate::time::Timestamp;
use crate::types::{AggregateFunction, Command, Event, Incoming};

/// Queue size for transport channels.
pub(crate) const TRANSPORT_QUEUE_SIZE: usize = 16;

/// Queue size for the command channel.
pub(crate) const COMMAND_QUEUE_SIZE: usize = 8;

/// Queue size for the event channel.
pub(crate) const EVENT_QUEUE_SIZE: usize = 16;

/// Mutex type used for channels.
///
/// The protocol task owns the node; producers live on the same executor.
pub(crate) type ChannelMutex = NoopRawMutex;

/// Incoming transport message channel type.
pub type TransportInChannel = Channel<ChannelMutex, Incoming, TRANSPORT_QUEUE_SIZE>;

/// Outgoing transport frame channel type.
pub type TransportOutChannel = Channel<ChannelMutex, Vec<u8>, TRANSPORT_QUEUE_SIZE>;

/// Application command channel.
pub type CommandChannel = Channel<ChannelMutex, Command, COMMAND_QUEUE_SIZE>;

/// Protocol event channel.
pub type EventChannel = Channel<ChannelMutex, Event, EVENT_QUEUE_SIZE>;

/// Broadcast transport for radio/network backends.
///
/// Every frame is broadcast on the medium; unicast semantics are carried in
/// the frame itself (receiver field). The node queues encoded frames on
/// `outgoing()` and reads received frames from `incoming()`.
///
/// # Usage Pattern
///
/// ```ignore
/// use aggtree::traits::test_impls::MockTransport;
/// use aggtree::Transport;
///
/// let transport = MockTransport::new();
/// transport.outgoing().try_send(vec![1, 2, 3]).unwrap();
/// assert_eq!(transport.take_sent(), vec![vec![1, 2, 3]]);
/// ```
pub trait Transport {
    /// Maximum frame size for this transport.
    ///
    /// Frames larger than the MTU are never queued.
    fn mtu(&self) -> usize;

    /// Channel of encoded frames awaiting transmission.
    fn outgoing(&self) -> &TransportOutChannel;

    /// Channel of received frames.
    ///
    /// - Radio ISR or driver task calls `incoming().try_send(msg)`
    /// - Simulator calls `incoming().try_send(msg)` to deliver frames
    /// - Node calls `incoming().receive().await`
    fn incoming(&self) -> &TransportInChannel;

    /// Whether a neighbor heard at `rssi` is good enough to be a parent.
    ///
    /// Default implementation accepts everything.
    fn is_acceptable_rssi(&self, rssi: Option<i16>) -> bool {
        let _ = rssi;
        true
    }
}

/// Time source trait for real or simulated time.
///
/// # Example (testing with MockClock)
///
/// ```ignore
/// use aggtree::traits::test_impls::MockClock;
/// use aggtree::{Clock, Duration, Timestamp};
///
/// let clock = MockClock::new();
/// assert_eq!(clock.now(), Timestamp::ZERO);
///
/// clock.advance(Duration::from_secs(10));
/// assert_eq!(clock.now(), Timestamp::from_secs(10));
/// ```
///
/// # Example (embedded with embassy)
///
/// ```text
/// struct EmbassyClock;
///
/// impl Clock for EmbassyClock {
///     type SleepFuture<'a> = embassy_time::Timer;
///
///     fn now(&self) -> Timestamp {
///         Timestamp::from_millis(embassy_time::Instant::now().as_millis())
///     }
///
///     fn sleep_until(&self, time: Timestamp) -> Self::SleepFuture<'_> {
///         embassy_time::Timer::at(embassy_time::Instant::from_millis(time.as_millis()))
///     }
/// }
/// ```
pub trait Clock {
    /// Future type returned by sleep_until.
    type SleepFuture<'a>: Future<Output = ()>
    where
        Self: 'a;

    fn now(&self) -> Timestamp;

    fn sleep_until(&self, time: Timestamp) -> Self::SleepFuture<'_>;
}

/// Random number generator trait.
///
/// Used for announcement, flood and retransmission jitter.
pub trait Random {
    /// Generate a random u64 in the range [min, max).
    fn gen_range(&mut self, min: u64, max: u64) -> u64;
}

/// Receiver of aggregate results at the sink.
///
/// Invoked once per distinct (function, value) outcome of a round.
pub trait ResultHandler {
    fn on_result(&mut self, function: AggregateFunction, value: i32);
}

impl<F> ResultHandler for F
where
    F: FnMut(AggregateFunction, i32),
{
    fn on_result(&mut self, function: AggregateFunction, value: i32) {
        self(function, value)
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_impls {
    //! Mock implementations of traits for unit testing and doc tests.
    //!
    //! Available when running tests or with the `test-support` feature enabled.

    use core::cell::Cell;
    use core::future::{ready, Ready};

    use super::*;

    /// Mock transport that records frames instead of transmitting them.
    pub struct MockTransport {
        mtu: usize,
        min_rssi: Option<i16>,
        outgoing: TransportOutChannel,
        incoming: TransportInChannel,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self {
                mtu: 127,
                min_rssi: None,
                outgoing: Channel::new(),
                incoming: Channel::new(),
            }
        }
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_mtu(mtu: usize) -> Self {
            Self {
                mtu,
                ..Self::default()
            }
        }

        /// Reject parents heard below `min_rssi` dBm.
        pub fn with_min_rssi(min_rssi: i16) -> Self {
            Self {
                min_rssi: Some(min_rssi),
                ..Self::default()
            }
        }

        /// Inject a frame as if it was received.
        pub fn inject_rx(&self, data: Vec<u8>, rssi: Option<i16>) {
            let _ = self.incoming.try_send(Incoming::new(data, rssi));
        }

        /// Take all queued outgoing frames in send order.
        pub fn take_sent(&self) -> Vec<Vec<u8>> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.outgoing.try_receive() {
                frames.push(frame);
            }
            frames
        }
    }

    impl Transport for MockTransport {
        fn mtu(&self) -> usize {
            self.mtu
        }

        fn outgoing(&self) -> &TransportOutChannel {
            &self.outgoing
        }

        fn incoming(&self) -> &TransportInChannel {
            &self.incoming
        }

        fn is_acceptable_rssi(&self, rssi: Option<i16>) -> bool {
            match (self.min_rssi, rssi) {
                (Some(min), Some(rssi)) => rssi >= min,
                _ => true,
            }
        }
    }

    /// Mock clock for testing (synchronous, time advances manually).
    pub struct MockClock {
        current: Cell<Timestamp>,
    }

    impl Default for MockClock {
        fn default() -> Self {
            Self {
                current: Cell::new(Timestamp::ZERO),
            }
        }
    }

    impl MockClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set(&self, time: Timestamp) {
            self.current.set(time);
        }

        pub fn advance(&self, duration: crate::time::Duration) {
            self.current.set(self.current.get() + duration);
        }
    }

    impl Clock for MockClock {
        type SleepFuture<'a> = Ready<()>;

        fn now(&self) -> Timestamp {
            self.current.get()
        }

        fn sleep_until(&self, _time: Timestamp) -> Self::SleepFuture<'_> {
            // Test code advances time manually.
            ready(())
        }
    }

    /// Mock random for testing (deterministic LCG).
    pub struct MockRandom {
        pub state: u64,
    }

    impl Default for MockRandom {
        fn default() -> Self {
            Self { state: 12345 }
        }
    }

    impl MockRandom {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_seed(seed: u64) -> Self {
            Self { state: seed }
        }
    }

    impl Random for MockRandom {
        fn gen_range(&mut self, min: u64, max: u64) -> u64 {
            self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let range = max.saturating_sub(min);
            if range == 0 {
                return min;
            }
            min + (self.state >> 33) % range
        }
    }

    /// Result handler that records every delivered result.
    #[derive(Debug, Default, Clone, PartialEq, Eq)]
    pub struct ResultLog {
        pub results: Vec<(AggregateFunction, i32)>,
    }

    impl ResultLog {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn last(&self) -> Option<(AggregateFunction, i32)> {
            self.results.last().copied()
        }
    }

    impl ResultHandler for ResultLog {
        fn on_result(&mut self, function: AggregateFunction, value: i32) {
            self.results.push((function, value));
        }
    }
}
