//! See [`Simulator`].
//!
//! For testing only: production builds should hand the endpoint the real
//! driver. Inducing loss, latency and duplication artificially, with a fixed
//! seed, is the only sane way to exercise the reliability layer without a
//! bad network on hand.

use rand::{rngs::StdRng, Rng, SeedableRng};
use web_time::{Duration, Instant};

use crate::driver::Driver;

/// Configuration for a [`Simulator`].
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Chance in `0.0..=1.0` that an outgoing datagram is dropped outright.
    pub loss_ratio: f32,
    /// Chance in `0.0..=1.0` that an outgoing datagram is sent twice, each
    /// copy jittered independently.
    pub duplicate_ratio: f32,
    /// Base delay applied to every outgoing datagram.
    pub min_latency: Duration,
    /// Additional delay sampled uniformly from `0..jitter` per datagram.
    /// Jitter reorders: a datagram drawn a long delay is overtaken by one
    /// drawn a short delay.
    pub jitter: Duration,
    /// Seed for the random source, for reproducible runs.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            loss_ratio: 0.0,
            duplicate_ratio: 0.0,
            min_latency: Duration::ZERO,
            jitter: Duration::ZERO,
            seed: 0,
        }
    }
}

#[derive(Debug)]
struct InFlight<P> {
    peer: P,
    datagram: Vec<u8>,
    deliver_at: Instant,
}

/// Wraps another [`Driver`] and mistreats its outgoing datagrams:
/// probabilistic loss, duplication, and scheduled delay with jitter.
///
/// Incoming traffic passes through untouched; wrap both ends to damage both
/// directions. Delayed datagrams sit in a queue until they come due, which
/// is checked on every [`Driver::poll_recv`].
#[derive(Debug)]
pub struct Simulator<D: Driver> {
    inner: D,
    loss_ratio: f32,
    duplicate_ratio: f32,
    min_latency: Duration,
    jitter: Duration,
    rng: StdRng,
    queue: Vec<InFlight<D::Peer>>,
}

impl<D: Driver> Simulator<D> {
    /// Wraps a driver.
    #[must_use]
    pub fn new(inner: D, config: SimulatorConfig) -> Self {
        Self {
            inner,
            loss_ratio: config.loss_ratio.clamp(0.0, 1.0),
            duplicate_ratio: config.duplicate_ratio.clamp(0.0, 1.0),
            min_latency: config.min_latency,
            jitter: config.jitter,
            rng: StdRng::seed_from_u64(config.seed),
            queue: Vec::new(),
        }
    }

    /// The wrapped driver.
    pub const fn inner_mut(&mut self) -> &mut D {
        &mut self.inner
    }

    fn delay(&mut self) -> Duration {
        if self.jitter.is_zero() {
            self.min_latency
        } else {
            self.min_latency + self.jitter.mul_f32(self.rng.random::<f32>())
        }
    }

    /// Hands every due datagram to the inner driver.
    fn flush_due(&mut self) -> Result<(), D::Error> {
        let now = Instant::now();
        let mut i = 0;
        while i < self.queue.len() {
            if self.queue[i].deliver_at <= now {
                let in_flight = self.queue.swap_remove(i);
                self.inner.send_to(in_flight.peer, &in_flight.datagram)?;
            } else {
                i += 1;
            }
        }
        Ok(())
    }
}

impl<D: Driver> Driver for Simulator<D> {
    type Peer = D::Peer;
    type Error = D::Error;

    fn start(&mut self) -> Result<(), Self::Error> {
        self.inner.start()
    }

    fn stop(&mut self) {
        self.queue.clear();
        self.inner.stop();
    }

    fn poll_recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, Self::Peer)>, Self::Error> {
        self.flush_due()?;
        self.inner.poll_recv(buf)
    }

    fn send_to(&mut self, peer: Self::Peer, datagram: &[u8]) -> Result<(), Self::Error> {
        if self.rng.random::<f32>() < self.loss_ratio {
            return Ok(());
        }
        let copies = 1 + usize::from(self.rng.random::<f32>() < self.duplicate_ratio);
        for _ in 0..copies {
            let deliver_at = Instant::now() + self.delay();
            self.queue.push(InFlight {
                peer,
                datagram: datagram.to_vec(),
                deliver_at,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::driver::DriverPeer;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Peer(u8);

    impl DriverPeer for Peer {
        fn peer_hash(&self) -> u64 {
            u64::from(self.0)
        }
    }

    /// Records everything sent through it.
    #[derive(Debug, Default)]
    struct RecordingDriver {
        sent: Vec<Vec<u8>>,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("never")]
    struct Never;

    impl Driver for RecordingDriver {
        type Peer = Peer;
        type Error = Never;

        fn start(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }

        fn stop(&mut self) {}

        fn poll_recv(&mut self, _: &mut [u8]) -> Result<Option<(usize, Peer)>, Self::Error> {
            Ok(None)
        }

        fn send_to(&mut self, _: Peer, datagram: &[u8]) -> Result<(), Self::Error> {
            self.sent.push(datagram.to_vec());
            Ok(())
        }
    }

    fn run(config: SimulatorConfig, datagrams: usize) -> usize {
        let mut sim = Simulator::new(RecordingDriver::default(), config);
        for i in 0..datagrams {
            sim.send_to(Peer(0), &[u8::try_from(i % 256).unwrap()]).unwrap();
        }
        let mut buf = [0u8; 16];
        sim.poll_recv(&mut buf).unwrap();
        sim.inner.sent.len()
    }

    #[test]
    fn passthrough_when_disabled() {
        let delivered = run(SimulatorConfig::default(), 100);
        assert_eq!(100, delivered);
    }

    #[test]
    fn full_loss_delivers_nothing() {
        let config = SimulatorConfig {
            loss_ratio: 1.0,
            ..SimulatorConfig::default()
        };
        assert_eq!(0, run(config, 100));
    }

    #[test]
    fn half_loss_delivers_roughly_half() {
        let config = SimulatorConfig {
            loss_ratio: 0.5,
            seed: 1,
            ..SimulatorConfig::default()
        };
        let delivered = run(config, 1000);
        assert!(
            (300..700).contains(&delivered),
            "{delivered} of 1000 delivered at 50% loss"
        );
    }

    #[test]
    fn same_seed_same_outcome() {
        let config = SimulatorConfig {
            loss_ratio: 0.3,
            duplicate_ratio: 0.2,
            seed: 42,
            ..SimulatorConfig::default()
        };
        assert_eq!(run(config.clone(), 500), run(config, 500));
    }

    #[test]
    fn full_duplication_doubles_traffic() {
        let config = SimulatorConfig {
            duplicate_ratio: 1.0,
            ..SimulatorConfig::default()
        };
        assert_eq!(200, run(config, 100));
    }

    #[test]
    fn latency_holds_datagrams_until_due() {
        let config = SimulatorConfig {
            min_latency: Duration::from_secs(3600),
            ..SimulatorConfig::default()
        };
        assert_eq!(0, run(config, 10), "an hour of latency outlives the test");
    }
}
