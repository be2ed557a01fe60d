use rand::Rng;
use tracing::trace;

use super::photon::{Encoding, Photon};
use crate::network::NodeId;
use crate::protocols::message::Message;
use crate::quantum::PauliError;
use crate::simulation::{EventPayload, Time, Timeline};

/// Speed of light in fiber, meters per picosecond (2e8 m/s).
pub const LIGHT_SPEED_M_PER_PS: f64 = 2e-4;

/// Index of a channel in the network's channel arena.
pub type ChannelId = usize;

/// Default minimum emission frequency of a quantum channel, Hz.
pub const DEFAULT_QC_FREQUENCY_HZ: f64 = 8e7;

fn propagation_delay_ps(distance_m: f64) -> Time {
    (distance_m / LIGHT_SPEED_M_PER_PS).round() as Time
}

/// A classical channel between two nodes: constant delay, no loss.
///
/// Constant per-channel delay means messages between two nodes arrive in
/// send order.
#[derive(Debug)]
pub struct ClassicalChannel {
    pub name: String,
    pub ends: (NodeId, NodeId),
    pub distance_m: f64,
    pub delay_ps: Time,
}

impl ClassicalChannel {
    /// `delay` falls back to `distance / LIGHT_SPEED` when not given.
    pub fn new(
        name: impl Into<String>,
        ends: (NodeId, NodeId),
        distance_m: f64,
        delay: Option<Time>,
    ) -> Self {
        ClassicalChannel {
            name: name.into(),
            ends,
            distance_m,
            delay_ps: delay.unwrap_or_else(|| propagation_delay_ps(distance_m)),
        }
    }

    pub fn other_end(&self, node: NodeId) -> Option<NodeId> {
        if self.ends.0 == node {
            Some(self.ends.1)
        } else if self.ends.1 == node {
            Some(self.ends.0)
        } else {
            None
        }
    }

    /// Schedule delivery of `msg` at the far end after this channel's
    /// delay. Classical payloads are never lost.
    pub fn transmit(&self, tl: &mut Timeline, src: NodeId, src_name: String, msg: Message) {
        let dst = self
            .other_end(src)
            .unwrap_or_else(|| panic!("node {} is not an end of channel {}", src, self.name));
        let arrival = tl.now() + self.delay_ps;
        tl.schedule(
            arrival,
            EventPayload::ReceiveMessage {
                dst,
                src: src_name,
                msg,
            },
        );
    }
}

/// A quantum channel: attenuation loss, depolarization, propagation
/// delay, and a minimum inter-emission interval of `1 / frequency`.
#[derive(Debug)]
pub struct QuantumChannel {
    pub name: String,
    pub ends: (NodeId, NodeId),
    pub distance_m: f64,
    pub delay_ps: Time,
    /// Loss in dB per meter (0.0002 dB/m is typical telecom fiber).
    pub attenuation_db_per_m: f64,
    pub polarization_fidelity: f64,
    pub frequency_hz: f64,
    /// Last granted emission time, per direction.
    last_send: [Option<Time>; 2],
    pub dropped_photons: u64,
}

impl QuantumChannel {
    pub fn new(
        name: impl Into<String>,
        ends: (NodeId, NodeId),
        distance_m: f64,
        attenuation_db_per_m: f64,
    ) -> Self {
        QuantumChannel {
            name: name.into(),
            ends,
            distance_m,
            delay_ps: propagation_delay_ps(distance_m),
            attenuation_db_per_m,
            polarization_fidelity: 1.0,
            frequency_hz: DEFAULT_QC_FREQUENCY_HZ,
            last_send: [None, None],
            dropped_photons: 0,
        }
    }

    pub fn other_end(&self, node: NodeId) -> Option<NodeId> {
        if self.ends.0 == node {
            Some(self.ends.1)
        } else if self.ends.1 == node {
            Some(self.ends.0)
        } else {
            None
        }
    }

    /// Probability a photon survives the fiber:
    /// p = 10^(−attenuation · distance / 10).
    pub fn survival_probability(&self) -> f64 {
        10f64.powf(-self.attenuation_db_per_m * self.distance_m / 10.0)
    }

    /// Minimum spacing between emissions, picoseconds.
    pub fn min_interval_ps(&self) -> Time {
        if self.frequency_hz > 0.0 {
            (1e12 / self.frequency_hz).round() as Time
        } else {
            0
        }
    }

    /// Grant an emission slot no earlier than `proposed`:
    /// `send_time = max(now, proposed, last_send + interval)`.
    /// The granted time is recorded, so senders observe the adjusted
    /// schedule.
    pub fn reserve_send_time(&mut self, sender: NodeId, now: Time, proposed: Time) -> Time {
        let dir = self.dir_index(sender);
        let mut t = proposed.max(now);
        if let Some(last) = self.last_send[dir] {
            t = t.max(last + self.min_interval_ps());
        }
        self.last_send[dir] = Some(t);
        t
    }

    /// Send a photon toward the far end. Lost photons are dropped
    /// silently (counted); null photons draw no randomness but keep the
    /// same timing. Polarization encoding depolarizes with probability
    /// `1 − polarization_fidelity`.
    pub fn transmit(
        &mut self,
        tl: &mut Timeline,
        src: NodeId,
        src_name: String,
        mut photon: Photon,
    ) -> bool {
        let dst = self
            .other_end(src)
            .unwrap_or_else(|| panic!("node {} is not an end of channel {}", src, self.name));
        if !photon.is_null {
            let survival = self.survival_probability();
            if tl.rng().random::<f64>() > survival {
                self.dropped_photons += 1;
                trace!(channel = %self.name, photon = %photon.name, "photon lost in fiber");
                return false;
            }
            if photon.encoding == Encoding::Polarization && self.polarization_fidelity < 1.0 {
                let flip = tl.rng().random::<f64>() > self.polarization_fidelity;
                if flip {
                    let error = PauliError::sample(tl.rng());
                    photon.state.apply_error(error);
                }
            }
        }
        let arrival = tl.now() + self.delay_ps;
        tl.schedule(
            arrival,
            EventPayload::ReceiveQubit {
                dst,
                src: src_name,
                photon,
            },
        );
        true
    }

    fn dir_index(&self, sender: NodeId) -> usize {
        if sender == self.ends.0 {
            0
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SECOND;

    #[test]
    fn test_classical_delay_from_distance() {
        let cc = ClassicalChannel::new("cc", (0, 1), 1e3, None);
        // 1 km of fiber at 2e8 m/s is 5 microseconds.
        assert_eq!(cc.delay_ps, 5_000_000);
        let explicit = ClassicalChannel::new("cc2", (0, 1), 1e3, Some(42));
        assert_eq!(explicit.delay_ps, 42);
    }

    #[test]
    fn test_zero_distance_delay_is_zero() {
        let cc = ClassicalChannel::new("cc", (0, 1), 0.0, None);
        assert_eq!(cc.delay_ps, 0);
    }

    #[test]
    fn test_other_end() {
        let cc = ClassicalChannel::new("cc", (3, 7), 1.0, None);
        assert_eq!(cc.other_end(3), Some(7));
        assert_eq!(cc.other_end(7), Some(3));
        assert_eq!(cc.other_end(5), None);
    }

    #[test]
    fn test_survival_probability() {
        let qc = QuantumChannel::new("qc", (0, 1), 2e4, 2e-4);
        // 20 km at 0.2 dB/km is 4 dB: p = 10^-0.4
        assert!((qc.survival_probability() - 10f64.powf(-0.4)).abs() < 1e-12);

        let lossless = QuantumChannel::new("qc2", (0, 1), 2e4, 0.0);
        assert!((lossless.survival_probability() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_rate_limited_send_times() {
        let mut qc = QuantumChannel::new("qc", (0, 1), 1.0, 0.0);
        qc.frequency_hz = 8e7;
        // First request on an idle channel goes out as asked.
        assert_eq!(qc.reserve_send_time(0, 0, 0), 0);
        // Second is pushed one interval out: 1e12 / 8e7 = 12_500 ps.
        assert_eq!(qc.reserve_send_time(0, 0, 0), 12_500);
        // A request far in the future is already past the rate limit.
        assert_eq!(qc.reserve_send_time(0, 0, SECOND), SECOND);
    }

    #[test]
    fn test_directions_rate_limit_independently() {
        let mut qc = QuantumChannel::new("qc", (0, 1), 1.0, 0.0);
        qc.frequency_hz = 8e7;
        assert_eq!(qc.reserve_send_time(0, 0, 0), 0);
        assert_eq!(qc.reserve_send_time(1, 0, 0), 0);
    }

    #[test]
    fn test_lossless_transmit_schedules_arrival() {
        let mut tl = Timeline::new(SECOND, 1);
        let mut qc = QuantumChannel::new("qc", (0, 1), 2e4, 0.0);
        let delivered = qc.transmit(&mut tl, 0, "a".into(), Photon::new("p"));
        assert!(delivered);
        assert_eq!(tl.pending_events(), 1);
        assert_eq!(tl.peek_next_time(), Some(100_000_000));
    }
}
