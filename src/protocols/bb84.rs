use std::collections::BTreeMap;

use rand::Rng;
use tracing::{debug, info};

use crate::components::detector::Detector;
use crate::components::light_source::LightSource;
use crate::components::photon::Photon;
use crate::error::SimError;
use crate::network::{Network, NodeId};
use crate::protocols::message::{Bb84Message, Message};
use crate::quantum::Basis;
use crate::simulation::{EventPayload, Simulation, Time, Timeline, SECOND};

/// Post-train settling margin before basis reconciliation, picoseconds.
const CONCLUDE_MARGIN_PS: Time = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bb84Role {
    Sender,
    Receiver,
}

/// One endpoint's half of a BB84 key generation session.
///
/// The sender drives a pulse train from its light source; the receiver
/// measures arrivals in random bases. After the train the sender
/// announces bases, the receiver answers with its sifted bits, and the
/// sender estimates the quantum bit error rate over the full sift.
/// Privacy amplification and cascade-style reconciliation are out of
/// scope; the metrics are the point.
#[derive(Debug)]
pub struct Bb84 {
    pub role: Bb84Role,
    pub peer: String,
    pub rounds: u32,
    pub period_ps: Time,
    started: Option<Time>,
    /// Sender side: (bit, basis) per pulse round.
    sent: Vec<(bool, Basis)>,
    /// Receiver side: click per round.
    clicks: BTreeMap<u64, (bool, Basis)>,
    pub error_rates: Vec<f64>,
    pub throughputs: Vec<f64>,
    pub sifted_counts: Vec<usize>,
    pub latency_s: f64,
    pub key_bits: Vec<bool>,
    pub finished: bool,
}

impl Bb84 {
    pub fn sender(peer: impl Into<String>, rounds: u32, period_ps: Time) -> Self {
        Bb84::new(Bb84Role::Sender, peer, rounds, period_ps)
    }

    pub fn receiver(peer: impl Into<String>, rounds: u32, period_ps: Time) -> Self {
        Bb84::new(Bb84Role::Receiver, peer, rounds, period_ps)
    }

    fn new(role: Bb84Role, peer: impl Into<String>, rounds: u32, period_ps: Time) -> Self {
        Bb84 {
            role,
            peer: peer.into(),
            rounds,
            period_ps,
            started: None,
            sent: Vec::new(),
            clicks: BTreeMap::new(),
            error_rates: Vec::new(),
            throughputs: Vec::new(),
            sifted_counts: Vec::new(),
            latency_s: 0.0,
            key_bits: Vec::new(),
            finished: false,
        }
    }
}

/// Bind a sender/receiver pair onto two endpoints. The sender needs a
/// light source, the receiver at least two detectors (one per bit value).
pub fn install_bb84_pair(
    network: &mut Network,
    sender: &str,
    receiver: &str,
    rounds: u32,
) -> Result<(), SimError> {
    let period = {
        let node = network
            .node_by_name(sender)
            .ok_or_else(|| SimError::UnknownNode(sender.to_string(), "bb84".into()))?;
        let state = node
            .try_endpoint()
            .ok_or_else(|| SimError::Config(format!("bb84 sender `{}` is not an endpoint", sender)))?;
        let source = state
            .light_source
            .as_ref()
            .ok_or_else(|| SimError::Config(format!("bb84 sender `{}` has no light source", sender)))?;
        source.period_ps()
    };
    {
        let node = network
            .node_by_name_mut(receiver)
            .ok_or_else(|| SimError::UnknownNode(receiver.to_string(), "bb84".into()))?;
        let state = node.try_endpoint_mut().ok_or_else(|| {
            SimError::Config(format!("bb84 receiver `{}` is not an endpoint", receiver))
        })?;
        if state.detectors.len() < 2 {
            return Err(SimError::Config(format!(
                "bb84 receiver `{}` needs two detectors",
                receiver
            )));
        }
        state.bb84 = Some(Bb84::receiver(sender, rounds, period));
    }
    let node = network
        .node_by_name_mut(sender)
        .expect("sender checked above");
    node.try_endpoint_mut().expect("endpoint checked above").bb84 =
        Some(Bb84::sender(receiver, rounds, period));
    Ok(())
}

impl Network {
    /// One pulse of the sender's train: draw bit and basis, maybe emit,
    /// reschedule, and after the last pulse book the reconciliation step.
    pub(crate) fn bb84_source_pulse(&mut self, tl: &mut Timeline, node: NodeId, remaining: u32) {
        let name = self.nodes[node].name.clone();
        let now = tl.now();
        let (peer, photon, period) = {
            let Some(state) = self.nodes[node].try_endpoint_mut() else {
                return;
            };
            let Some(bb84) = state.bb84.as_mut() else {
                return;
            };
            if bb84.role != Bb84Role::Sender || remaining == 0 {
                return;
            }
            if bb84.started.is_none() {
                bb84.started = Some(now);
            }
            let round = bb84.rounds - remaining;
            let bit = tl.rng().random::<bool>();
            let basis = if tl.rng().random::<bool>() {
                Basis::Rectilinear
            } else {
                Basis::Diagonal
            };
            bb84.sent.push((bit, basis));
            let peer = bb84.peer.clone();
            let source = state
                .light_source
                .as_mut()
                .expect("bb84 sender keeps its light source");
            let photon = source.emit_pulse(round.to_string(), bit, basis, tl.rng());
            (peer, photon, source.period_ps())
        };
        if let Some(photon) = photon {
            self.send_qubit(tl, node, &peer, photon);
        }
        if remaining > 1 {
            tl.schedule(
                now + period,
                EventPayload::SourcePulse {
                    node,
                    remaining: remaining - 1,
                },
            );
        } else {
            let settle = self.quantum_delay(&name, &peer)
                + self.classical_delay(node, &peer)
                + CONCLUDE_MARGIN_PS;
            tl.schedule(now + settle, EventPayload::Bb84Conclude { node });
        }
    }

    /// Receiver measuring one arriving pulse in a random basis.
    pub(crate) fn bb84_on_photon(&mut self, tl: &mut Timeline, node: NodeId, photon: Photon) {
        let now = tl.now();
        let Ok(round) = photon.name.parse::<u64>() else {
            return;
        };
        let Some(state) = self.nodes[node].try_endpoint_mut() else {
            return;
        };
        let Some(bb84) = state.bb84.as_mut() else {
            return;
        };
        if bb84.role != Bb84Role::Receiver || bb84.clicks.contains_key(&round) {
            return;
        }
        let basis = if tl.rng().random::<bool>() {
            Basis::Rectilinear
        } else {
            Basis::Diagonal
        };
        let mut qubit = photon.state;
        let bit = qubit.measure(basis, tl.rng());
        let detector = usize::from(bit);
        if detector < state.detectors.len()
            && state.detectors[detector].try_detect(now, tl.rng()).is_some()
        {
            bb84.clicks.insert(round, (bit, basis));
        }
    }

    /// A dark count on the receiver registers as a click in whatever
    /// pulse bin the clock falls in.
    pub(crate) fn bb84_on_dark(&mut self, tl: &mut Timeline, node: NodeId, detector: usize) {
        let now = tl.now();
        let Some(state) = self.nodes[node].try_endpoint_mut() else {
            return;
        };
        if detector >= state.detectors.len()
            || state.detectors[detector].dark_click(now).is_none()
        {
            return;
        }
        let Some(bb84) = state.bb84.as_mut() else {
            return;
        };
        let round = now / bb84.period_ps.max(1);
        if round >= u64::from(bb84.rounds) || bb84.clicks.contains_key(&round) {
            return;
        }
        let basis = if tl.rng().random::<bool>() {
            Basis::Rectilinear
        } else {
            Basis::Diagonal
        };
        bb84.clicks.insert(round, (detector == 1, basis));
    }

    /// Pulse train done: the sender announces its bases.
    pub(crate) fn bb84_conclude(&mut self, tl: &mut Timeline, node: NodeId) {
        let (peer, bases) = {
            let Some(state) = self.nodes[node].try_endpoint_mut() else {
                return;
            };
            let Some(bb84) = state.bb84.as_ref() else {
                return;
            };
            if bb84.role != Bb84Role::Sender {
                return;
            }
            (
                bb84.peer.clone(),
                bb84.sent.iter().map(|(_, basis)| *basis).collect::<Vec<_>>(),
            )
        };
        self.send_message(tl, node, &peer, Message::Bb84(Bb84Message::Bases { bases }));
    }

    pub(crate) fn bb84_on_message(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        src: String,
        frame: Bb84Message,
    ) {
        match frame {
            Bb84Message::Bases { bases } => self.bb84_sift(tl, node, src, bases),
            Bb84Message::Sifted { rounds, bits } => self.bb84_estimate(tl, node, rounds, bits),
        }
    }

    /// Receiver keeping the rounds where its basis matched the sender's.
    fn bb84_sift(&mut self, tl: &mut Timeline, node: NodeId, src: String, bases: Vec<Basis>) {
        let (rounds, bits) = {
            let Some(state) = self.nodes[node].try_endpoint_mut() else {
                return;
            };
            let Some(bb84) = state.bb84.as_mut() else {
                return;
            };
            if bb84.role != Bb84Role::Receiver {
                return;
            }
            let mut rounds = Vec::new();
            let mut bits = Vec::new();
            for (&round, &(bit, basis)) in &bb84.clicks {
                if (round as usize) < bases.len() && basis == bases[round as usize] {
                    rounds.push(round);
                    bits.push(bit);
                }
            }
            bb84.key_bits = bits.clone();
            bb84.clicks.clear();
            bb84.finished = true;
            (rounds, bits)
        };
        debug!(node = %self.nodes[node].name, sifted = rounds.len(), "bb84 sift complete");
        self.send_message(
            tl,
            node,
            &src,
            Message::Bb84(Bb84Message::Sifted { rounds, bits }),
        );
    }

    /// Sender comparing the receiver's sifted bits against what it sent.
    fn bb84_estimate(&mut self, tl: &mut Timeline, node: NodeId, rounds: Vec<u64>, bits: Vec<bool>) {
        let now = tl.now();
        let name = self.nodes[node].name.clone();
        let Some(state) = self.nodes[node].try_endpoint_mut() else {
            return;
        };
        let Some(bb84) = state.bb84.as_mut() else {
            return;
        };
        if bb84.role != Bb84Role::Sender {
            return;
        }
        let mut errors = 0usize;
        let mut key = Vec::new();
        for (round, bit) in rounds.iter().zip(&bits) {
            let (sent_bit, _) = bb84.sent[*round as usize];
            if sent_bit == *bit {
                key.push(*bit);
            } else {
                errors += 1;
            }
        }
        let sifted = rounds.len();
        let error_rate = if sifted > 0 {
            errors as f64 / sifted as f64
        } else {
            0.0
        };
        let elapsed_s = now.saturating_sub(bb84.started.unwrap_or(0)) as f64 / SECOND as f64;
        let throughput = if elapsed_s > 0.0 {
            sifted as f64 / elapsed_s
        } else {
            0.0
        };
        bb84.error_rates.push(error_rate);
        bb84.throughputs.push(throughput);
        bb84.sifted_counts.push(sifted);
        bb84.latency_s = elapsed_s;
        bb84.key_bits = key;
        bb84.finished = true;
        info!(
            node = %name,
            sifted,
            error_rate,
            throughput,
            "bb84 key generation finished"
        );
        // The key is the whole experiment; remaining dark counts do not
        // need to play out.
        tl.stop();
    }
}

/// Outcome of one seeded BB84 run over a single fiber span.
#[derive(Debug, Clone)]
pub struct Bb84TrialStats {
    pub distance_km: f64,
    pub error_rate: f64,
    pub throughput: f64,
    pub latency_s: f64,
    pub sifted_bits: usize,
}

/// Build and run one two-endpoint BB84 session: a 2 MHz weak-coherent
/// source with mean photon number 0.1 against a two-detector receiver,
/// over `distance_km` of fiber.
pub fn run_distance_trial(
    distance_km: f64,
    attenuation_db_per_m: f64,
    dark_count_rate_hz: f64,
    rounds: u32,
    seed: u64,
) -> Result<Bb84TrialStats, SimError> {
    let distance_m = distance_km * 1e3;
    let period: Time = 500_000;
    let delay = (distance_m / crate::components::LIGHT_SPEED_M_PER_PS).round() as Time;
    let runtime = Time::from(rounds) * period + 4 * delay + SECOND / 100;

    let mut sim = Simulation::new(runtime, seed);
    sim.network.add_endpoint("alice")?;
    sim.network.add_endpoint("bob")?;
    sim.network
        .connect_quantum("alice", "bob", distance_m, attenuation_db_per_m)?;
    sim.network
        .connect_classical("alice", "bob", distance_m, None)?;

    sim.network
        .node_by_name_mut("alice")
        .expect("alice registered")
        .try_endpoint_mut()
        .expect("alice is an endpoint")
        .light_source = Some(LightSource::new("alice.lightsource", 2e6, 0.1));
    sim.network
        .node_by_name_mut("bob")
        .expect("bob registered")
        .try_endpoint_mut()
        .expect("bob is an endpoint")
        .detectors = vec![Detector::new(0.8, dark_count_rate_hz, 10, 5e7); 2];

    install_bb84_pair(&mut sim.network, "alice", "bob", rounds)?;
    sim.init()?;
    sim.run()?;

    let bb84 = sim
        .network
        .node_by_name("alice")
        .expect("alice registered")
        .endpoint()
        .bb84
        .as_ref()
        .expect("bb84 installed");
    Ok(Bb84TrialStats {
        distance_km,
        error_rate: bb84.error_rates.last().copied().unwrap_or(0.0),
        throughput: bb84.throughputs.last().copied().unwrap_or(0.0),
        latency_s: bb84.latency_s,
        sifted_bits: bb84.sifted_counts.last().copied().unwrap_or(0),
    })
}
