pub mod manager;
pub mod node;
pub mod topology;

use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use crate::components::channel::{ChannelId, ClassicalChannel, QuantumChannel};
use crate::components::detector::{schedule_dark_counts, PhotonArrival};
use crate::components::photon::{HeraldKey, Photon};
use crate::error::SimError;
use crate::protocols::bb84::Bb84Role;
use crate::protocols::message::Message;
use crate::simulation::{EventPayload, Time, Timeline};

pub use manager::NetworkManager;
pub use node::{EndpointState, LinkAssignment, MiddleState, Node, NodeKind, RouterState};

/// Index of a node in the network's entity arena. Entities refer to each
/// other by id or name, never by back-pointer.
pub type NodeId = usize;

/// The entity graph: nodes and the channels between them.
///
/// The timeline owns virtual time and the event queue; this owns every
/// simulated entity. Event handlers here may mutate entity state, schedule
/// further events, and send messages, nothing else.
#[derive(Debug, Default)]
pub struct Network {
    pub nodes: Vec<Node>,
    pub cchannels: Vec<ClassicalChannel>,
    pub qchannels: Vec<QuantumChannel>,
    name_index: HashMap<String, NodeId>,
    /// BSM node sitting between a pair of adjacent routers, keyed by the
    /// sorted router pair.
    pub link_middles: BTreeMap<(String, String), String>,
}

impl Network {
    pub fn new() -> Self {
        Network::default()
    }

    fn register(&mut self, name: &str, kind: NodeKind) -> Result<NodeId, SimError> {
        if self.name_index.contains_key(name) {
            return Err(SimError::DuplicateNode(name.to_string()));
        }
        let id = self.nodes.len();
        self.nodes.push(Node::new(id, name, kind));
        self.name_index.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn add_router(&mut self, name: &str, memo_size: usize) -> Result<NodeId, SimError> {
        self.register(
            name,
            NodeKind::Router(Box::new(RouterState::new(name, memo_size))),
        )
    }

    pub fn add_middle(&mut self, name: &str) -> Result<NodeId, SimError> {
        self.register(
            name,
            NodeKind::Middle(Box::new(MiddleState {
                bsm: crate::components::detector::BsmStation::new(format!("{}.bsm", name)),
            })),
        )
    }

    pub fn add_endpoint(&mut self, name: &str) -> Result<NodeId, SimError> {
        self.register(name, NodeKind::Endpoint(Box::default()))
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.name_index.get(name).copied()
    }

    pub fn require_node_id(&self, name: &str, referenced_by: &str) -> Result<NodeId, SimError> {
        self.node_id(name)
            .ok_or_else(|| SimError::UnknownNode(name.to_string(), referenced_by.to_string()))
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.node_id(name).map(|id| &self.nodes[id])
    }

    pub fn node_by_name_mut(&mut self, name: &str) -> Option<&mut Node> {
        let id = self.node_id(name)?;
        Some(&mut self.nodes[id])
    }

    /// Names of every quantum router, in registration order.
    pub fn router_names(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.is_router())
            .map(|n| n.name.clone())
            .collect()
    }

    /// Wire a classical channel between two named nodes. Both ends get the
    /// peer mapping.
    pub fn connect_classical(
        &mut self,
        a: &str,
        b: &str,
        distance_m: f64,
        delay: Option<Time>,
    ) -> Result<ChannelId, SimError> {
        let ida = self.require_node_id(a, "cchannel")?;
        let idb = self.require_node_id(b, "cchannel")?;
        let cid = self.cchannels.len();
        self.cchannels.push(ClassicalChannel::new(
            format!("cc.{}.{}", a, b),
            (ida, idb),
            distance_m,
            delay,
        ));
        self.nodes[ida].cchannels.insert(b.to_string(), cid);
        self.nodes[idb].cchannels.insert(a.to_string(), cid);
        Ok(cid)
    }

    /// Wire a quantum channel between two named nodes.
    pub fn connect_quantum(
        &mut self,
        a: &str,
        b: &str,
        distance_m: f64,
        attenuation_db_per_m: f64,
    ) -> Result<ChannelId, SimError> {
        let ida = self.require_node_id(a, "qchannel")?;
        let idb = self.require_node_id(b, "qchannel")?;
        let cid = self.qchannels.len();
        self.qchannels.push(QuantumChannel::new(
            format!("qc.{}.{}", a, b),
            (ida, idb),
            distance_m,
            attenuation_db_per_m,
        ));
        self.nodes[ida].qchannels.insert(b.to_string(), cid);
        self.nodes[idb].qchannels.insert(a.to_string(), cid);
        Ok(cid)
    }

    fn cchannel_to(&self, src: NodeId, dst: &str) -> &ClassicalChannel {
        let cid = self.nodes[src].cchannels.get(dst).unwrap_or_else(|| {
            panic!(
                "no classical channel from `{}` to `{}`",
                self.nodes[src].name, dst
            )
        });
        &self.cchannels[*cid]
    }

    /// Propagation delay of the classical channel `src -> dst`.
    pub fn classical_delay(&self, src: NodeId, dst: &str) -> Time {
        self.cchannel_to(src, dst).delay_ps
    }

    /// Propagation delay of the quantum channel between two named nodes.
    pub fn quantum_delay(&self, src: &str, dst: &str) -> Time {
        let id = self
            .node_id(src)
            .unwrap_or_else(|| panic!("unknown node `{}`", src));
        let cid = self.nodes[id]
            .qchannels
            .get(dst)
            .unwrap_or_else(|| panic!("no quantum channel from `{}` to `{}`", src, dst));
        self.qchannels[*cid].delay_ps
    }

    /// Send a classical message to an adjacent node.
    pub fn send_message(&mut self, tl: &mut Timeline, src: NodeId, dst: &str, msg: Message) {
        let src_name = self.nodes[src].name.clone();
        let cid = *self.nodes[src].cchannels.get(dst).unwrap_or_else(|| {
            panic!("no classical channel from `{}` to `{}`", src_name, dst)
        });
        self.cchannels[cid].transmit(tl, src, src_name, msg);
    }

    /// Send a photon to an adjacent node. Returns false when the fiber
    /// ate it.
    pub fn send_qubit(&mut self, tl: &mut Timeline, src: NodeId, dst: &str, photon: Photon) -> bool {
        let src_name = self.nodes[src].name.clone();
        let cid = *self.nodes[src]
            .qchannels
            .get(dst)
            .unwrap_or_else(|| panic!("no quantum channel from `{}` to `{}`", src_name, dst));
        self.qchannels[cid].transmit(tl, src, src_name, photon)
    }

    /// Ask the quantum channel toward `dst` for an emission slot no
    /// earlier than `proposed`.
    pub fn reserve_qchannel_send_time(
        &mut self,
        src: NodeId,
        dst: &str,
        now: Time,
        proposed: Time,
    ) -> Time {
        let cid = *self.nodes[src].qchannels.get(dst).unwrap_or_else(|| {
            panic!(
                "no quantum channel from `{}` to `{}`",
                self.nodes[src].name, dst
            )
        });
        self.qchannels[cid].reserve_send_time(src, now, proposed)
    }

    /// BSM node between two adjacent routers, when one exists.
    pub fn middle_between(&self, a: &str, b: &str) -> Option<&String> {
        let key = if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        };
        self.link_middles.get(&key)
    }

    pub(crate) fn set_link_middle(&mut self, a: &str, b: &str, middle: &str) {
        let key = if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        };
        self.link_middles.insert(key, middle.to_string());
    }

    /// The per-entity init hook, invoked by `Simulation::init` in
    /// registration order: dark-count pre-scheduling, application kickoff,
    /// BB84 pulse trains.
    pub fn init_all(&mut self, tl: &mut Timeline) {
        for id in 0..self.nodes.len() {
            match &self.nodes[id].kind {
                NodeKind::Router(state) => {
                    if state.app.is_some() {
                        tl.schedule(tl.now(), EventPayload::AppNextRequest { node: id });
                    }
                }
                NodeKind::Middle(state) => {
                    let params: Vec<(f64, Time)> = state
                        .bsm
                        .detectors
                        .iter()
                        .map(|d| (d.dark_count_rate_hz, d.time_resolution_ps))
                        .collect();
                    for (i, (rate, res)) in params.into_iter().enumerate() {
                        schedule_dark_counts(tl, id, i, rate, res);
                    }
                }
                NodeKind::Endpoint(state) => {
                    let params: Vec<(f64, Time)> = state
                        .detectors
                        .iter()
                        .map(|d| (d.dark_count_rate_hz, d.time_resolution_ps))
                        .collect();
                    let pulses = state.bb84.as_ref().and_then(|p| {
                        (p.role == Bb84Role::Sender && p.rounds > 0).then_some(p.rounds)
                    });
                    for (i, (rate, res)) in params.into_iter().enumerate() {
                        schedule_dark_counts(tl, id, i, rate, res);
                    }
                    if let Some(rounds) = pulses {
                        tl.schedule(
                            tl.now(),
                            EventPayload::SourcePulse {
                                node: id,
                                remaining: rounds,
                            },
                        );
                    }
                }
            }
        }
    }

    /// Dispatch one event into the entity graph.
    pub fn handle(&mut self, tl: &mut Timeline, payload: EventPayload) {
        match payload {
            EventPayload::ReceiveMessage { dst, src, msg } => {
                self.on_receive_message(tl, dst, src, msg)
            }
            EventPayload::ReceiveQubit { dst, src, photon } => {
                self.on_receive_qubit(tl, dst, src, photon)
            }
            EventPayload::EmitPhoton { node, herald } => self.generation_emit(tl, node, herald),
            EventPayload::SourcePulse { node, remaining } => {
                self.bb84_source_pulse(tl, node, remaining)
            }
            EventPayload::BsmWindowClose { node, herald } => {
                self.bsm_window_close(tl, node, herald)
            }
            EventPayload::DarkCount { node, detector } => self.on_dark_count(tl, node, detector),
            EventPayload::MemoryExpire { node, index } => self.on_memory_expire(tl, node, index),
            EventPayload::GenerationTimeout { node, herald } => {
                self.generation_timeout(tl, node, herald)
            }
            EventPayload::GenerationRetry {
                node,
                reservation,
                index,
            } => self.generation_start_attempt(tl, node, reservation, index),
            EventPayload::ReservationStart { node, reservation } => {
                self.reservation_window_open(tl, node, reservation)
            }
            EventPayload::ReservationEnd { node, reservation } => {
                self.reservation_window_close(tl, node, reservation)
            }
            EventPayload::AppNextRequest { node } => self.app_next_request(tl, node),
            EventPayload::Bb84Conclude { node } => self.bb84_conclude(tl, node),
        }
    }

    fn on_receive_message(&mut self, tl: &mut Timeline, dst: NodeId, src: String, msg: Message) {
        match &self.nodes[dst].kind {
            NodeKind::Router(_) => self.router_on_message(tl, dst, src, msg),
            NodeKind::Endpoint(_) => match msg {
                Message::Raw(payload) => {
                    let now = tl.now();
                    if let Some(state) = self.nodes[dst].try_endpoint_mut() {
                        state.message_log.push((now, src, payload));
                    }
                }
                Message::Bb84(frame) => self.bb84_on_message(tl, dst, src, frame),
                other => trace!(node = %self.nodes[dst].name, ?other, "endpoint ignored message"),
            },
            NodeKind::Middle(_) => {
                trace!(node = %self.nodes[dst].name, "middle node ignored classical message")
            }
        }
    }

    fn router_on_message(&mut self, tl: &mut Timeline, dst: NodeId, src: String, msg: Message) {
        match msg {
            Message::ReserveRequest { reservation, path } => {
                self.reservation_on_request(tl, dst, src, reservation, path)
            }
            Message::ReserveApprove { reservation, path } => {
                self.reservation_on_approve(tl, dst, reservation, path)
            }
            Message::ReserveReject { reservation, path } => {
                self.reservation_on_reject(tl, dst, reservation, path)
            }
            Message::GenNegotiate {
                herald,
                middle,
                bsm_arrival,
            } => self.generation_on_negotiate(tl, dst, src, herald, middle, bsm_arrival),
            Message::GenNegotiateReject { herald } => {
                self.generation_on_negotiate_reject(tl, dst, herald)
            }
            Message::EntMeasRes {
                herald,
                outcome,
                fidelity,
                participants,
            } => self.generation_on_meas_res(tl, dst, herald, outcome, fidelity, participants),
            Message::SwapRes {
                reservation,
                memory_index,
                success,
                new_partner,
                new_fidelity,
            } => self.swapping_on_res(
                tl,
                dst,
                reservation,
                memory_index,
                success,
                new_partner,
                new_fidelity,
            ),
            Message::PurifyRes {
                reservation,
                kept,
                sacrificed,
                success,
                new_fidelity,
            } => {
                self.purification_on_res(tl, dst, reservation, kept, sacrificed, success, new_fidelity)
            }
            Message::EntanglementExpired { memory_index } => {
                self.on_partner_expired(tl, dst, src, memory_index)
            }
            other => trace!(node = %self.nodes[dst].name, ?other, "router ignored message"),
        }
    }

    fn on_receive_qubit(&mut self, tl: &mut Timeline, dst: NodeId, src: String, mut photon: Photon) {
        photon.location = Some(self.nodes[dst].name.clone());
        enum Sink {
            Bsm,
            Bb84,
            Log,
            Drop,
        }
        let sink = match &self.nodes[dst].kind {
            NodeKind::Middle(_) => Sink::Bsm,
            NodeKind::Endpoint(state) => {
                if state.bb84.as_ref().map(|p| p.role) == Some(Bb84Role::Receiver) {
                    Sink::Bb84
                } else {
                    Sink::Log
                }
            }
            NodeKind::Router(_) => Sink::Drop,
        };
        match sink {
            Sink::Bsm => self.bsm_on_photon(tl, dst, photon),
            Sink::Bb84 => self.bb84_on_photon(tl, dst, photon),
            Sink::Log => {
                let now = tl.now();
                if let Some(state) = self.nodes[dst].try_endpoint_mut() {
                    state.qubit_log.push((now, src, photon.name));
                }
            }
            Sink::Drop => {
                trace!(node = %self.nodes[dst].name, photon = %photon.name, "router dropped stray qubit")
            }
        }
    }

    fn bsm_on_photon(&mut self, tl: &mut Timeline, node: NodeId, photon: Photon) {
        let Some(herald) = photon.herald else {
            trace!(node = %self.nodes[node].name, "BSM ignored unheralded photon");
            return;
        };
        let Some(origin) = photon.origin.clone() else {
            return;
        };
        let now = tl.now();
        let Some(state) = self.nodes[node].try_middle_mut() else {
            return;
        };
        let first = state.bsm.receive(
            herald,
            PhotonArrival {
                time: now,
                origin,
                fidelity: photon.fidelity,
                is_null: photon.is_null,
            },
        );
        if first {
            let close_at = now + state.bsm.resolution_ps;
            tl.schedule(close_at, EventPayload::BsmWindowClose { node, herald });
        }
    }

    fn bsm_window_close(&mut self, tl: &mut Timeline, node: NodeId, herald: HeraldKey) {
        let now = tl.now();
        let result = {
            let Some(state) = self.nodes[node].try_middle_mut() else {
                return;
            };
            state.bsm.resolve(herald, now, tl.rng())
        };
        let Some(result) = result else { return };
        let mut notified: Vec<String> = Vec::new();
        for participant in &result.participants {
            if notified.contains(&participant.node) {
                continue;
            }
            notified.push(participant.node.clone());
            self.send_message(
                tl,
                node,
                &participant.node.clone(),
                Message::EntMeasRes {
                    herald,
                    outcome: result.outcome,
                    fidelity: result.fidelity,
                    participants: result.participants.clone(),
                },
            );
        }
    }

    fn on_dark_count(&mut self, tl: &mut Timeline, node: NodeId, detector: usize) {
        let now = tl.now();
        let is_bb84_receiver = matches!(
            &self.nodes[node].kind,
            NodeKind::Endpoint(state)
                if state.bb84.as_ref().map(|p| p.role) == Some(Bb84Role::Receiver)
        );
        if is_bb84_receiver {
            self.bb84_on_dark(tl, node, detector);
            return;
        }
        match &mut self.nodes[node].kind {
            NodeKind::Middle(state) => {
                if detector < state.bsm.detectors.len() {
                    state.bsm.detectors[detector].dark_click(now);
                }
            }
            NodeKind::Endpoint(state) => {
                if detector < state.detectors.len() {
                    state.detectors[detector].dark_click(now);
                }
            }
            NodeKind::Router(_) => {}
        }
    }

    fn on_memory_expire(&mut self, tl: &mut Timeline, node: NodeId, index: usize) {
        let (broken, reservation) = {
            let Some(state) = self.nodes[node].try_router_mut() else {
                return;
            };
            let memory = state.memories.get_mut(index);
            (memory.expire(), memory.reservation)
        };
        let Some(partner) = broken else { return };
        self.send_message(
            tl,
            node,
            &partner.node,
            Message::EntanglementExpired {
                memory_index: partner.index,
            },
        );
        if let Some(id) = reservation {
            self.generation_schedule_retry(tl, node, id, index);
        }
    }

    fn on_partner_expired(&mut self, tl: &mut Timeline, node: NodeId, src: String, index: usize) {
        let reservation = {
            let Some(state) = self.nodes[node].try_router_mut() else {
                return;
            };
            let memory = state.memories.get_mut(index);
            if memory.state != crate::components::MemoryState::Entangled {
                return;
            }
            // A stale notice can race a reuse of this slot; only a pair
            // still pointing at the expired node is torn down.
            if memory.entangled_with.as_ref().map(|p| p.node.as_str()) != Some(src.as_str()) {
                return;
            }
            memory.reset(tl);
            memory.reservation
        };
        if let Some(id) = reservation {
            self.generation_schedule_retry(tl, node, id, index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{Simulation, SECOND};

    #[test]
    fn test_duplicate_names_rejected() {
        let mut net = Network::new();
        net.add_router("r1", 4).unwrap();
        assert!(matches!(
            net.add_endpoint("r1"),
            Err(SimError::DuplicateNode(_))
        ));
    }

    #[test]
    fn test_channel_wiring_is_bidirectional() {
        let mut net = Network::new();
        net.add_endpoint("a").unwrap();
        net.add_endpoint("b").unwrap();
        net.connect_classical("a", "b", 1e3, None).unwrap();
        net.connect_quantum("a", "b", 1e3, 0.0).unwrap();
        assert_eq!(net.classical_delay(0, "b"), 5_000_000);
        assert_eq!(net.classical_delay(1, "a"), 5_000_000);
        assert_eq!(net.quantum_delay("a", "b"), 5_000_000);
    }

    #[test]
    fn test_unknown_channel_endpoint_is_config_error() {
        let mut net = Network::new();
        net.add_endpoint("a").unwrap();
        assert!(matches!(
            net.connect_classical("a", "ghost", 1e3, None),
            Err(SimError::UnknownNode(_, _))
        ));
    }

    #[test]
    fn test_message_roundtrip_logs_at_endpoint() {
        let mut sim = Simulation::new(SECOND, 1);
        sim.network.add_endpoint("a").unwrap();
        sim.network.add_endpoint("b").unwrap();
        sim.network
            .connect_classical("a", "b", 1e3, None)
            .unwrap();
        sim.init().unwrap();
        sim.network
            .send_message(&mut sim.timeline, 0, "b", Message::Raw("hello".into()));
        sim.run().unwrap();
        let log = &sim.network.node(1).endpoint().message_log;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0], (5_000_000, "a".to_string(), "hello".to_string()));
    }
}
