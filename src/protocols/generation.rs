use std::collections::BTreeMap;

use rand::Rng;
use tracing::{debug, warn};

use crate::components::detector::BsmOutcome;
use crate::components::memory::MemoryState;
use crate::components::photon::{HeraldKey, MemoryRef, Photon};
use crate::network::{Network, NodeId};
use crate::protocols::message::Message;
use crate::protocols::reservation::ReservationId;
use crate::simulation::{EventId, EventPayload, Time, Timeline};

/// Margin added ahead of the classical negotiation delay before an
/// emission slot, picoseconds.
const GEN_SLACK_PS: Time = 1_000;

/// Grace period past the herald's expected arrival before an attempt is
/// written off, picoseconds.
const GEN_TIMEOUT_MARGIN_PS: Time = 10_000;

/// Where one generation attempt stands.
///
/// `Wait` is the terminal holding state: the memory is entangled and the
/// upper layers own it from there, so waiting attempts leave the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenState {
    /// Emission slot agreed or being agreed; photon not yet sent.
    Negotiate,
    /// Photon in flight; herald outcome pending.
    Meas,
    /// Pair established.
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenRole {
    Initiator,
    Responder,
}

/// One in-flight heralded attempt, tied to one local memory.
#[derive(Debug, Clone)]
pub struct GenAttempt {
    pub herald: HeraldKey,
    pub peer: String,
    pub middle: String,
    pub memory_index: usize,
    pub role: GenRole,
    pub state: GenState,
    pub emit_time: Time,
    pub emit_event: Option<EventId>,
    pub timeout: Option<EventId>,
}

/// Per-router entanglement-generation protocol: drives the middle BSM
/// node shared with each adjacent router, one memory per attempt, retrying
/// until the reservation window closes.
#[derive(Debug)]
pub struct EntanglementGeneration {
    node: String,
    next_attempt: u64,
    pub attempts: BTreeMap<HeraldKey, GenAttempt>,
    pub pairs_generated: u64,
}

impl EntanglementGeneration {
    pub fn new(node: &str) -> Self {
        EntanglementGeneration {
            node: node.to_string(),
            next_attempt: 0,
            attempts: BTreeMap::new(),
            pairs_generated: 0,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    fn take_attempt_seq(&mut self) -> u64 {
        let seq = self.next_attempt;
        self.next_attempt += 1;
        seq
    }
}

impl Network {
    /// Begin (or retry) one heralded attempt on `index`. The upstream
    /// router of a link drives: it claims its memory, books an emission
    /// slot on the channel toward the middle node, and proposes the
    /// matching slot to the peer so both photons reach the BSM together.
    pub(crate) fn generation_start_attempt(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        reservation: ReservationId,
        index: usize,
    ) {
        let name = self.nodes[node].name.clone();
        let now = tl.now();

        let (peer, middle, end_time) = {
            let state = self.nodes[node].router();
            let Some(assignment) = state.assignments.get(&index) else {
                return;
            };
            if assignment.reservation != reservation {
                return;
            }
            let Some(record) = state.manager.reservation.accepted_record(reservation) else {
                return;
            };
            (
                assignment.peer.clone(),
                assignment.middle.clone(),
                record.reservation.end_time,
            )
        };
        let Some(middle) = middle else {
            warn!(node = %name, peer = %peer, "link has no BSM node; cannot generate");
            return;
        };
        if now >= end_time {
            return;
        }

        {
            let state = self.nodes[node].router_mut();
            let memory = state.memories.get_mut(index);
            if memory.state != MemoryState::Raw || memory.reservation != Some(reservation) {
                return;
            }
            memory.occupy();
        }

        let herald = {
            let generation = &mut self.nodes[node].router_mut().manager.generation;
            HeraldKey {
                reservation,
                attempt: ((node as u64) << 32) | generation.take_attempt_seq(),
            }
        };

        let d_self = self.quantum_delay(&name, &middle);
        let d_peer = self.quantum_delay(&peer, &middle);
        let ccd_peer = self.classical_delay(node, &peer);
        let ccd_mid = self.classical_delay(node, &middle);

        // The peer must hear the proposal before its own emission time.
        let proposed = now + ccd_peer + d_peer.saturating_sub(d_self) + GEN_SLACK_PS;
        let emit = self.reserve_qchannel_send_time(node, &middle, now, proposed);
        let arrival = emit + d_self;

        let emit_event = tl.schedule(emit, EventPayload::EmitPhoton { node, herald });
        let timeout = tl.schedule(
            arrival + ccd_mid + GEN_TIMEOUT_MARGIN_PS,
            EventPayload::GenerationTimeout { node, herald },
        );
        self.nodes[node].router_mut().manager.generation.attempts.insert(
            herald,
            GenAttempt {
                herald,
                peer: peer.clone(),
                middle: middle.clone(),
                memory_index: index,
                role: GenRole::Initiator,
                state: GenState::Negotiate,
                emit_time: emit,
                emit_event: Some(emit_event),
                timeout: Some(timeout),
            },
        );
        self.send_message(
            tl,
            node,
            &peer,
            Message::GenNegotiate {
                herald,
                middle,
                bsm_arrival: arrival,
            },
        );
    }

    /// The downstream side of a link mirroring an attempt: pick a free
    /// reserved memory and emit so the photon lands at the BSM at the
    /// proposed time.
    pub(crate) fn generation_on_negotiate(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        src: String,
        herald: HeraldKey,
        middle: String,
        bsm_arrival: Time,
    ) {
        let name = self.nodes[node].name.clone();
        let now = tl.now();

        let index = {
            let state = self.nodes[node].router();
            state
                .assignments
                .iter()
                .filter(|(_, a)| a.reservation == herald.reservation && a.peer == src)
                .map(|(i, _)| *i)
                .find(|i| state.memories.get(*i).state == MemoryState::Raw)
        };
        let Some(index) = index else {
            self.send_message(tl, node, &src, Message::GenNegotiateReject { herald });
            return;
        };

        let d_self = self.quantum_delay(&name, &middle);
        if bsm_arrival < now + d_self {
            // The slot already passed; let the initiator retry.
            self.send_message(tl, node, &src, Message::GenNegotiateReject { herald });
            return;
        }
        let emit = self.reserve_qchannel_send_time(node, &middle, now, bsm_arrival - d_self);
        self.nodes[node]
            .router_mut()
            .memories
            .get_mut(index)
            .occupy();

        let ccd_mid = self.classical_delay(node, &middle);
        let emit_event = tl.schedule(emit, EventPayload::EmitPhoton { node, herald });
        let timeout = tl.schedule(
            bsm_arrival + ccd_mid + GEN_TIMEOUT_MARGIN_PS,
            EventPayload::GenerationTimeout { node, herald },
        );
        self.nodes[node].router_mut().manager.generation.attempts.insert(
            herald,
            GenAttempt {
                herald,
                peer: src,
                middle,
                memory_index: index,
                role: GenRole::Responder,
                state: GenState::Negotiate,
                emit_time: emit,
                emit_event: Some(emit_event),
                timeout: Some(timeout),
            },
        );
    }

    /// The peer had no memory for us; back off one emission interval and
    /// try again.
    pub(crate) fn generation_on_negotiate_reject(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        herald: HeraldKey,
    ) {
        let Some(attempt) = self.nodes[node]
            .router_mut()
            .manager
            .generation
            .attempts
            .remove(&herald)
        else {
            return;
        };
        if let Some(id) = attempt.emit_event {
            tl.cancel(id);
        }
        if let Some(id) = attempt.timeout {
            tl.cancel(id);
        }
        let retry_at = {
            let state = self.nodes[node].router_mut();
            let memory = state.memories.get_mut(attempt.memory_index);
            if memory.state == MemoryState::Occupied {
                memory.reset(tl);
            }
            let period = if memory.frequency_hz > 0.0 {
                (1e12 / memory.frequency_hz).round() as Time
            } else {
                GEN_SLACK_PS
            };
            tl.now() + period
        };
        if attempt.role == GenRole::Initiator {
            tl.schedule(
                retry_at,
                EventPayload::GenerationRetry {
                    node,
                    reservation: herald.reservation,
                    index: attempt.memory_index,
                },
            );
        }
    }

    /// Emission slot reached: draw the memory's emission efficiency and
    /// put a photon (or the vacuum stand-in) on the fiber to the middle.
    pub(crate) fn generation_emit(&mut self, tl: &mut Timeline, node: NodeId, herald: HeraldKey) {
        let name = self.nodes[node].name.clone();
        let (index, middle) = {
            let state = self.nodes[node].router_mut();
            let Some(attempt) = state.manager.generation.attempts.get_mut(&herald) else {
                return;
            };
            attempt.state = GenState::Meas;
            (attempt.memory_index, attempt.middle.clone())
        };
        let photon = {
            let state = self.nodes[node].router_mut();
            let memory = state.memories.get_mut(index);
            if memory.state != MemoryState::Occupied {
                return;
            }
            let origin = MemoryRef { node: name, index };
            if tl.rng().random::<f64>() < memory.efficiency {
                Photon::heralded(origin, herald, memory.raw_fidelity)
            } else {
                Photon::null(origin, herald)
            }
        };
        self.send_qubit(tl, node, &middle, photon);
    }

    /// Herald arrived from the middle node: entangle on success, reset
    /// and retry on failure.
    pub(crate) fn generation_on_meas_res(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        herald: HeraldKey,
        outcome: BsmOutcome,
        fidelity: f64,
        participants: Vec<MemoryRef>,
    ) {
        let name = self.nodes[node].name.clone();
        let Some(mut attempt) = self.nodes[node]
            .router_mut()
            .manager
            .generation
            .attempts
            .remove(&herald)
        else {
            return;
        };
        if let Some(id) = attempt.timeout {
            tl.cancel(id);
        }

        let partner = participants.iter().find(|p| p.node != name).cloned();
        let established = {
            let state = self.nodes[node].router_mut();
            let memory = state.memories.get_mut(attempt.memory_index);
            if memory.state != MemoryState::Occupied
                || memory.reservation != Some(herald.reservation)
            {
                return;
            }
            match (outcome.is_success(), partner) {
                (true, Some(partner)) => {
                    memory.entangle(tl, node, partner, fidelity);
                    state.manager.generation.pairs_generated += 1;
                    true
                }
                _ => {
                    memory.reset(tl);
                    false
                }
            }
        };

        if established {
            attempt.state = GenState::Wait;
            debug!(
                node = %name,
                index = attempt.memory_index,
                ?outcome,
                fidelity,
                "entangled link established"
            );
            self.entanglement_established(tl, node, herald.reservation, attempt.memory_index);
        } else if attempt.role == GenRole::Initiator {
            self.generation_schedule_retry(tl, node, herald.reservation, attempt.memory_index);
        }
    }

    /// No herald in time (both photons lost, or the middle never saw the
    /// attempt). Free the memory and go again.
    pub(crate) fn generation_timeout(&mut self, tl: &mut Timeline, node: NodeId, herald: HeraldKey) {
        let Some(attempt) = self.nodes[node]
            .router_mut()
            .manager
            .generation
            .attempts
            .remove(&herald)
        else {
            return;
        };
        {
            let state = self.nodes[node].router_mut();
            let memory = state.memories.get_mut(attempt.memory_index);
            if memory.state == MemoryState::Occupied
                && memory.reservation == Some(herald.reservation)
            {
                memory.reset(tl);
            }
        }
        if attempt.role == GenRole::Initiator {
            self.generation_schedule_retry(tl, node, herald.reservation, attempt.memory_index);
        }
    }

    /// Queue a retry for a freed memory if this node drives its link.
    pub(crate) fn generation_schedule_retry(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        reservation: ReservationId,
        index: usize,
    ) {
        let drives = {
            let state = self.nodes[node].router();
            state
                .assignments
                .get(&index)
                .map(|a| a.reservation == reservation && a.upstream)
                .unwrap_or(false)
        };
        if drives {
            tl.schedule(
                tl.now(),
                EventPayload::GenerationRetry {
                    node,
                    reservation,
                    index,
                },
            );
        }
    }

    /// The reservation window closed: abandon every attempt it owns.
    pub(crate) fn generation_cancel_reservation(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        reservation: ReservationId,
    ) {
        let stale: Vec<GenAttempt> = {
            let generation = &mut self.nodes[node].router_mut().manager.generation;
            let keys: Vec<HeraldKey> = generation
                .attempts
                .keys()
                .filter(|h| h.reservation == reservation)
                .copied()
                .collect();
            keys.iter()
                .filter_map(|k| generation.attempts.remove(k))
                .collect()
        };
        for attempt in stale {
            if let Some(id) = attempt.emit_event {
                tl.cancel(id);
            }
            if let Some(id) = attempt.timeout {
                tl.cancel(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_sequence_is_monotonic() {
        let mut generation = EntanglementGeneration::new("r1");
        let a = generation.take_attempt_seq();
        let b = generation.take_attempt_seq();
        assert!(b > a);
        assert_eq!(generation.node(), "r1");
    }

    #[test]
    fn test_herald_keys_embed_the_initiating_router() {
        // Two routers minting their first attempt for the same
        // reservation must not collide at the BSM.
        let key = |node: u64, seq: u64| HeraldKey {
            reservation: 7,
            attempt: (node << 32) | seq,
        };
        assert_ne!(key(1, 0), key(2, 0));
        assert_eq!(key(1, 3), key(1, 3));
    }
}
