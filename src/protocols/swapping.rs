use rand::Rng;
use tracing::debug;

use crate::components::memory::MemoryState;
use crate::components::photon::MemoryRef;
use crate::network::{Network, NodeId};
use crate::protocols::message::Message;
use crate::protocols::reservation::ReservationId;
use crate::simulation::{Time, Timeline};

/// Per-router entanglement-swapping protocol: joins two adjacent
/// entangled links at this node into one longer link.
#[derive(Debug)]
pub struct EntanglementSwapping {
    node: String,
    pub success_rate: f64,
    pub degradation: f64,
    pub swaps_attempted: u64,
    pub swaps_succeeded: u64,
}

impl EntanglementSwapping {
    pub fn new(node: &str) -> Self {
        EntanglementSwapping {
            node: node.to_string(),
            success_rate: 0.5,
            degradation: 0.95,
            swaps_attempted: 0,
            swaps_succeeded: 0,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn set_swapping_success_rate(&mut self, p: f64) {
        assert!((0.0..=1.0).contains(&p), "success rate out of range");
        self.success_rate = p;
    }

    pub fn set_swapping_degradation(&mut self, d: f64) {
        assert!((0.0..=1.0).contains(&d), "degradation out of range");
        self.degradation = d;
    }
}

impl Network {
    /// A memory at this router just became entangled (fresh link or a
    /// swap moved it). Route it: interior routers try to swap, endpoints
    /// check whether the pair now spans the whole path.
    pub(crate) fn entanglement_established(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        reservation: ReservationId,
        index: usize,
    ) {
        let name = self.nodes[node].name.clone();
        let path = {
            let state = self.nodes[node].router();
            match state.manager.reservation.accepted_record(reservation) {
                Some(record) => record.path.clone(),
                None => return,
            }
        };
        let Some(pos) = path.iter().position(|n| *n == name) else {
            return;
        };
        if pos > 0 && pos + 1 < path.len() {
            self.swapping_try(tl, node, reservation, &path, pos);
        } else {
            self.endpoint_handle_pair(tl, node, reservation, index);
        }
    }

    /// Match entangled halves pointing to each side of the path and swap
    /// them, longest-held first (ties to the lower memory index), until
    /// one side runs dry.
    pub(crate) fn swapping_try(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        reservation: ReservationId,
        path: &[String],
        pos: usize,
    ) {
        loop {
            let now = tl.now();
            let (left, right) = {
                let state = self.nodes[node].router();
                let mut left: Option<(u64, usize)> = None;
                let mut right: Option<(u64, usize)> = None;
                for memory in state.memories.iter() {
                    if memory.state != MemoryState::Entangled
                        || memory.reservation != Some(reservation)
                    {
                        continue;
                    }
                    let Some(partner) = &memory.entangled_with else {
                        continue;
                    };
                    let Some(partner_pos) = path.iter().position(|n| *n == partner.node) else {
                        continue;
                    };
                    let key = (memory.entangle_time, memory.index);
                    let side = if partner_pos < pos { &mut left } else { &mut right };
                    if side.map(|s| key < s).unwrap_or(true) {
                        *side = Some(key);
                    }
                }
                (left, right)
            };
            let (Some((_, left_index)), Some((_, right_index))) = (left, right) else {
                return;
            };
            self.swap_once(tl, node, reservation, left_index, right_index, now);
        }
    }

    fn swap_once(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        reservation: ReservationId,
        left_index: usize,
        right_index: usize,
        now: Time,
    ) {
        let name = self.nodes[node].name.clone();
        let (success_rate, degradation) = {
            let swapping = &self.nodes[node].router().manager.swapping;
            (swapping.success_rate, swapping.degradation)
        };
        let success = tl.rng().random::<f64>() < success_rate;

        let (left_partner, right_partner, new_fidelity) = {
            let state = self.nodes[node].router_mut();
            let left = state.memories.get(left_index);
            let right = state.memories.get(right_index);
            let fidelity = degradation * left.current_fidelity(now) * right.current_fidelity(now);
            let left_partner = left.entangled_with.clone().expect("left half has a partner");
            let right_partner = right
                .entangled_with
                .clone()
                .expect("right half has a partner");
            let swapping = &mut state.manager.swapping;
            swapping.swaps_attempted += 1;
            if success {
                swapping.swaps_succeeded += 1;
            }
            (left_partner, right_partner, fidelity)
        };

        debug!(
            node = %name,
            left = %left_partner.node,
            right = %right_partner.node,
            success,
            fidelity = new_fidelity,
            "entanglement swap"
        );

        let (to_left, to_right) = if success {
            (
                Message::SwapRes {
                    reservation,
                    memory_index: left_partner.index,
                    success: true,
                    new_partner: Some(right_partner.clone()),
                    new_fidelity,
                },
                Message::SwapRes {
                    reservation,
                    memory_index: right_partner.index,
                    success: true,
                    new_partner: Some(left_partner.clone()),
                    new_fidelity,
                },
            )
        } else {
            (
                Message::SwapRes {
                    reservation,
                    memory_index: left_partner.index,
                    success: false,
                    new_partner: None,
                    new_fidelity: 0.0,
                },
                Message::SwapRes {
                    reservation,
                    memory_index: right_partner.index,
                    success: false,
                    new_partner: None,
                    new_fidelity: 0.0,
                },
            )
        };
        self.send_message(tl, node, &left_partner.node, to_left);
        self.send_message(tl, node, &right_partner.node, to_right);

        // Both local halves are consumed either way.
        {
            let state = self.nodes[node].router_mut();
            state.memories.get_mut(left_index).reset(tl);
            state.memories.get_mut(right_index).reset(tl);
        }
        self.generation_schedule_retry(tl, node, reservation, left_index);
        self.generation_schedule_retry(tl, node, reservation, right_index);
    }

    /// A swap node moved (or dropped) the far half of a pair this router
    /// holds.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn swapping_on_res(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        reservation: ReservationId,
        memory_index: usize,
        success: bool,
        new_partner: Option<MemoryRef>,
        new_fidelity: f64,
    ) {
        let updated = {
            let state = self.nodes[node].router_mut();
            let memory = state.memories.get_mut(memory_index);
            if memory.state != MemoryState::Entangled || memory.reservation != Some(reservation) {
                return;
            }
            match (success, new_partner) {
                (true, Some(partner)) => {
                    memory.update_partner(partner, new_fidelity);
                    true
                }
                _ => {
                    memory.reset(tl);
                    false
                }
            }
        };
        if updated {
            self.entanglement_established(tl, node, reservation, memory_index);
        } else {
            self.generation_schedule_retry(tl, node, reservation, memory_index);
        }
    }

    /// An endpoint examining a freshly arrived (or repointed) pair: when
    /// it spans the whole path, deliver it or queue it for purification.
    pub(crate) fn endpoint_handle_pair(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        reservation: ReservationId,
        index: usize,
    ) {
        let name = self.nodes[node].name.clone();
        let now = tl.now();
        let (other_end, target, is_initiator) = {
            let state = self.nodes[node].router();
            let Some(record) = state.manager.reservation.accepted_record(reservation) else {
                return;
            };
            let resv = &record.reservation;
            let other = if resv.initiator == name {
                resv.responder.clone()
            } else {
                resv.initiator.clone()
            };
            (other, resv.target_fidelity, resv.initiator == name)
        };

        let (spans, fidelity) = {
            let state = self.nodes[node].router();
            let memory = state.memories.get(index);
            if memory.state != MemoryState::Entangled || memory.reservation != Some(reservation) {
                return;
            }
            let spans = memory
                .entangled_with
                .as_ref()
                .map(|p| p.node == other_end)
                .unwrap_or(false);
            (spans, memory.current_fidelity(now))
        };
        if !spans {
            return;
        }

        if fidelity + 1e-9 >= target {
            // Deliverable: consume the pair and free the slot.
            {
                let state = self.nodes[node].router_mut();
                state.memories.get_mut(index).reset(tl);
                if is_initiator {
                    *state.delivered.entry(reservation).or_insert(0) += 1;
                }
            }
            debug!(node = %name, reservation, fidelity, "end-to-end pair delivered");
            self.generation_schedule_retry(tl, node, reservation, index);
            return;
        }

        // Below target: the initiator looks for a second spanning pair to
        // purify against; the responder holds and follows verdicts.
        if !is_initiator {
            return;
        }
        let partner_index = {
            let state = self.nodes[node].router();
            state
                .memories
                .iter()
                .filter(|m| {
                    m.index != index
                        && m.state == MemoryState::Entangled
                        && m.reservation == Some(reservation)
                        && m.entangled_with
                            .as_ref()
                            .map(|p| p.node == other_end)
                            .unwrap_or(false)
                })
                .map(|m| m.index)
                .next()
        };
        if let Some(other_index) = partner_index {
            // Keep the better half.
            let (keep, sacrifice) = {
                let state = self.nodes[node].router();
                let a = state.memories.get(index).current_fidelity(now);
                let b = state.memories.get(other_index).current_fidelity(now);
                if a >= b {
                    (index, other_index)
                } else {
                    (other_index, index)
                }
            };
            self.purify_pair(tl, node, reservation, keep, sacrifice);
        }
    }
}
