use rand::Rng;
use tracing::debug;

use crate::components::memory::MemoryState;
use crate::network::{Network, NodeId};
use crate::protocols::message::Message;
use crate::protocols::reservation::ReservationId;
use crate::simulation::Timeline;

/// BBPSSW success probability at the fidelity level: both pairs agree on
/// the parity check with probability `f1·f2 + (1−f1)(1−f2)`.
pub fn purify_success_probability(f1: f64, f2: f64) -> f64 {
    f1 * f2 + (1.0 - f1) * (1.0 - f2)
}

/// Fidelity of the kept pair after a successful purification round.
pub fn purified_fidelity(f1: f64, f2: f64) -> f64 {
    f1 * f2 / purify_success_probability(f1, f2)
}

impl Network {
    /// Run one purification round at the reservation initiator: `keep`
    /// survives with raised fidelity when the round succeeds, `sacrifice`
    /// is consumed either way. One draw decides for both sides; the
    /// verdict rides to the responder in a `PurifyRes`.
    pub(crate) fn purify_pair(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        reservation: ReservationId,
        keep: usize,
        sacrifice: usize,
    ) {
        let name = self.nodes[node].name.clone();
        let now = tl.now();

        let (f1, f2, keep_remote, sac_remote) = {
            let state = self.nodes[node].router();
            let keep_mem = state.memories.get(keep);
            let sac_mem = state.memories.get(sacrifice);
            if keep_mem.state != MemoryState::Entangled || sac_mem.state != MemoryState::Entangled
            {
                return;
            }
            (
                keep_mem.current_fidelity(now),
                sac_mem.current_fidelity(now),
                keep_mem.entangled_with.clone().expect("kept half has a partner"),
                sac_mem
                    .entangled_with
                    .clone()
                    .expect("sacrificed half has a partner"),
            )
        };
        if keep_remote.node != sac_remote.node {
            return;
        }

        let p = purify_success_probability(f1, f2);
        let success = tl.rng().random::<f64>() < p;
        let new_fidelity = if success { purified_fidelity(f1, f2) } else { 0.0 };

        debug!(
            node = %name,
            keep,
            sacrifice,
            success,
            new_fidelity,
            "purification round"
        );

        {
            let state = self.nodes[node].router_mut();
            if success {
                state.memories.get_mut(keep).refresh(new_fidelity, now);
            } else {
                state.memories.get_mut(keep).reset(tl);
            }
            state.memories.get_mut(sacrifice).reset(tl);
        }

        self.send_message(
            tl,
            node,
            &keep_remote.node,
            Message::PurifyRes {
                reservation,
                kept: keep_remote.index,
                sacrificed: sac_remote.index,
                success,
                new_fidelity,
            },
        );

        self.generation_schedule_retry(tl, node, reservation, sacrifice);
        if success {
            // The kept pair may now clear the target.
            self.endpoint_handle_pair(tl, node, reservation, keep);
        } else {
            self.generation_schedule_retry(tl, node, reservation, keep);
        }
    }

    /// Responder side of a purification round: mirror the initiator's
    /// verdict on the matching memories.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn purification_on_res(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        reservation: ReservationId,
        kept: usize,
        sacrificed: usize,
        success: bool,
        new_fidelity: f64,
    ) {
        let now = tl.now();
        {
            let state = self.nodes[node].router_mut();
            let sac = state.memories.get_mut(sacrificed);
            if sac.state == MemoryState::Entangled && sac.reservation == Some(reservation) {
                sac.reset(tl);
            }
            let keep = state.memories.get_mut(kept);
            if keep.state != MemoryState::Entangled || keep.reservation != Some(reservation) {
                return;
            }
            if success {
                keep.refresh(new_fidelity, now);
            } else {
                keep.reset(tl);
            }
        }
        self.generation_schedule_retry(tl, node, reservation, sacrificed);
        if success {
            self.endpoint_handle_pair(tl, node, reservation, kept);
        } else {
            self.generation_schedule_retry(tl, node, reservation, kept);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_probability_bounds() {
        for (f1, f2) in [(0.7, 0.7), (0.9, 0.8), (0.5, 0.5), (1.0, 1.0)] {
            let p = purify_success_probability(f1, f2);
            assert!((0.0..=1.0).contains(&p), "p = {}", p);
        }
        assert!((purify_success_probability(1.0, 1.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_purification_raises_fidelity_above_half() {
        for (f1, f2) in [(0.7, 0.7), (0.8, 0.75), (0.9, 0.85)] {
            let improved = purified_fidelity(f1, f2);
            assert!(
                improved > f1.max(f2),
                "purify({}, {}) = {} did not improve",
                f1,
                f2,
                improved
            );
        }
    }

    #[test]
    fn test_perfect_pairs_stay_perfect() {
        assert!((purified_fidelity(1.0, 1.0) - 1.0).abs() < 1e-12);
    }
}
