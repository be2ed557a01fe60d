use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::network::node::LinkAssignment;
use crate::network::{Network, NodeId};
use crate::protocols::message::Message;
use crate::simulation::{EventPayload, Time, Timeline};

/// Network-wide unique reservation identifier: initiating router id in the
/// upper half, per-router sequence in the lower.
pub type ReservationId = u64;

/// A time-bounded claim on `memory_size` memories along a path, for one
/// end-to-end entanglement session.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: ReservationId,
    pub initiator: String,
    pub responder: String,
    pub start_time: Time,
    pub end_time: Time,
    pub memory_size: usize,
    pub target_fidelity: f64,
}

/// One interval claim against one memory index.
#[derive(Debug, Clone)]
struct Claim {
    start: Time,
    end: Time,
    reservation: ReservationId,
    committed: bool,
}

/// A committed reservation at this node, with the full path it rides.
#[derive(Debug, Clone)]
pub struct AcceptedReservation {
    pub reservation: Reservation,
    pub path: Vec<String>,
    /// Memory indices this node claimed for the window.
    pub indices: Vec<usize>,
}

/// Per-router resource reservation state: one interval list per memory
/// index, tentative claims awaiting the responder's verdict, and the
/// committed set.
///
/// Invariant: for any memory index, claims never overlap in time. A
/// tentative claim blocks competing admissions exactly like a committed
/// one, so of two overlapping requests racing along a path the first to
/// reach each hop wins.
#[derive(Debug)]
pub struct ResourceReservation {
    node: String,
    next_seq: u64,
    timecards: Vec<Vec<Claim>>,
    tentative: BTreeMap<ReservationId, Vec<usize>>,
    pub accepted: Vec<AcceptedReservation>,
}

impl ResourceReservation {
    pub fn new(node: &str, memory_count: usize) -> Self {
        ResourceReservation {
            node: node.to_string(),
            next_seq: 0,
            timecards: vec![Vec::new(); memory_count],
            tentative: BTreeMap::new(),
            accepted: Vec::new(),
        }
    }

    pub fn next_reservation_id(&mut self, node_id: NodeId) -> ReservationId {
        let seq = self.next_seq;
        self.next_seq += 1;
        ((node_id as u64) << 32) | seq
    }

    fn index_is_free(&self, index: usize, start: Time, end: Time) -> bool {
        self.timecards[index]
            .iter()
            .all(|claim| end <= claim.start || claim.end <= start)
    }

    /// Try to claim `memory_size` indices free across the whole window.
    /// On success the claim is tentative until `commit` or `release`.
    pub fn admit(&mut self, resv: &Reservation) -> Option<Vec<usize>> {
        let mut indices = Vec::with_capacity(resv.memory_size);
        for index in 0..self.timecards.len() {
            if self.index_is_free(index, resv.start_time, resv.end_time) {
                indices.push(index);
                if indices.len() == resv.memory_size {
                    break;
                }
            }
        }
        if indices.len() < resv.memory_size {
            return None;
        }
        for &index in &indices {
            self.timecards[index].push(Claim {
                start: resv.start_time,
                end: resv.end_time,
                reservation: resv.id,
                committed: false,
            });
        }
        self.tentative.insert(resv.id, indices.clone());
        Some(indices)
    }

    /// Promote a tentative claim. Committing twice, or committing a claim
    /// that was never admitted, is a programmer error.
    pub fn commit(&mut self, resv: &Reservation, path: Vec<String>) -> Vec<usize> {
        let indices = self
            .tentative
            .remove(&resv.id)
            .unwrap_or_else(|| panic!("{}: commit of unknown reservation {}", self.node, resv.id));
        for &index in &indices {
            for claim in &mut self.timecards[index] {
                if claim.reservation == resv.id {
                    assert!(!claim.committed, "{}: double commit", self.node);
                    claim.committed = true;
                }
            }
        }
        self.accepted.push(AcceptedReservation {
            reservation: resv.clone(),
            path,
            indices: indices.clone(),
        });
        indices
    }

    /// Drop a tentative claim after a rejection somewhere on the path.
    pub fn release(&mut self, id: ReservationId) {
        if self.tentative.remove(&id).is_none() {
            return;
        }
        for card in &mut self.timecards {
            card.retain(|claim| claim.reservation != id);
        }
    }

    /// Drop the interval claims of a finished window. The accepted record
    /// stays for reporting.
    pub fn release_window(&mut self, id: ReservationId) {
        for card in &mut self.timecards {
            card.retain(|claim| claim.reservation != id);
        }
    }

    pub fn accepted_record(&self, id: ReservationId) -> Option<&AcceptedReservation> {
        self.accepted.iter().find(|r| r.reservation.id == id)
    }
}

impl Network {
    /// Application entry point: request `memory_size` memories toward
    /// `responder` over `[start_time, end_time]`. The verdict arrives at
    /// the application callback once the path answers; a locally
    /// unsatisfiable request is rejected immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn reserve(
        &mut self,
        tl: &mut Timeline,
        initiator: NodeId,
        responder: &str,
        start_time: Time,
        end_time: Time,
        memory_size: usize,
        target_fidelity: f64,
    ) -> ReservationId {
        assert!(start_time < end_time, "reservation window is empty");
        let name = self.nodes[initiator].name.clone();
        assert!(name != responder, "cannot reserve toward self");

        let resv = {
            let state = self.nodes[initiator].router_mut();
            let id = state.manager.reservation.next_reservation_id(initiator);
            Reservation {
                id,
                initiator: name.clone(),
                responder: responder.to_string(),
                start_time,
                end_time,
                memory_size,
                target_fidelity,
            }
        };

        let admitted = {
            let state = self.nodes[initiator].router_mut();
            state.manager.reservation.admit(&resv).is_some()
        };
        if !admitted {
            debug!(node = %name, id = resv.id, "reservation rejected locally");
            self.app_on_result(tl, initiator, &resv, false);
            return resv.id;
        }

        let next_hop = {
            let state = self.nodes[initiator].router();
            state.manager.next_hop(responder).cloned()
        };
        let Some(next_hop) = next_hop else {
            warn!(node = %name, responder, "no forwarding rule; rejecting reservation");
            self.nodes[initiator]
                .router_mut()
                .manager
                .reservation
                .release(resv.id);
            self.app_on_result(tl, initiator, &resv, false);
            return resv.id;
        };

        let id = resv.id;
        self.send_message(
            tl,
            initiator,
            &next_hop,
            Message::ReserveRequest {
                reservation: resv,
                path: vec![name],
            },
        );
        id
    }

    pub(crate) fn reservation_on_request(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        src: String,
        resv: Reservation,
        mut path: Vec<String>,
    ) {
        let name = self.nodes[node].name.clone();
        let admitted = {
            let state = self.nodes[node].router_mut();
            state.manager.reservation.admit(&resv).is_some()
        };
        if !admitted {
            debug!(node = %name, id = resv.id, "admission failed, rejecting back to {}", src);
            self.send_message(
                tl,
                node,
                &src,
                Message::ReserveReject {
                    reservation: resv,
                    path,
                },
            );
            return;
        }

        path.push(name.clone());
        if name == resv.responder {
            // Terminal hop: commit and push the approval back.
            let prev = path[path.len() - 2].clone();
            self.reservation_commit_here(tl, node, &resv, path.clone());
            self.send_message(
                tl,
                node,
                &prev,
                Message::ReserveApprove {
                    reservation: resv,
                    path,
                },
            );
            return;
        }

        let next_hop = {
            let state = self.nodes[node].router();
            state.manager.next_hop(&resv.responder).cloned()
        };
        match next_hop {
            Some(next) => {
                self.send_message(
                    tl,
                    node,
                    &next,
                    Message::ReserveRequest {
                        reservation: resv,
                        path,
                    },
                );
            }
            None => {
                warn!(node = %name, responder = %resv.responder, "unroutable responder");
                self.nodes[node]
                    .router_mut()
                    .manager
                    .reservation
                    .release(resv.id);
                path.pop();
                self.send_message(
                    tl,
                    node,
                    &src,
                    Message::ReserveReject {
                        reservation: resv,
                        path,
                    },
                );
            }
        }
    }

    pub(crate) fn reservation_on_approve(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        resv: Reservation,
        path: Vec<String>,
    ) {
        let name = self.nodes[node].name.clone();
        self.reservation_commit_here(tl, node, &resv, path.clone());

        if name == resv.initiator {
            info!(
                initiator = %name,
                responder = %resv.responder,
                id = resv.id,
                hops = path.len(),
                "reservation approved"
            );
            self.app_on_result(tl, node, &resv, true);
            return;
        }
        let pos = path
            .iter()
            .position(|n| *n == name)
            .unwrap_or_else(|| panic!("{}: approval for a path not containing this node", name));
        let prev = path[pos - 1].clone();
        self.send_message(
            tl,
            node,
            &prev,
            Message::ReserveApprove {
                reservation: resv,
                path,
            },
        );
    }

    pub(crate) fn reservation_on_reject(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        resv: Reservation,
        path: Vec<String>,
    ) {
        let name = self.nodes[node].name.clone();
        self.nodes[node]
            .router_mut()
            .manager
            .reservation
            .release(resv.id);

        if name == resv.initiator {
            debug!(node = %name, id = resv.id, "reservation rejected");
            self.app_on_result(tl, node, &resv, false);
            return;
        }
        let pos = path
            .iter()
            .position(|n| *n == name)
            .unwrap_or_else(|| panic!("{}: rejection for a path not containing this node", name));
        let prev = path[pos - 1].clone();
        self.send_message(
            tl,
            node,
            &prev,
            Message::ReserveReject {
                reservation: resv,
                path,
            },
        );
    }

    fn reservation_commit_here(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        resv: &Reservation,
        path: Vec<String>,
    ) {
        {
            let state = self.nodes[node].router_mut();
            state.manager.reservation.commit(resv, path);
        }
        let now = tl.now();
        if resv.end_time <= now {
            // Approval arrived after the window already closed.
            self.nodes[node]
                .router_mut()
                .manager
                .reservation
                .release_window(resv.id);
            return;
        }
        tl.schedule(
            resv.start_time.max(now),
            EventPayload::ReservationStart {
                node,
                reservation: resv.id,
            },
        );
        tl.schedule(
            resv.end_time,
            EventPayload::ReservationEnd {
                node,
                reservation: resv.id,
            },
        );
    }

    /// The window opens: hand the claimed memories to the generation and
    /// swapping layers. Endpoints aim every claimed memory at their one
    /// path neighbor; interior hops alternate indices between the
    /// upstream and downstream links.
    pub(crate) fn reservation_window_open(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        id: ReservationId,
    ) {
        let name = self.nodes[node].name.clone();
        let record = {
            let state = self.nodes[node].router();
            state.manager.reservation.accepted_record(id).cloned()
        };
        let Some(record) = record else { return };
        let path = &record.path;
        let pos = match path.iter().position(|n| *n == name) {
            Some(pos) => pos,
            None => return,
        };
        let prev = (pos > 0).then(|| path[pos - 1].clone());
        let next = (pos + 1 < path.len()).then(|| path[pos + 1].clone());

        let mut assignments: Vec<(usize, LinkAssignment)> = Vec::new();
        for (slot, &index) in record.indices.iter().enumerate() {
            // Interior hops: even slots serve the upstream link, odd the
            // downstream. Endpoints have a single neighbor.
            let (peer, upstream) = match (&prev, &next) {
                (Some(prev), Some(next)) => {
                    if slot % 2 == 0 {
                        (prev.clone(), false)
                    } else {
                        (next.clone(), true)
                    }
                }
                (None, Some(next)) => (next.clone(), true),
                (Some(prev), None) => (prev.clone(), false),
                (None, None) => return,
            };
            let middle = self.middle_between(&name, &peer).cloned();
            assignments.push((
                index,
                LinkAssignment {
                    reservation: id,
                    peer,
                    middle,
                    upstream,
                },
            ));
        }

        let initiator_indices: Vec<usize> = {
            let state = self.nodes[node].router_mut();
            for (index, assignment) in &assignments {
                let memory = state.memories.get_mut(*index);
                if memory.state != crate::components::MemoryState::Raw {
                    memory.reset(tl);
                }
                memory.reservation = Some(id);
                state.assignments.insert(*index, assignment.clone());
            }
            assignments
                .iter()
                .filter(|(_, a)| a.upstream)
                .map(|(index, _)| *index)
                .collect()
        };

        debug!(node = %name, id, memories = record.indices.len(), "reservation window open");
        for index in initiator_indices {
            self.generation_start_attempt(tl, node, id, index);
        }
    }

    /// The window closes: cancel in-flight attempts, reclaim memories,
    /// release the interval claims, and let the application move on.
    pub(crate) fn reservation_window_close(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        id: ReservationId,
    ) {
        self.generation_cancel_reservation(tl, node, id);

        let name = self.nodes[node].name.clone();
        let (is_initiator, delivered, duration) = {
            let state = self.nodes[node].router_mut();
            for memory in state.memories.iter_mut() {
                if memory.reservation == Some(id) {
                    memory.reset(tl);
                    memory.reservation = None;
                }
            }
            state.assignments.retain(|_, a| a.reservation != id);
            state.manager.reservation.release_window(id);
            let delivered = state.delivered.remove(&id).unwrap_or(0);
            let record = state.manager.reservation.accepted_record(id);
            let is_initiator = record
                .map(|r| r.reservation.initiator == name)
                .unwrap_or(false);
            let duration = record
                .map(|r| r.reservation.end_time - r.reservation.start_time)
                .unwrap_or(0);
            (is_initiator, delivered, duration)
        };
        if is_initiator {
            self.app_on_window_closed(tl, node, id, delivered, duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resv(id: ReservationId, start: Time, end: Time, size: usize) -> Reservation {
        Reservation {
            id,
            initiator: "r1".into(),
            responder: "r3".into(),
            start_time: start,
            end_time: end,
            memory_size: size,
            target_fidelity: 0.9,
        }
    }

    #[test]
    fn test_admit_claims_lowest_free_indices() {
        let mut rr = ResourceReservation::new("r1", 4);
        let indices = rr.admit(&resv(1, 100, 200, 2)).unwrap();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn test_overlapping_requests_first_wins() {
        let mut rr = ResourceReservation::new("r1", 4);
        assert!(rr.admit(&resv(1, 100, 200, 4)).is_some());
        // Second request overlaps and finds nothing free.
        assert!(rr.admit(&resv(2, 150, 250, 4)).is_none());
        // Submission order decides the survivor: release the first and
        // the second fits.
        rr.release(1);
        assert!(rr.admit(&resv(2, 150, 250, 4)).is_some());
    }

    #[test]
    fn test_disjoint_windows_share_memories() {
        let mut rr = ResourceReservation::new("r1", 2);
        assert!(rr.admit(&resv(1, 100, 200, 2)).is_some());
        assert!(rr.admit(&resv(2, 200, 300, 2)).is_some());
        assert!(rr.admit(&resv(3, 150, 260, 1)).is_none());
    }

    #[test]
    fn test_commit_then_release_window_frees_intervals() {
        let mut rr = ResourceReservation::new("r1", 2);
        let r = resv(1, 100, 200, 2);
        rr.admit(&r).unwrap();
        rr.commit(&r, vec!["r1".into(), "r3".into()]);
        assert!(rr.accepted_record(1).is_some());
        assert!(rr.admit(&resv(2, 150, 250, 1)).is_none());
        rr.release_window(1);
        assert!(rr.admit(&resv(2, 150, 250, 1)).is_some());
        // The accepted record survives for reporting.
        assert!(rr.accepted_record(1).is_some());
    }

    #[test]
    #[should_panic(expected = "commit of unknown reservation")]
    fn test_commit_without_admit_panics() {
        let mut rr = ResourceReservation::new("r1", 2);
        rr.commit(&resv(9, 0, 10, 1), vec![]);
    }

    #[test]
    fn test_release_unknown_is_harmless() {
        let mut rr = ResourceReservation::new("r1", 2);
        rr.release(77);
        assert!(rr.admit(&resv(1, 0, 10, 2)).is_some());
    }
}
