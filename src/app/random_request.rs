use rand::Rng;
use tracing::debug;

use crate::network::{Network, NodeId};
use crate::protocols::reservation::{Reservation, ReservationId};
use crate::simulation::{EventPayload, Time, Timeline, SECOND};

/// Bounds for the randomized request stream, virtual-time picoseconds.
const MIN_START_DELAY_PS: Time = SECOND / 100;
const MAX_START_DELAY_PS: Time = SECOND / 10;
const MIN_DURATION_PS: Time = SECOND / 10;
const MAX_DURATION_PS: Time = SECOND / 5;
const RETRY_DELAY_PS: Time = SECOND / 100;
const MIN_MEMORY_SIZE: usize = 10;
const MAX_MEMORY_SIZE: usize = 25;

/// One accepted request, in the shape the metrics logger consumes.
#[derive(Debug, Clone)]
pub struct ReserveRecord {
    pub responder: String,
    pub start_time: Time,
    pub end_time: Time,
    pub memory_size: usize,
    pub target_fidelity: f64,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    id: ReservationId,
    submitted: Time,
}

/// The random-request traffic generator attached to a router.
///
/// It keeps exactly one request in flight: on rejection it retries with
/// fresh parameters after a short pause, on acceptance it waits for the
/// window to finish and then asks for the next one.
#[derive(Debug)]
pub struct RandomRequestApp {
    /// Routers this app may pick as responders.
    pub others: Vec<String>,
    pub reserves: Vec<ReserveRecord>,
    wait_times: Vec<Time>,
    throughputs: Vec<f64>,
    /// Submission time of a request whose id is not known yet; bridges
    /// the synchronous local-reject path inside `reserve`.
    awaiting: Option<Time>,
    pending: Option<PendingRequest>,
    pub requests_sent: u64,
    pub requests_accepted: u64,
}

impl RandomRequestApp {
    pub fn new(others: Vec<String>) -> Self {
        RandomRequestApp {
            others,
            reserves: Vec::new(),
            wait_times: Vec::new(),
            throughputs: Vec::new(),
            awaiting: None,
            pending: None,
            requests_sent: 0,
            requests_accepted: 0,
        }
    }

    /// Time each accepted reservation waited between submission and its
    /// window opening.
    pub fn get_wait_time(&self) -> &[Time] {
        &self.wait_times
    }

    /// End-to-end pairs per second for each finished reservation window.
    pub fn get_throughput(&self) -> &[f64] {
        &self.throughputs
    }
}

impl Network {
    /// Draw fresh request parameters and submit them.
    pub(crate) fn app_next_request(&mut self, tl: &mut Timeline, node: NodeId) {
        let now = tl.now();
        let params = {
            let Some(state) = self.nodes[node].try_router_mut() else {
                return;
            };
            let memory_cap = state.memories.len();
            let Some(app) = state.app.as_mut() else {
                return;
            };
            if app.others.is_empty() || app.pending.is_some() {
                return;
            }
            let responder = app.others[tl.rng().random_range(0..app.others.len())].clone();
            let start = now + tl.rng().random_range(MIN_START_DELAY_PS..MAX_START_DELAY_PS);
            let end = start + tl.rng().random_range(MIN_DURATION_PS..MAX_DURATION_PS);
            let size = tl
                .rng()
                .random_range(MIN_MEMORY_SIZE..=MAX_MEMORY_SIZE)
                .min(memory_cap);
            let fidelity = tl.rng().random_range(0.8..1.0);
            app.requests_sent += 1;
            app.awaiting = Some(now);
            (responder, start, end, size, fidelity)
        };
        let (responder, start, end, size, fidelity) = params;
        let id = self.reserve(tl, node, &responder, start, end, size, fidelity);

        // If the request was rejected synchronously the verdict handler
        // already consumed `awaiting`; otherwise remember the id.
        if let Some(state) = self.nodes[node].try_router_mut() {
            if let Some(app) = state.app.as_mut() {
                if let Some(submitted) = app.awaiting.take() {
                    app.pending = Some(PendingRequest { id, submitted });
                }
            }
        }
    }

    /// Reservation verdict reached the initiating application.
    pub(crate) fn app_on_result(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        resv: &Reservation,
        accepted: bool,
    ) {
        let now = tl.now();
        let Some(state) = self.nodes[node].try_router_mut() else {
            return;
        };
        let Some(app) = state.app.as_mut() else {
            return;
        };
        let submitted = if let Some(submitted) = app.awaiting.take() {
            submitted
        } else {
            match app.pending.as_ref() {
                Some(pending) if pending.id == resv.id => {
                    let submitted = pending.submitted;
                    if !accepted {
                        app.pending = None;
                    }
                    submitted
                }
                _ => return,
            }
        };
        if accepted {
            app.requests_accepted += 1;
            app.reserves.push(ReserveRecord {
                responder: resv.responder.clone(),
                start_time: resv.start_time,
                end_time: resv.end_time,
                memory_size: resv.memory_size,
                target_fidelity: resv.target_fidelity,
            });
            app.wait_times
                .push(resv.start_time.saturating_sub(submitted));
            debug!(id = resv.id, "request accepted");
        } else {
            tl.schedule(now + RETRY_DELAY_PS, EventPayload::AppNextRequest { node });
        }
    }

    /// An accepted window finished; record its throughput and move on.
    pub(crate) fn app_on_window_closed(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        id: ReservationId,
        delivered: u64,
        duration: Time,
    ) {
        let now = tl.now();
        let Some(state) = self.nodes[node].try_router_mut() else {
            return;
        };
        let Some(app) = state.app.as_mut() else {
            return;
        };
        if app.pending.as_ref().map(|p| p.id) == Some(id) {
            app.pending = None;
        }
        let seconds = duration as f64 / SECOND as f64;
        app.throughputs.push(if seconds > 0.0 {
            delivered as f64 / seconds
        } else {
            0.0
        });
        tl.schedule(now + RETRY_DELAY_PS, EventPayload::AppNextRequest { node });
    }
}
