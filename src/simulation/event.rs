use std::cmp::Ordering;

use crate::components::photon::{HeraldKey, Photon};
use crate::network::NodeId;
use crate::protocols::message::Message;
use crate::protocols::reservation::ReservationId;

/// Virtual time in integer picoseconds. The clock never consults wall time.
pub type Time = u64;

/// One second of virtual time.
pub const SECOND: Time = 1_000_000_000_000;

/// Priority used when the caller does not supply one. Lower numeric
/// priorities run first among same-time events, so the default sorts last
/// and same-time ordering falls back to insertion sequence.
pub const DEFAULT_PRIORITY: u32 = u32::MAX;

/// Handle to a scheduled event, usable for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub u64);

/// The operation an event dispatches when it executes: the target entity
/// plus the method selector and arguments, as one tagged variant.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// A classical message arriving at a node.
    ReceiveMessage {
        dst: NodeId,
        src: String,
        msg: Message,
    },
    /// A photon arriving at a node.
    ReceiveQubit {
        dst: NodeId,
        src: String,
        photon: Photon,
    },
    /// A router emitting the photon for a heralded generation attempt.
    EmitPhoton { node: NodeId, herald: HeraldKey },
    /// A light source firing one pulse of a BB84 train.
    SourcePulse { node: NodeId, remaining: u32 },
    /// A BSM station closing the detection window for one attempt.
    BsmWindowClose { node: NodeId, herald: HeraldKey },
    /// A pre-scheduled detector dark count.
    DarkCount { node: NodeId, detector: usize },
    /// A quantum memory reaching its coherence deadline.
    MemoryExpire { node: NodeId, index: usize },
    /// A generation attempt giving up on its herald result.
    GenerationTimeout { node: NodeId, herald: HeraldKey },
    /// A freed memory re-entering the generation loop.
    GenerationRetry {
        node: NodeId,
        reservation: ReservationId,
        index: usize,
    },
    /// A committed reservation window opening at this node.
    ReservationStart { node: NodeId, reservation: ReservationId },
    /// A committed reservation window closing at this node.
    ReservationEnd { node: NodeId, reservation: ReservationId },
    /// The application on a router issuing its next request.
    AppNextRequest { node: NodeId },
    /// A BB84 sender moving to basis reconciliation after its pulse train.
    Bb84Conclude { node: NodeId },
}

/// A discrete event in the simulation.
///
/// Events are created through [`Timeline::schedule`], mutated only by
/// cancellation, and destroyed after execution.
///
/// [`Timeline::schedule`]: crate::simulation::Timeline::schedule
#[derive(Debug, Clone)]
pub struct Event {
    pub id: EventId,
    /// Virtual time at which this event executes.
    pub time: Time,
    /// Secondary key: lower runs first among same-time events.
    pub priority: u32,
    /// Insertion sequence number, the final tie-breaker (FIFO).
    pub(crate) seq: u64,
    pub payload: EventPayload,
}

impl Event {
    fn key(&self) -> (Time, u32, u64) {
        (self.time, self.priority, self.seq)
    }
}

// Ordering is (time, priority, seq), inverted so BinaryHeap pops the
// minimum key first.
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}
