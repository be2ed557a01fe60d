use crate::components::detector::BsmOutcome;
use crate::components::photon::{HeraldKey, MemoryRef};
use crate::protocols::reservation::{Reservation, ReservationId};
use crate::quantum::Basis;
use crate::simulation::Time;

/// Every classical frame exchanged between nodes, as one tagged variant.
///
/// Protocol layers within a router talk by direct calls; peers talk by
/// sending one of these over a classical channel.
#[derive(Debug, Clone)]
pub enum Message {
    /// Reservation flooding toward the responder. `path` accumulates the
    /// routers traversed so far.
    ReserveRequest {
        reservation: Reservation,
        path: Vec<String>,
    },
    /// Responder accepted; commits propagate back along `path`.
    ReserveApprove {
        reservation: Reservation,
        path: Vec<String>,
    },
    /// Some hop refused; tentative claims release back along `path`.
    ReserveReject {
        reservation: Reservation,
        path: Vec<String>,
    },

    /// Generation initiator proposing a heralded attempt: both photons
    /// should reach the BSM at `bsm_arrival`.
    GenNegotiate {
        herald: HeraldKey,
        middle: String,
        bsm_arrival: Time,
    },
    /// Responder has no free memory (or the slot already passed).
    GenNegotiateReject { herald: HeraldKey },
    /// The middle node announcing one detection window's outcome to both
    /// emitting routers.
    EntMeasRes {
        herald: HeraldKey,
        outcome: BsmOutcome,
        fidelity: f64,
        participants: Vec<MemoryRef>,
    },

    /// Swap node telling a remote endpoint where its half now points.
    /// `memory_index` addresses the receiver's own memory.
    SwapRes {
        reservation: ReservationId,
        memory_index: usize,
        success: bool,
        new_partner: Option<MemoryRef>,
        new_fidelity: f64,
    },

    /// Purification verdict from the reservation initiator. Indices
    /// address the receiver's memories: `kept` survives (on success) with
    /// `new_fidelity`, `sacrificed` resets either way.
    PurifyRes {
        reservation: ReservationId,
        kept: usize,
        sacrificed: usize,
        success: bool,
        new_fidelity: f64,
    },

    /// A remote memory holding the other half of a pair decohered.
    EntanglementExpired { memory_index: usize },

    /// BB84 post-processing frames.
    Bb84(Bb84Message),

    /// Opaque application payload, delivered to the endpoint log.
    Raw(String),
}

#[derive(Debug, Clone)]
pub enum Bb84Message {
    /// Sender's basis choice per pulse round.
    Bases { bases: Vec<Basis> },
    /// Receiver's sifted rounds and measured bits for error estimation.
    Sifted { rounds: Vec<u64>, bits: Vec<bool> },
}
