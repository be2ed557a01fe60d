pub mod bb84;
pub mod generation;
pub mod message;
pub mod purification;
pub mod reservation;
pub mod swapping;

pub use generation::{EntanglementGeneration, GenRole, GenState};
pub use message::{Bb84Message, Message};
pub use reservation::{AcceptedReservation, Reservation, ReservationId, ResourceReservation};
pub use swapping::EntanglementSwapping;
