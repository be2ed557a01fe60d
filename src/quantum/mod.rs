pub mod state;

pub use state::{fidelity_after_decoherence, Basis, PauliError, Qubit};
