use std::f64::consts::FRAC_1_SQRT_2;

use ndarray::{Array1, Array2};
use num_complex::Complex64;
use rand::Rng;

use crate::simulation::SimRng;

/// Measurement basis for polarization-encoded photons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Basis {
    /// Z basis: |0⟩ / |1⟩.
    Rectilinear,
    /// X basis: |+⟩ / |−⟩.
    Diagonal,
}

/// A Pauli error picked up by a photon in transit.
///
/// A bit flip corrupts rectilinear-encoded bits, a phase flip corrupts
/// diagonal-encoded bits, and the combined flip corrupts both, which is
/// why depolarization shows up as errors in either BB84 basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauliError {
    BitFlip,
    PhaseFlip,
    BitPhaseFlip,
}

impl PauliError {
    /// Uniform draw over the three flips, for depolarizing channels.
    pub fn sample(rng: &mut SimRng) -> Self {
        match rng.random_range(0..3) {
            0 => PauliError::BitFlip,
            1 => PauliError::PhaseFlip,
            _ => PauliError::BitPhaseFlip,
        }
    }

    fn matrix(self) -> Array2<Complex64> {
        let zero = Complex64::new(0.0, 0.0);
        let one = Complex64::new(1.0, 0.0);
        let i = Complex64::new(0.0, 1.0);
        match self {
            PauliError::BitFlip => ndarray::array![[zero, one], [one, zero]],
            PauliError::PhaseFlip => ndarray::array![[one, zero], [zero, -one]],
            PauliError::BitPhaseFlip => ndarray::array![[zero, -i], [i, zero]],
        }
    }
}

/// A single qubit state represented as a state vector.
///
/// This is the only amplitude-level state the simulator tracks, and it
/// exists for the photon encodings: states are prepared with [`encode`],
/// read out with [`measure`], and corrupted with [`apply_error`].
/// Entangled pairs are represented by fidelity scalars plus partner
/// references on the memories that hold them.
///
/// [`encode`]: Qubit::encode
/// [`measure`]: Qubit::measure
/// [`apply_error`]: Qubit::apply_error
#[derive(Debug, Clone)]
pub struct Qubit {
    /// State vector: [α, β] for α|0⟩ + β|1⟩
    pub state: Array1<Complex64>,
}

impl Qubit {
    /// Prepare a classical bit in the given basis. The four BB84 states
    /// come out of this one table.
    pub fn encode(bit: bool, basis: Basis) -> Self {
        let h = FRAC_1_SQRT_2;
        let (alpha, beta) = match (basis, bit) {
            (Basis::Rectilinear, false) => (1.0, 0.0),
            (Basis::Rectilinear, true) => (0.0, 1.0),
            (Basis::Diagonal, false) => (h, h),
            (Basis::Diagonal, true) => (h, -h),
        };
        Qubit {
            state: ndarray::array![Complex64::new(alpha, 0.0), Complex64::new(beta, 0.0)],
        }
    }

    /// The vacuum-fresh default state, |0⟩.
    pub fn new_zero() -> Self {
        Qubit::encode(false, Basis::Rectilinear)
    }

    /// Squared inner product |⟨other|self⟩|²: the probability of finding
    /// `self` in `other`'s state on a projective measurement.
    pub fn overlap(&self, other: &Qubit) -> f64 {
        let inner: Complex64 = other
            .state
            .iter()
            .zip(self.state.iter())
            .map(|(a, b)| a.conj() * b)
            .sum();
        inner.norm_sqr()
    }

    /// Probability of reading bit 0 in the rectilinear basis.
    pub fn prob_zero(&self) -> f64 {
        self.overlap(&Qubit::encode(false, Basis::Rectilinear))
    }

    /// Check if state is normalized (should always be ~1.0)
    pub fn is_normalized(&self) -> bool {
        (self.overlap(self) - 1.0).abs() < 1e-10
    }

    /// Projective measurement in `basis` by the Born rule: the outcome
    /// probability is the overlap with that basis's bit-1 state, and the
    /// qubit collapses onto the observed encoding.
    ///
    /// Randomness comes from the timeline's seeded generator so outcomes
    /// are reproducible across runs.
    pub fn measure(&mut self, basis: Basis, rng: &mut SimRng) -> bool {
        let p_one = self.overlap(&Qubit::encode(true, basis));
        let result = rng.random::<f64>() < p_one;
        *self = Qubit::encode(result, basis);
        result
    }

    /// Apply a transit error to the carried state.
    pub fn apply_error(&mut self, error: PauliError) {
        self.state = error.matrix().dot(&self.state);
    }
}

/// Fidelity after decoherence: F(t) = F₀ · e^(−t/T_coh).
///
/// Used when reading an entangled memory's fidelity some time after the
/// pair was established.
pub fn fidelity_after_decoherence(initial: f64, elapsed_s: f64, coherence_s: f64) -> f64 {
    if coherence_s < 0.0 {
        // Negative coherence time means the memory never decoheres.
        return initial;
    }
    initial * (-elapsed_s / coherence_s).exp()
}
