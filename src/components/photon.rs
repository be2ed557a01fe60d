use crate::protocols::reservation::ReservationId;
use crate::quantum::{Basis, Qubit};

/// Default telecom wavelength in nanometers.
pub const DEFAULT_WAVELENGTH_NM: f64 = 1550.0;

/// How a photon carries its qubit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Polarization,
    TimeBin,
}

/// Address of one quantum memory slot in the network.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemoryRef {
    pub node: String,
    pub index: usize,
}

/// Correlates the two photons of one heralded generation attempt across
/// the midpoint BSM. The attempt field embeds the initiating router's id
/// in its upper bits, so keys are unique network-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeraldKey {
    pub reservation: ReservationId,
    pub attempt: u64,
}

/// A single photon in flight.
///
/// A null photon represents vacuum (no emission this slot) but traverses
/// channels identically so arrival timing stays aligned; it draws no loss
/// randomness on the way.
#[derive(Debug, Clone)]
pub struct Photon {
    pub name: String,
    pub wavelength_nm: f64,
    /// Node currently holding the photon; updated on delivery.
    pub location: Option<String>,
    pub encoding: Encoding,
    pub state: Qubit,
    /// Memory slot this photon was emitted from, for heralded generation.
    pub origin: Option<MemoryRef>,
    /// Generation attempt this photon belongs to, if heralded.
    pub herald: Option<HeraldKey>,
    /// Fidelity the emitting memory would contribute to a pair.
    pub fidelity: f64,
    pub is_null: bool,
}

impl Photon {
    pub fn new(name: impl Into<String>) -> Self {
        Photon {
            name: name.into(),
            wavelength_nm: DEFAULT_WAVELENGTH_NM,
            location: None,
            encoding: Encoding::Polarization,
            state: Qubit::new_zero(),
            origin: None,
            herald: None,
            fidelity: 1.0,
            is_null: false,
        }
    }

    /// BB84 state preparation: encode one classical bit in a basis.
    pub fn encoded(name: impl Into<String>, bit: bool, basis: Basis) -> Self {
        let mut photon = Photon::new(name);
        photon.state = Qubit::encode(bit, basis);
        photon
    }

    /// A photon emitted from a memory for one heralded generation attempt.
    pub fn heralded(origin: MemoryRef, herald: HeraldKey, fidelity: f64) -> Self {
        let mut photon = Photon::new(format!("{}[{}]", origin.node, origin.index));
        photon.origin = Some(origin);
        photon.herald = Some(herald);
        photon.fidelity = fidelity;
        photon
    }

    /// The vacuum stand-in for a failed emission, keeping slot timing.
    pub fn null(origin: MemoryRef, herald: HeraldKey) -> Self {
        let mut photon = Photon::heralded(origin, herald, 0.0);
        photon.is_null = true;
        photon
    }
}
