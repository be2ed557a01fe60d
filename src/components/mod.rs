pub mod channel;
pub mod detector;
pub mod light_source;
pub mod memory;
pub mod photon;

pub use channel::{ChannelId, ClassicalChannel, QuantumChannel, LIGHT_SPEED_M_PER_PS};
pub use detector::{BsmOutcome, BsmResult, BsmStation, Detector};
pub use light_source::LightSource;
pub use memory::{Memory, MemoryArray, MemoryState};
pub use photon::{Encoding, HeraldKey, MemoryRef, Photon};
