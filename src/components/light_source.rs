use rand::Rng;

use super::photon::{Encoding, Photon, DEFAULT_WAVELENGTH_NM};
use crate::quantum::Basis;
use crate::simulation::{SimRng, Time};

/// A weak-coherent pulsed light source.
///
/// Each pulse carries a Poisson-distributed photon number around
/// `mean_photon_num`; most slots are vacuum at the usual 0.1 mean.
#[derive(Debug, Clone)]
pub struct LightSource {
    pub name: String,
    pub frequency_hz: f64,
    pub mean_photon_num: f64,
    pub wavelength_nm: f64,
    pub encoding: Encoding,
    pub photons_emitted: u64,
}

impl LightSource {
    pub fn new(name: impl Into<String>, frequency_hz: f64, mean_photon_num: f64) -> Self {
        LightSource {
            name: name.into(),
            frequency_hz,
            mean_photon_num,
            wavelength_nm: DEFAULT_WAVELENGTH_NM,
            encoding: Encoding::Polarization,
            photons_emitted: 0,
        }
    }

    /// Spacing between pulses, picoseconds.
    pub fn period_ps(&self) -> Time {
        (1e12 / self.frequency_hz).round() as Time
    }

    /// Poisson sample by inversion; λ is small so the loop is short.
    pub fn sample_photon_count(&self, rng: &mut SimRng) -> u32 {
        let u: f64 = rng.random();
        let mut k = 0u32;
        let mut p = (-self.mean_photon_num).exp();
        let mut cumulative = p;
        while u > cumulative && k < 64 {
            k += 1;
            p *= self.mean_photon_num / f64::from(k);
            cumulative += p;
        }
        k
    }

    /// Fire one pulse encoding `bit` in `basis`. Returns `None` for a
    /// vacuum slot. Multi-photon pulses are emitted as one photon here;
    /// photon-number-splitting attacks are out of scope.
    pub fn emit_pulse(
        &mut self,
        name: impl Into<String>,
        bit: bool,
        basis: Basis,
        rng: &mut SimRng,
    ) -> Option<Photon> {
        if self.sample_photon_count(rng) == 0 {
            return None;
        }
        self.photons_emitted += 1;
        let mut photon = Photon::encoded(name, bit, basis);
        photon.wavelength_nm = self.wavelength_nm;
        photon.encoding = self.encoding;
        Some(photon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period() {
        let ls = LightSource::new("alice.lightsource", 2e6, 0.1);
        assert_eq!(ls.period_ps(), 500_000);
    }

    #[test]
    fn test_poisson_mean_tracks_parameter() {
        let ls = LightSource::new("ls", 2e6, 0.1);
        let mut rng = SimRng::seeded(5);
        let trials = 20_000;
        let total: u32 = (0..trials).map(|_| ls.sample_photon_count(&mut rng)).sum();
        let mean = f64::from(total) / f64::from(trials);
        assert!((mean - 0.1).abs() < 0.01, "sampled mean {}", mean);
    }

    #[test]
    fn test_high_mean_rarely_vacuum() {
        let mut ls = LightSource::new("ls", 2e6, 8.0);
        let mut rng = SimRng::seeded(5);
        let emitted = (0..200)
            .filter(|i| {
                ls.emit_pulse(i.to_string(), false, Basis::Rectilinear, &mut rng)
                    .is_some()
            })
            .count();
        assert!(emitted > 190);
    }
}
