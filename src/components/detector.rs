use std::collections::BTreeMap;

use rand::Rng;

use super::photon::{HeraldKey, MemoryRef};
use crate::network::NodeId;
use crate::simulation::{EventPayload, SimRng, Time, Timeline};

/// A single-photon detector with finite efficiency, dead time, timing
/// jitter quantization, and dark counts.
#[derive(Debug, Clone)]
pub struct Detector {
    pub efficiency: f64,
    pub dark_count_rate_hz: f64,
    pub time_resolution_ps: Time,
    pub count_rate_hz: f64,
    /// Earliest time the next click is accepted (dead-time gate).
    next_allowed: Time,
    pub clicks: u64,
}

impl Detector {
    pub fn new(
        efficiency: f64,
        dark_count_rate_hz: f64,
        time_resolution_ps: Time,
        count_rate_hz: f64,
    ) -> Self {
        Detector {
            efficiency,
            dark_count_rate_hz,
            time_resolution_ps: time_resolution_ps.max(1),
            count_rate_hz,
            next_allowed: 0,
            clicks: 0,
        }
    }

    /// Unit efficiency, no dark counts, 1 ps resolution. Used by perfect-
    /// network experiments.
    pub fn perfect() -> Self {
        Detector::new(1.0, 0.0, 1, 1e12)
    }

    fn dead_time_ps(&self) -> Time {
        if self.count_rate_hz > 0.0 {
            (1e12 / self.count_rate_hz).round() as Time
        } else {
            0
        }
    }

    fn quantize(&self, time: Time) -> Time {
        let res = self.time_resolution_ps;
        (time + res / 2) / res * res
    }

    /// A photon hits the detector: click with probability `efficiency`,
    /// unless still inside the dead time of the previous click. Returns
    /// the quantized click time.
    pub fn try_detect(&mut self, now: Time, rng: &mut SimRng) -> Option<Time> {
        if now < self.next_allowed {
            return None;
        }
        if rng.random::<f64>() >= self.efficiency {
            return None;
        }
        self.register_click(now)
    }

    /// A pre-scheduled dark count firing. No efficiency draw; the rate
    /// already describes observed clicks.
    pub fn dark_click(&mut self, now: Time) -> Option<Time> {
        if now < self.next_allowed {
            return None;
        }
        self.register_click(now)
    }

    fn register_click(&mut self, now: Time) -> Option<Time> {
        self.next_allowed = now + self.dead_time_ps();
        self.clicks += 1;
        Some(self.quantize(now))
    }

    pub fn set_param(&mut self, name: &str, value: f64) {
        match name {
            "efficiency" => self.efficiency = value,
            "dark_count" => self.dark_count_rate_hz = value,
            "count_rate" => self.count_rate_hz = value,
            "time_resolution" => self.time_resolution_ps = (value.round() as Time).max(1),
            other => panic!("unknown detector parameter `{}`", other),
        }
    }
}

/// Pre-schedule a detector's dark counts as a Poisson process over the
/// remaining runtime, quantized to the detector's resolution.
pub fn schedule_dark_counts(
    tl: &mut Timeline,
    node: NodeId,
    detector: usize,
    rate_hz: f64,
    resolution_ps: Time,
) {
    if rate_hz <= 0.0 || tl.runtime() == Time::MAX {
        return;
    }
    let res = resolution_ps.max(1);
    let mut t = tl.now() as f64;
    let end = tl.runtime() as f64;
    loop {
        let u: f64 = tl.rng().random();
        t += -(1.0 - u).ln() / rate_hz * 1e12;
        if t > end {
            break;
        }
        let quantized = (t.round() as Time + res / 2) / res * res;
        tl.schedule(quantized, EventPayload::DarkCount { node, detector });
    }
}

/// Outcome of one Bell-state measurement window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BsmOutcome {
    PsiPlus,
    PsiMinus,
    /// Detector pattern did not identify a Bell state; the attempt failed.
    Ambiguous,
}

impl BsmOutcome {
    pub fn is_success(self) -> bool {
        !matches!(self, BsmOutcome::Ambiguous)
    }
}

#[derive(Debug, Clone)]
pub struct PhotonArrival {
    pub time: Time,
    pub origin: MemoryRef,
    pub fidelity: f64,
    pub is_null: bool,
}

/// Result of resolving one detection window.
#[derive(Debug, Clone)]
pub struct BsmResult {
    /// Memories whose photons participated, null emissions included.
    pub participants: Vec<MemoryRef>,
    pub outcome: BsmOutcome,
    /// Fidelity of the created pair (product of the photon fidelities).
    pub fidelity: f64,
}

/// A Bell-state-measurement station: two input detectors and a detection
/// window per heralded attempt.
///
/// Linear-optics BSM distinguishes at most two of the four Bell states, so
/// even with ideal hardware half the coincidences resolve as ambiguous.
#[derive(Debug)]
pub struct BsmStation {
    pub name: String,
    pub detectors: [Detector; 2],
    pub resolution_ps: Time,
    pending: BTreeMap<HeraldKey, Vec<PhotonArrival>>,
}

impl BsmStation {
    pub fn new(name: impl Into<String>) -> Self {
        BsmStation {
            name: name.into(),
            detectors: [Detector::perfect(), Detector::perfect()],
            resolution_ps: 1,
            pending: BTreeMap::new(),
        }
    }

    /// Broadcast a parameter change to both detectors.
    pub fn update_detectors_params(&mut self, name: &str, value: f64) {
        for det in &mut self.detectors {
            det.set_param(name, value);
        }
        if name == "time_resolution" {
            self.resolution_ps = (value.round() as Time).max(1);
        }
    }

    /// Record one photon arrival. Returns true when this is the first
    /// arrival of its window, in which case the caller schedules the
    /// window-close event.
    pub fn receive(&mut self, herald: HeraldKey, arrival: PhotonArrival) -> bool {
        let slot = self.pending.entry(herald).or_default();
        slot.push(arrival);
        slot.len() == 1
    }

    /// Close the window for `herald` and decide the outcome. Success
    /// requires both photons present and real, both detectors clicking,
    /// and the 0.5 linear-optics ceiling.
    pub fn resolve(&mut self, herald: HeraldKey, now: Time, rng: &mut SimRng) -> Option<BsmResult> {
        let arrivals = self.pending.remove(&herald)?;
        let participants: Vec<MemoryRef> = arrivals.iter().map(|a| a.origin.clone()).collect();

        let mut outcome = BsmOutcome::Ambiguous;
        let mut fidelity = 0.0;
        let real: Vec<&PhotonArrival> = arrivals.iter().filter(|a| !a.is_null).collect();
        if real.len() == 2
            && real[0].time.abs_diff(real[1].time) <= self.resolution_ps
            && self.detectors[0].try_detect(now, rng).is_some()
            && self.detectors[1].try_detect(now, rng).is_some()
        {
            // One draw covers both the 0.5 ceiling and the Ψ+/Ψ- split.
            let u: f64 = rng.random();
            outcome = if u < 0.25 {
                BsmOutcome::PsiPlus
            } else if u < 0.5 {
                BsmOutcome::PsiMinus
            } else {
                BsmOutcome::Ambiguous
            };
            fidelity = real[0].fidelity * real[1].fidelity;
        }
        Some(BsmResult {
            participants,
            outcome,
            fidelity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arrival(node: &str, index: usize, time: Time, is_null: bool) -> PhotonArrival {
        PhotonArrival {
            time,
            origin: MemoryRef {
                node: node.into(),
                index,
            },
            fidelity: 0.9,
            is_null,
        }
    }

    #[test]
    fn test_perfect_detector_always_clicks() {
        let mut det = Detector::perfect();
        let mut rng = SimRng::seeded(0);
        assert_eq!(det.try_detect(1000, &mut rng), Some(1000));
        assert_eq!(det.clicks, 1);
    }

    #[test]
    fn test_dead_time_drops_fast_pairs() {
        // 1e9 Hz count rate: 1000 ps dead time.
        let mut det = Detector::new(1.0, 0.0, 1, 1e9);
        let mut rng = SimRng::seeded(0);
        assert!(det.try_detect(0, &mut rng).is_some());
        assert!(det.try_detect(500, &mut rng).is_none());
        assert!(det.try_detect(1000, &mut rng).is_some());
    }

    #[test]
    fn test_click_time_quantization() {
        let mut det = Detector::new(1.0, 0.0, 10, 1e12);
        let mut rng = SimRng::seeded(0);
        assert_eq!(det.try_detect(104, &mut rng), Some(100));
        assert_eq!(det.try_detect(1996, &mut rng), Some(2000));
    }

    #[test]
    fn test_zero_efficiency_never_clicks() {
        let mut det = Detector::new(0.0, 0.0, 1, 1e12);
        let mut rng = SimRng::seeded(0);
        for t in 0..100 {
            assert!(det.try_detect(t * 10, &mut rng).is_none());
        }
    }

    #[test]
    fn test_dark_counts_follow_runtime_window() {
        let mut tl = Timeline::new(crate::simulation::SECOND / 1000, 7);
        schedule_dark_counts(&mut tl, 0, 0, 1e6, 10);
        // 1 MHz over a millisecond: on the order of a thousand events.
        let n = tl.pending_events();
        assert!(n > 500 && n < 2000, "unexpected dark count volume: {}", n);
    }

    #[test]
    fn test_zero_rate_schedules_nothing() {
        let mut tl = Timeline::new(crate::simulation::SECOND, 7);
        schedule_dark_counts(&mut tl, 0, 0, 0.0, 10);
        assert_eq!(tl.pending_events(), 0);
    }

    #[test]
    fn test_bsm_single_arrival_is_ambiguous() {
        let mut bsm = BsmStation::new("m1.bsm");
        let mut rng = SimRng::seeded(0);
        let herald = HeraldKey {
            reservation: 1,
            attempt: 0,
        };
        assert!(bsm.receive(herald, arrival("a", 0, 100, false)));
        let res = bsm.resolve(herald, 101, &mut rng).unwrap();
        assert_eq!(res.outcome, BsmOutcome::Ambiguous);
        assert_eq!(res.participants.len(), 1);
    }

    #[test]
    fn test_bsm_null_photon_cannot_herald() {
        let mut bsm = BsmStation::new("m1.bsm");
        let mut rng = SimRng::seeded(0);
        let herald = HeraldKey {
            reservation: 1,
            attempt: 1,
        };
        assert!(bsm.receive(herald, arrival("a", 0, 100, false)));
        assert!(!bsm.receive(herald, arrival("b", 0, 100, true)));
        let res = bsm.resolve(herald, 101, &mut rng).unwrap();
        assert_eq!(res.outcome, BsmOutcome::Ambiguous);
        assert_eq!(res.participants.len(), 2);
    }

    #[test]
    fn test_bsm_success_rate_is_bounded_by_half() {
        let mut bsm = BsmStation::new("m1.bsm");
        let mut rng = SimRng::seeded(11);
        let mut successes = 0;
        let trials = 2000;
        for i in 0..trials {
            let herald = HeraldKey {
                reservation: 1,
                attempt: i,
            };
            let t = 100 + i * 100;
            bsm.receive(herald, arrival("a", 0, t, false));
            bsm.receive(herald, arrival("b", 0, t, false));
            let res = bsm.resolve(herald, t + 1, &mut rng).unwrap();
            if res.outcome.is_success() {
                successes += 1;
                assert!((res.fidelity - 0.81).abs() < 1e-12);
            }
        }
        let rate = successes as f64 / trials as f64;
        assert!(rate > 0.4 && rate < 0.6, "rate {} outside 0.5 band", rate);
    }

    #[test]
    fn test_bsm_resolve_consumes_window() {
        let mut bsm = BsmStation::new("m1.bsm");
        let mut rng = SimRng::seeded(0);
        let herald = HeraldKey {
            reservation: 2,
            attempt: 0,
        };
        bsm.receive(herald, arrival("a", 0, 50, false));
        assert!(bsm.resolve(herald, 51, &mut rng).is_some());
        assert!(bsm.resolve(herald, 52, &mut rng).is_none());
    }
}
