use super::photon::MemoryRef;
use crate::network::NodeId;
use crate::protocols::reservation::ReservationId;
use crate::quantum::fidelity_after_decoherence;
use crate::simulation::{EventId, EventPayload, Time, Timeline};

/// Lifecycle of one quantum memory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryState {
    /// Empty and available.
    Raw,
    /// Claimed by a generation attempt whose photon is in flight.
    Occupied,
    /// Holding one half of an entangled pair.
    Entangled,
}

/// An addressable quantum memory with finite coherence time.
///
/// The `state` field is the single source of truth for the slot;
/// transitions are point-in-time and announce themselves by scheduling
/// either a continuation or an expiration timer.
#[derive(Debug)]
pub struct Memory {
    pub index: usize,
    pub frequency_hz: f64,
    pub efficiency: f64,
    /// Seconds; negative means the memory never decoheres.
    pub coherence_time_s: f64,
    /// Fidelity a freshly generated pair starts from.
    pub raw_fidelity: f64,
    pub state: MemoryState,
    /// Fidelity at `entangle_time`; read through `current_fidelity`.
    pub fidelity: f64,
    pub entangled_with: Option<MemoryRef>,
    pub entangle_time: Time,
    /// Pending self-expiration, cancellable on earlier transitions.
    expiration: Option<EventId>,
    /// Reservation currently holding this slot, if any.
    pub reservation: Option<ReservationId>,
}

impl Memory {
    pub fn new(index: usize) -> Self {
        Memory {
            index,
            frequency_hz: 8e7,
            efficiency: 1.0,
            coherence_time_s: -1.0,
            raw_fidelity: 1.0,
            state: MemoryState::Raw,
            fidelity: 0.0,
            entangled_with: None,
            entangle_time: 0,
            expiration: None,
            reservation: None,
        }
    }

    /// Claim a RAW slot for an in-flight generation attempt.
    pub fn occupy(&mut self) {
        assert!(
            self.state == MemoryState::Raw,
            "memory {} occupied while {:?}",
            self.index,
            self.state
        );
        self.state = MemoryState::Occupied;
    }

    /// Record a fresh entangled pair and arm the expiration timer.
    pub fn entangle(
        &mut self,
        tl: &mut Timeline,
        node: NodeId,
        partner: MemoryRef,
        fidelity: f64,
    ) {
        assert!(
            self.state != MemoryState::Entangled,
            "memory {} entangled twice",
            self.index
        );
        self.state = MemoryState::Entangled;
        self.fidelity = fidelity;
        self.entangled_with = Some(partner);
        self.entangle_time = tl.now();
        self.cancel_expiration(tl);
        if self.coherence_time_s >= 0.0 {
            let deadline = tl.now() + (self.coherence_time_s * 1e12).round() as Time;
            self.expiration = Some(tl.schedule(
                deadline,
                EventPayload::MemoryExpire {
                    node,
                    index: self.index,
                },
            ));
        }
    }

    /// Swap or purification moved this half onto a new partner. The
    /// expiration timer keeps running from the original entangle time.
    pub fn update_partner(&mut self, partner: MemoryRef, fidelity: f64) {
        assert!(
            self.state == MemoryState::Entangled,
            "memory {} repointed while {:?}",
            self.index,
            self.state
        );
        self.fidelity = fidelity;
        self.entangled_with = Some(partner);
    }

    /// Purification raised this pair's fidelity; decay restarts from now.
    pub fn refresh(&mut self, fidelity: f64, now: Time) {
        assert!(
            self.state == MemoryState::Entangled,
            "memory {} refreshed while {:?}",
            self.index,
            self.state
        );
        self.fidelity = fidelity;
        self.entangle_time = now;
    }

    /// Entangled-pair fidelity as of `now`, with decoherence applied.
    pub fn current_fidelity(&self, now: Time) -> f64 {
        if self.state != MemoryState::Entangled {
            return 0.0;
        }
        let elapsed_s = now.saturating_sub(self.entangle_time) as f64 / 1e12;
        fidelity_after_decoherence(self.fidelity, elapsed_s, self.coherence_time_s)
    }

    /// Return to RAW, dropping any entanglement and pending expiration.
    pub fn reset(&mut self, tl: &mut Timeline) {
        self.cancel_expiration(tl);
        self.state = MemoryState::Raw;
        self.fidelity = 0.0;
        self.entangled_with = None;
    }

    /// Coherence deadline reached. Returns the partner whose entanglement
    /// was broken so the owner can notify it.
    pub fn expire(&mut self) -> Option<MemoryRef> {
        if self.state != MemoryState::Entangled {
            return None;
        }
        self.expiration = None;
        self.state = MemoryState::Raw;
        self.fidelity = 0.0;
        self.entangled_with.take()
    }

    fn cancel_expiration(&mut self, tl: &mut Timeline) {
        if let Some(id) = self.expiration.take() {
            tl.cancel(id);
        }
    }

    pub fn set_param(&mut self, name: &str, value: f64) {
        match name {
            "frequency" => self.frequency_hz = value,
            "coherence_time" => self.coherence_time_s = value,
            "efficiency" => self.efficiency = value,
            "raw_fidelity" => self.raw_fidelity = value,
            other => panic!("unknown memory parameter `{}`", other),
        }
    }
}

/// The addressable memory bank of a quantum router.
#[derive(Debug)]
pub struct MemoryArray {
    pub name: String,
    memories: Vec<Memory>,
}

impl MemoryArray {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        MemoryArray {
            name: name.into(),
            memories: (0..size).map(Memory::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.memories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    pub fn get(&self, index: usize) -> &Memory {
        &self.memories[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Memory {
        &mut self.memories[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Memory> {
        self.memories.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Memory> {
        self.memories.iter_mut()
    }

    /// Broadcast a parameter change to every contained memory.
    pub fn update_memory_params(&mut self, name: &str, value: f64) {
        for memory in &mut self.memories {
            memory.set_param(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SECOND;

    fn partner() -> MemoryRef {
        MemoryRef {
            node: "r2".into(),
            index: 0,
        }
    }

    #[test]
    fn test_lifecycle_raw_occupied_entangled() {
        let mut tl = Timeline::new(SECOND, 0);
        let mut m = Memory::new(0);
        assert_eq!(m.state, MemoryState::Raw);
        m.occupy();
        assert_eq!(m.state, MemoryState::Occupied);
        m.reset(&mut tl);
        m.entangle(&mut tl, 0, partner(), 0.95);
        assert_eq!(m.state, MemoryState::Entangled);
        assert_eq!(m.entangled_with.as_ref().unwrap().node, "r2");
    }

    #[test]
    #[should_panic(expected = "occupied while")]
    fn test_double_occupy_panics() {
        let mut m = Memory::new(0);
        m.occupy();
        m.occupy();
    }

    #[test]
    fn test_infinite_coherence_schedules_no_expiration() {
        let mut tl = Timeline::new(SECOND, 0);
        let mut m = Memory::new(0);
        m.set_param("coherence_time", -1.0);
        m.entangle(&mut tl, 0, partner(), 1.0);
        assert_eq!(tl.pending_events(), 0);
        assert!((m.current_fidelity(SECOND) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_finite_coherence_arms_timer_and_reset_cancels() {
        let mut tl = Timeline::new(SECOND, 0);
        let mut m = Memory::new(0);
        m.set_param("coherence_time", 1e-6);
        m.entangle(&mut tl, 0, partner(), 1.0);
        assert_eq!(tl.pending_events(), 1);
        assert_eq!(tl.peek_next_time(), Some(1_000_000));

        m.reset(&mut tl);
        // The timer stays in the queue but is skipped at dequeue.
        assert!(tl.pop_next().is_none());
    }

    #[test]
    fn test_expire_breaks_entanglement() {
        let mut tl = Timeline::new(SECOND, 0);
        let mut m = Memory::new(0);
        m.set_param("coherence_time", 1e-6);
        m.entangle(&mut tl, 0, partner(), 1.0);
        let broken = m.expire().unwrap();
        assert_eq!(broken, partner());
        assert_eq!(m.state, MemoryState::Raw);
        assert_eq!(m.current_fidelity(0), 0.0);
    }

    #[test]
    fn test_decayed_fidelity_read() {
        let mut tl = Timeline::new(SECOND, 0);
        let mut m = Memory::new(0);
        m.set_param("coherence_time", 1.0);
        m.entangle(&mut tl, 0, partner(), 0.8);
        let read = m.current_fidelity(SECOND);
        assert!((read - 0.8 * (-1.0f64).exp()).abs() < 1e-9);
    }

    #[test]
    fn test_array_broadcast() {
        let mut array = MemoryArray::new("r1.memory_array", 4);
        array.update_memory_params("efficiency", 0.9);
        array.update_memory_params("raw_fidelity", 0.97);
        assert!(array
            .iter()
            .all(|m| (m.efficiency - 0.9).abs() < 1e-12 && (m.raw_fidelity - 0.97).abs() < 1e-12));
    }
}
