use std::collections::{BinaryHeap, HashSet};

use tracing::debug;

use super::event::{Event, EventId, EventPayload, Time, DEFAULT_PRIORITY};
use super::random::SimRng;
use crate::error::SimError;
use crate::network::Network;

/// Counters maintained by the kernel across a run.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimelineStats {
    pub scheduled: u64,
    pub executed: u64,
    pub skipped_cancelled: u64,
}

/// The virtual-time event kernel: a monotonic clock, a min-heap of pending
/// events keyed by `(time, priority, insertion sequence)`, and the seeded
/// randomness service every component draws from.
pub struct Timeline {
    time: Time,
    runtime: Time,
    queue: BinaryHeap<Event>,
    next_seq: u64,
    next_id: u64,
    cancelled: HashSet<EventId>,
    stopped: bool,
    rng: SimRng,
    stats: TimelineStats,
}

impl Timeline {
    /// Create a timeline capped at `runtime` picoseconds of virtual time,
    /// with all randomness derived from `seed`.
    pub fn new(runtime: Time, seed: u64) -> Self {
        Timeline {
            time: 0,
            runtime,
            queue: BinaryHeap::new(),
            next_seq: 0,
            next_id: 0,
            cancelled: HashSet::new(),
            stopped: false,
            rng: SimRng::seeded(seed),
            stats: TimelineStats::default(),
        }
    }

    /// Current virtual time in picoseconds.
    pub fn now(&self) -> Time {
        self.time
    }

    pub fn runtime(&self) -> Time {
        self.runtime
    }

    /// Schedule `payload` at `time` with default priority.
    ///
    /// `time` must be `>= now()`; same-time events execute after the
    /// current handler, in insertion order. Scheduling into the past is an
    /// invariant violation and panics.
    pub fn schedule(&mut self, time: Time, payload: EventPayload) -> EventId {
        self.schedule_with_priority(time, DEFAULT_PRIORITY, payload)
    }

    pub fn schedule_with_priority(
        &mut self,
        time: Time,
        priority: u32,
        payload: EventPayload,
    ) -> EventId {
        assert!(
            time >= self.time,
            "event scheduled at {} ps but the clock is already at {} ps",
            time,
            self.time
        );
        let id = EventId(self.next_id);
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Event {
            id,
            time,
            priority,
            seq,
            payload,
        });
        self.stats.scheduled += 1;
        id
    }

    /// Mark an event cancelled. It stays in the queue and is dropped at
    /// dequeue without advancing the clock.
    pub fn cancel(&mut self, id: EventId) {
        self.cancelled.insert(id);
    }

    /// Ask `run()` to return after the current event finishes.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// The randomness service. Components draw through this in dispatch
    /// order, which is what makes runs reproducible.
    pub fn rng(&mut self) -> &mut SimRng {
        &mut self.rng
    }

    /// Number of events still in the queue, cancelled ones included.
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// Execution time of the next live event, if any.
    pub fn peek_next_time(&self) -> Option<Time> {
        self.queue.peek().map(|e| e.time)
    }

    pub fn stats(&self) -> TimelineStats {
        self.stats
    }

    /// Pop the next live event without advancing the clock. Cancelled
    /// entries are discarded here.
    pub fn pop_next(&mut self) -> Option<Event> {
        while let Some(event) = self.queue.pop() {
            if self.cancelled.remove(&event.id) {
                self.stats.skipped_cancelled += 1;
                continue;
            }
            return Some(event);
        }
        None
    }

    /// Advance the clock to `time`. The clock is monotonically
    /// non-decreasing across a run; going backwards is fatal.
    pub fn advance_to(&mut self, time: Time) {
        assert!(
            time >= self.time,
            "clock would move backwards: {} ps -> {} ps",
            self.time,
            time
        );
        self.time = time;
    }

    pub(crate) fn mark_executed(&mut self) {
        self.stats.executed += 1;
    }
}

/// A complete simulation: the event kernel plus the entity graph it
/// drives. Events pop off the timeline and dispatch into the network;
/// handlers mutate entity state, schedule further events, and send
/// messages, which schedule receive events.
pub struct Simulation {
    pub timeline: Timeline,
    pub network: Network,
    initialized: bool,
}

impl Simulation {
    pub fn new(runtime: Time, seed: u64) -> Self {
        Simulation {
            timeline: Timeline::new(runtime, seed),
            network: Network::new(),
            initialized: false,
        }
    }

    /// Invoke every entity's init hook, in registration order, exactly
    /// once. A second call is an error rather than a silent re-init.
    pub fn init(&mut self) -> Result<(), SimError> {
        if self.initialized {
            return Err(SimError::AlreadyInitialized);
        }
        self.initialized = true;
        self.network.init_all(&mut self.timeline);
        Ok(())
    }

    /// Execute events in `(time, priority, insertion order)` order until
    /// the queue drains, the runtime cap is reached, or `stop()` is called
    /// from a handler. An empty queue returns immediately with the clock
    /// untouched.
    pub fn run(&mut self) -> Result<(), SimError> {
        if !self.initialized {
            return Err(SimError::NotInitialized);
        }
        while let Some(event) = self.timeline.pop_next() {
            if event.time > self.timeline.runtime() {
                break;
            }
            self.timeline.advance_to(event.time);
            self.timeline.mark_executed();
            self.network.handle(&mut self.timeline, event.payload);
            if self.timeline.is_stopped() {
                break;
            }
        }
        debug!(
            executed = self.timeline.stats().executed,
            now = self.timeline.now(),
            "run finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::event::SECOND;

    fn payload() -> EventPayload {
        EventPayload::MemoryExpire { node: 0, index: 0 }
    }

    #[test]
    fn test_clock_starts_at_zero() {
        let tl = Timeline::new(SECOND, 0);
        assert_eq!(tl.now(), 0);
        assert_eq!(tl.pending_events(), 0);
    }

    #[test]
    fn test_events_pop_in_time_order() {
        let mut tl = Timeline::new(SECOND, 0);
        tl.schedule(300, payload());
        tl.schedule(100, payload());
        tl.schedule(200, payload());

        assert_eq!(tl.pop_next().unwrap().time, 100);
        assert_eq!(tl.pop_next().unwrap().time, 200);
        assert_eq!(tl.pop_next().unwrap().time, 300);
        assert!(tl.pop_next().is_none());
    }

    #[test]
    fn test_cancelled_event_is_skipped() {
        let mut tl = Timeline::new(SECOND, 0);
        let keep = tl.schedule(100, payload());
        let drop = tl.schedule(50, payload());
        tl.cancel(drop);

        let next = tl.pop_next().unwrap();
        assert_eq!(next.id, keep);
        assert_eq!(tl.stats().skipped_cancelled, 1);
        // The clock did not advance while skipping.
        assert_eq!(tl.now(), 0);
    }

    #[test]
    #[should_panic(expected = "already at")]
    fn test_scheduling_into_the_past_panics() {
        let mut tl = Timeline::new(SECOND, 0);
        tl.schedule(100, payload());
        tl.advance_to(100);
        tl.schedule(99, payload());
    }

    #[test]
    fn test_empty_run_returns_immediately() {
        let mut sim = Simulation::new(SECOND, 0);
        sim.init().unwrap();
        sim.run().unwrap();
        assert_eq!(sim.timeline.now(), 0);
    }

    #[test]
    fn test_double_init_is_an_error() {
        let mut sim = Simulation::new(SECOND, 0);
        sim.init().unwrap();
        assert!(matches!(sim.init(), Err(SimError::AlreadyInitialized)));
    }

    #[test]
    fn test_run_before_init_is_an_error() {
        let mut sim = Simulation::new(SECOND, 0);
        assert!(matches!(sim.run(), Err(SimError::NotInitialized)));
    }

    #[test]
    fn test_stop_returns_after_the_current_event() {
        let mut sim = Simulation::new(SECOND, 0);
        sim.network.add_endpoint("probe").unwrap();
        sim.timeline.schedule(10, payload());
        sim.timeline.schedule(20, payload());
        sim.timeline.stop();
        sim.init().unwrap();
        sim.run().unwrap();
        assert_eq!(sim.timeline.stats().executed, 1);
        assert_eq!(sim.timeline.pending_events(), 1);
    }

    #[test]
    fn test_runtime_caps_execution() {
        let mut sim = Simulation::new(1_000, 0);
        sim.network.add_endpoint("probe").unwrap();
        sim.timeline.schedule(500, payload());
        sim.timeline.schedule(2_000, payload());
        sim.init().unwrap();
        sim.run().unwrap();
        // The event past the cap was not executed and the clock stayed put.
        assert_eq!(sim.timeline.now(), 500);
        assert_eq!(sim.timeline.stats().executed, 1);
    }
}
